//! The JNI bridge of the Android runtime.
//!
//! ART exports its JNI implementation as `art::JNI<..>::Name(..)`, so symbols are demangled
//! before lookup. Besides the functions decoded one by one, the large overload families
//! (`Call<Type>Method[V|A]`, `Get<Type>Field`, `New<Type>Array`, ...) share one decoder
//! per family.

use core::fmt::Write as _;

#[allow(clippy::enum_glob_use)]
use super::ArgKind::*;
use super::{Arg, ArgKind, DecodeContext, Decoder, ReturnType, Signature};

/// Most `JNINativeMethod` entries rendered
const MAX_NATIVE_METHODS: usize = 16;

decoder_table! {
    /// A JNI function decoded on its own
    pub enum JniFunction {
        GetVersion = "GetVersion"(env: Hex) -> Number,
        FindClass = "FindClass"(env: Hex, name: Str) -> Number,
        GetMethodId = "GetMethodID"(env: Hex, clazz: JniRef, name: Str, sig: Str) -> Number,
        GetStaticMethodId = "GetStaticMethodID"(env: Hex, clazz: JniRef, name: Str, sig: Str) -> Number,
        GetFieldId = "GetFieldID"(env: Hex, clazz: JniRef, name: Str, sig: Str) -> Number,
        GetStaticFieldId = "GetStaticFieldID"(env: Hex, clazz: JniRef, name: Str, sig: Str) -> Number,
        NewStringUtf = "NewStringUTF"(env: Hex, bytes: Str) -> Number,
        GetStringUtfChars = "GetStringUTFChars"(env: Hex, string: JniRef, is_copy: Ptr) -> String,
        ReleaseStringUtfChars = "ReleaseStringUTFChars"(env: Hex, string: JniRef, utf: Str) -> Void,
        GetStringUtfLength = "GetStringUTFLength"(env: Hex, string: JniRef) -> Number,
        GetStringLength = "GetStringLength"(env: Hex, string: JniRef) -> Number,
        GetArrayLength = "GetArrayLength"(env: Hex, array: JniRef) -> Number,
        RegisterNatives = "RegisterNatives"(env: Hex, clazz: JniRef, methods: JniNatives(3), n_methods: Int) -> Number,
        GetObjectClass = "GetObjectClass"(env: Hex, obj: JniRef) -> Number,
        IsInstanceOf = "IsInstanceOf"(env: Hex, obj: JniRef, clazz: JniRef) -> Number,
        NewGlobalRef = "NewGlobalRef"(env: Hex, obj: JniRef) -> Number,
        DeleteGlobalRef = "DeleteGlobalRef"(env: Hex, obj: JniRef) -> Void,
        NewLocalRef = "NewLocalRef"(env: Hex, obj: JniRef) -> Number,
        DeleteLocalRef = "DeleteLocalRef"(env: Hex, obj: JniRef) -> Void,
        ExceptionCheck = "ExceptionCheck"(env: Hex) -> Number,
        ExceptionOccurred = "ExceptionOccurred"(env: Hex) -> Number,
        ExceptionClear = "ExceptionClear"(env: Hex) -> Void,
        ExceptionDescribe = "ExceptionDescribe"(env: Hex) -> Void,
        Throw = "Throw"(env: Hex, obj: JniRef) -> Number,
        ThrowNew = "ThrowNew"(env: Hex, clazz: JniRef, message: Str) -> Number,
        NewObject = "NewObject"(env: Hex, clazz: JniRef, method_id: JniRef) -> Number,
        NewObjectV = "NewObjectV"(env: Hex, clazz: JniRef, method_id: JniRef, args: Ptr) -> Number,
        NewObjectA = "NewObjectA"(env: Hex, clazz: JniRef, method_id: JniRef, args: Ptr) -> Number,
        GetJavaVm = "GetJavaVM"(env: Hex, vm: Ptr) -> Number,
    }
}

/// The Java type an overload family member works on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JniType {
    /// `jobject`
    Object,
    /// `jboolean`
    Boolean,
    /// `jbyte`
    Byte,
    /// `jchar`
    Char,
    /// `jshort`
    Short,
    /// `jint`
    Int,
    /// `jlong`
    Long,
    /// `jfloat`
    Float,
    /// `jdouble`
    Double,
    /// `void`, only for `Call*Method`
    Void,
}

impl JniType {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Object" => Self::Object,
            "Boolean" => Self::Boolean,
            "Byte" => Self::Byte,
            "Char" => Self::Char,
            "Short" => Self::Short,
            "Int" => Self::Int,
            "Long" => Self::Long,
            "Float" => Self::Float,
            "Double" => Self::Double,
            "Void" => Self::Void,
            _ => return None,
        })
    }

    // floating point results come back in FP registers
    fn return_type(self) -> ReturnType {
        match self {
            Self::Void => ReturnType::Void,
            Self::Float | Self::Double => ReturnType::Unknown,
            _ => ReturnType::Number,
        }
    }
}

/// Receiver of a `Call*Method`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// `Call<Type>Method`
    Instance,
    /// `CallStatic<Type>Method`
    Static,
    /// `CallNonvirtual<Type>Method`
    Nonvirtual,
}

/// How a `Call*Method` receives the Java arguments
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallArgs {
    /// C varargs, not decoded
    Varargs,
    /// `va_list`
    VaList,
    /// `jvalue *`
    Array,
}

/// An overload family sharing one decoder
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JniFamily {
    /// `Call[Static|Nonvirtual]<Type>Method[V|A]`
    Call(CallKind, CallArgs),
    /// `Get[Static]<Type>Field`
    GetField,
    /// `Set[Static]<Type>Field`
    SetField,
    /// `New<Type>Array`
    NewArray,
    /// `Get<Type>ArrayElements`
    GetArrayElements,
    /// `Release<Type>ArrayElements`
    ReleaseArrayElements,
    /// `Get<Type>ArrayRegion`
    GetArrayRegion,
    /// `Set<Type>ArrayRegion`
    SetArrayRegion,
    /// `MonitorEnter`, `MonitorExit`
    Monitor,
}

const fn arg(name: &'static str, kind: ArgKind) -> Arg {
    Arg { name, kind }
}

const CALL_ARGS: &[Arg] = &[arg("env", Hex), arg("obj", JniRef), arg("method_id", JniRef)];
const CALL_LIST_ARGS: &[Arg] = &[
    arg("env", Hex),
    arg("obj", JniRef),
    arg("method_id", JniRef),
    arg("args", Ptr),
];
const CALL_STATIC_ARGS: &[Arg] = &[arg("env", Hex), arg("clazz", JniRef), arg("method_id", JniRef)];
const CALL_STATIC_LIST_ARGS: &[Arg] = &[
    arg("env", Hex),
    arg("clazz", JniRef),
    arg("method_id", JniRef),
    arg("args", Ptr),
];
const CALL_NONVIRTUAL_ARGS: &[Arg] = &[
    arg("env", Hex),
    arg("obj", JniRef),
    arg("clazz", JniRef),
    arg("method_id", JniRef),
];
const CALL_NONVIRTUAL_LIST_ARGS: &[Arg] = &[
    arg("env", Hex),
    arg("obj", JniRef),
    arg("clazz", JniRef),
    arg("method_id", JniRef),
    arg("args", Ptr),
];
const GET_FIELD_ARGS: &[Arg] = &[arg("env", Hex), arg("obj", JniRef), arg("field_id", JniRef)];
const SET_FIELD_ARGS: &[Arg] = &[
    arg("env", Hex),
    arg("obj", JniRef),
    arg("field_id", JniRef),
    arg("value", Hex),
];
const NEW_ARRAY_ARGS: &[Arg] = &[arg("env", Hex), arg("length", Size)];
const NEW_OBJECT_ARRAY_ARGS: &[Arg] = &[
    arg("env", Hex),
    arg("length", Size),
    arg("element_class", JniRef),
    arg("initial_element", JniRef),
];
const GET_ELEMENTS_ARGS: &[Arg] = &[arg("env", Hex), arg("array", JniRef), arg("is_copy", Ptr)];
const RELEASE_ELEMENTS_ARGS: &[Arg] = &[
    arg("env", Hex),
    arg("array", JniRef),
    arg("elems", Ptr),
    arg("mode", JniRelease),
];
const REGION_ARGS: &[Arg] = &[
    arg("env", Hex),
    arg("array", JniRef),
    arg("start", Size),
    arg("len", Size),
    arg("buf", Ptr),
];
const MONITOR_ARGS: &[Arg] = &[arg("env", Hex), arg("obj", JniRef)];

impl JniFamily {
    fn signature(self, ty: JniType) -> Signature {
        let (args, ret) = match self {
            Self::Call(kind, call_args) => {
                let args = match (kind, call_args) {
                    (CallKind::Instance, CallArgs::Varargs) => CALL_ARGS,
                    (CallKind::Instance, _) => CALL_LIST_ARGS,
                    (CallKind::Static, CallArgs::Varargs) => CALL_STATIC_ARGS,
                    (CallKind::Static, _) => CALL_STATIC_LIST_ARGS,
                    (CallKind::Nonvirtual, CallArgs::Varargs) => CALL_NONVIRTUAL_ARGS,
                    (CallKind::Nonvirtual, _) => CALL_NONVIRTUAL_LIST_ARGS,
                };
                (args, ty.return_type())
            }
            Self::GetField => (GET_FIELD_ARGS, ty.return_type()),
            Self::SetField => (SET_FIELD_ARGS, ReturnType::Void),
            Self::NewArray if ty == JniType::Object => (NEW_OBJECT_ARRAY_ARGS, ReturnType::Number),
            Self::NewArray => (NEW_ARRAY_ARGS, ReturnType::Number),
            Self::GetArrayElements => (GET_ELEMENTS_ARGS, ReturnType::Pointer),
            Self::ReleaseArrayElements => (RELEASE_ELEMENTS_ARGS, ReturnType::Void),
            Self::GetArrayRegion | Self::SetArrayRegion => (REGION_ARGS, ReturnType::Void),
            Self::Monitor => (MONITOR_ARGS, ReturnType::Number),
        };
        Signature { args, ret }
    }

    /// The family and element type of `name`
    #[must_use]
    pub fn parse(name: &str) -> Option<(Self, JniType)> {
        if name == "MonitorEnter" || name == "MonitorExit" {
            return Some((Self::Monitor, JniType::Object));
        }
        if let Some(rest) = name.strip_prefix("Call") {
            let (kind, rest) = if let Some(rest) = rest.strip_prefix("Static") {
                (CallKind::Static, rest)
            } else if let Some(rest) = rest.strip_prefix("Nonvirtual") {
                (CallKind::Nonvirtual, rest)
            } else {
                (CallKind::Instance, rest)
            };
            let (ty, call_args) = if let Some(ty) = rest.strip_suffix("MethodV") {
                (ty, CallArgs::VaList)
            } else if let Some(ty) = rest.strip_suffix("MethodA") {
                (ty, CallArgs::Array)
            } else {
                (rest.strip_suffix("Method")?, CallArgs::Varargs)
            };
            return Some((Self::Call(kind, call_args), JniType::from_name(ty)?));
        }
        if let Some(rest) = name.strip_prefix("New") {
            let ty = rest.strip_suffix("Array")?;
            return Some((Self::NewArray, JniType::from_name(ty)?));
        }
        if let Some(ty) = name
            .strip_prefix("Release")
            .and_then(|rest| rest.strip_suffix("ArrayElements"))
        {
            return Some((Self::ReleaseArrayElements, JniType::from_name(ty)?));
        }
        let (getter, rest) = if let Some(rest) = name.strip_prefix("Get") {
            (true, rest)
        } else {
            (false, name.strip_prefix("Set")?)
        };
        if let Some(ty) = rest.strip_suffix("ArrayElements") {
            return getter.then_some((Self::GetArrayElements, JniType::from_name(ty)?));
        }
        if let Some(ty) = rest.strip_suffix("ArrayRegion") {
            let family = if getter {
                Self::GetArrayRegion
            } else {
                Self::SetArrayRegion
            };
            return Some((family, JniType::from_name(ty)?));
        }
        let ty = rest.strip_suffix("Field")?;
        let ty = ty.strip_prefix("Static").unwrap_or(ty);
        let ty = JniType::from_name(ty)?;
        if ty == JniType::Void {
            return None;
        }
        let family = if getter { Self::GetField } else { Self::SetField };
        Some((family, ty))
    }
}

/// How a JNI symbol is decoded
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JniHandler {
    /// A function with its own signature
    Function(JniFunction),
    /// A member of an overload family
    Family(JniFamily, JniType),
}

impl JniHandler {
    /// The handler for an exported symbol, mangled or not
    #[must_use]
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let name = demangle_jni_name(symbol).unwrap_or(symbol);
        JniFunction::from_symbol(name)
            .map(Self::Function)
            .or_else(|| JniFamily::parse(name).map(|(family, ty)| Self::Family(family, ty)))
    }
}

impl Decoder for JniHandler {
    fn signature(&self) -> Signature {
        match self {
            Self::Function(function) => function.table_signature(),
            Self::Family(family, ty) => family.signature(*ty),
        }
    }
}

/// Function name of an ART JNI export: the last component of `art::JNI<..>::Name`
#[must_use]
pub fn demangle_jni_name(symbol: &str) -> Option<&str> {
    let bytes = symbol.as_bytes();
    let mut pos = "_ZN".len();
    if !symbol.starts_with("_ZN3art3JNI") {
        return None;
    }
    let mut last = None;
    loop {
        match *bytes.get(pos)? {
            b'E' => return last,
            b'0'..=b'9' => {
                let (name, next) = source_name(symbol, pos)?;
                last = Some(name);
                pos = next;
            }
            b'I' => pos = skip_template_args(symbol, pos)?,
            b'K' | b'V' | b'r' => pos += 1,
            _ => return None,
        }
    }
}

/// `<length><identifier>` at `pos`, and the position after it
fn source_name(symbol: &str, pos: usize) -> Option<(&str, usize)> {
    let digits = symbol[pos..].bytes().take_while(u8::is_ascii_digit).count();
    let len: usize = symbol.get(pos..pos + digits)?.parse().ok()?;
    let start = pos + digits;
    Some((symbol.get(start..start + len)?, start + len))
}

/// Skips `I<args>E`, returning the position after it
fn skip_template_args(symbol: &str, mut pos: usize) -> Option<usize> {
    let bytes = symbol.as_bytes();
    let mut depth = 0usize;
    loop {
        match *bytes.get(pos)? {
            b'I' | b'L' | b'N' => {
                depth += 1;
                pos += 1;
            }
            b'E' => {
                depth -= 1;
                pos += 1;
                if depth == 0 {
                    return Some(pos);
                }
            }
            b'1'..=b'9' => pos = source_name(symbol, pos)?.1,
            _ => pos += 1,
        }
    }
}

pub(super) fn render_release_mode(value: u64) -> String {
    match value {
        0 => "0".to_string(),
        1 => "JNI_COMMIT".to_string(),
        2 => "JNI_ABORT".to_string(),
        _ => format!("{value:#x}"),
    }
}

/// `JNINativeMethod` entries at `address`: name, signature and function pointer each
pub(super) fn render_native_methods(cx: &DecodeContext<'_>, address: u64, count: usize) -> String {
    if address == 0 {
        return "NULL".to_string();
    }
    let word = cx.abi.word_size();
    let mut out = format!("{address:#x}[");
    for index in 0..count.min(MAX_NATIVE_METHODS) {
        let entry = address + (index * 3 * word) as u64;
        if !cx.memory.is_readable(entry, 3 * word) {
            out.push_str("<unreadable>");
            break;
        }
        let name = cx.memory.read_word(entry, word);
        let signature = cx.memory.read_word(entry + word as u64, word);
        let function = cx.memory.read_word(entry + 2 * word as u64, word);
        if index > 0 {
            out.push_str(", ");
        }
        let _ = write!(
            out,
            "{}{}@{function:#x}",
            cx.string_at(name),
            cx.string_at(signature)
        );
    }
    if count > MAX_NATIVE_METHODS {
        out.push_str(", ...");
    }
    out.push(']');
    out
}
