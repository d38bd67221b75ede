mod common;

use common::{
    session, Script, ScriptedVm, CALL_STATIC_INT_METHOD_V, COMPRESS_BOUND, FIND_CLASS,
    GET_STRING_UTF_CHARS, NEW_BYTE_ARRAY, RELEASE_INT_ARRAY_ELEMENTS, TARGET_BASE,
};
use libafl_calltrace::{
    memory::SnapshotMemory,
    sink::CollectingSink,
    vm::{Arch, GprState},
    ExecutionController, TraceTarget,
};

const ENV: u64 = 0xe0;

#[test]
fn art_exports_are_decoded_by_name_and_family() {
    let memory = SnapshotMemory::new()
        .with_region(0x9000, b"java/lang/String\0".to_vec())
        .with_region(0x9100, b"hello\0".to_vec());
    let sink = CollectingSink::new();
    let steps = Script::new(Arch::Arm, TARGET_BASE)
        .args(&[ENV, 0x9000])
        .call(FIND_CLASS, 0x71)
        .args(&[ENV, 16])
        .call(NEW_BYTE_ARRAY, 0x81)
        .args(&[ENV, 0x91, 0])
        .call(GET_STRING_UTF_CHARS, 0x9100)
        .args(&[ENV, 0xa1, 0x9200, 2])
        .call(RELEASE_INT_ARRAY_ELEMENTS, 0)
        .args(&[ENV, 0xb1, 0xc1, 0x9300])
        .call(CALL_STATIC_INT_METHOD_V, 7)
        .args(&[0x400])
        .call(COMPRESS_BOUND, 0x40d)
        .ret()
        .build();

    let mut controller = ExecutionController::new(
        ScriptedVm::new(Arch::Arm, steps),
        session(Arch::Arm, memory, &sink),
        0x1_0000,
    )
    .unwrap();
    let target = TraceTarget::Offset {
        module: "libtarget.so".to_string(),
        offset: 0,
    };
    controller.init(&common::linker(), &target).unwrap();
    controller.run(&GprState::default()).unwrap();

    let calls = sink.calls();
    let summary: Vec<(&str, &str, Vec<&str>, Option<&str>)> = calls
        .iter()
        .map(|call| {
            (
                call.module.as_str(),
                call.function.as_str(),
                call.arguments.iter().map(String::as_str).collect(),
                call.return_value.as_deref(),
            )
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            (
                "libart.so",
                "FindClass",
                vec!["env=0xe0", "name=java/lang/String"],
                Some("0x71")
            ),
            (
                "libart.so",
                "NewByteArray",
                vec!["env=0xe0", "length=16"],
                Some("0x81")
            ),
            (
                "libart.so",
                "GetStringUTFChars",
                vec!["env=0xe0", "string=0x91", "is_copy=NULL"],
                Some("0x9100 \"hello\"")
            ),
            (
                "libart.so",
                "ReleaseIntArrayElements",
                vec!["env=0xe0", "array=0xa1", "elems=0x9200", "mode=JNI_ABORT"],
                Some("void")
            ),
            (
                "libart.so",
                "CallStaticIntMethodV",
                vec!["env=0xe0", "clazz=0xb1", "method_id=0xc1", "args=0x9300"],
                Some("0x7")
            ),
            (
                "libz.so.1",
                "compressBound",
                vec!["source_len=1024"],
                Some("0x40d")
            ),
        ]
    );
}
