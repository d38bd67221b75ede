//! The compression library.

#[allow(clippy::enum_glob_use)]
use super::ArgKind::*;
use super::{DecodeContext, Decoder, Signature};

decoder_table! {
    /// A decodable zlib function
    pub enum ZlibFunction {
        ZlibVersion = "zlibVersion"() -> String,
        Compress = "compress"(dest: Ptr, dest_len: Ptr, source: Buf(3), source_len: Size) -> Number,
        Compress2 = "compress2"(dest: Ptr, dest_len: Ptr, source: Buf(3), source_len: Size, level: Int) -> Number,
        CompressBound = "compressBound"(source_len: Size) -> Number,
        Uncompress = "uncompress"(dest: Ptr, dest_len: Ptr, source: Ptr, source_len: Size) -> Number,
        DeflateInit = "deflateInit_"(strm: ZStream, level: Int, version: Str, stream_size: Int) -> Number,
        DeflateInit2 = "deflateInit2_"(strm: ZStream, level: Int, method: Int, window_bits: Int, mem_level: Int, strategy: Int, version: Str, stream_size: Int) -> Number,
        Deflate = "deflate"(strm: ZStream, flush: ZFlush) -> Number,
        DeflateEnd = "deflateEnd"(strm: ZStream) -> Number,
        InflateInit = "inflateInit_"(strm: ZStream, version: Str, stream_size: Int) -> Number,
        InflateInit2 = "inflateInit2_"(strm: ZStream, window_bits: Int, version: Str, stream_size: Int) -> Number,
        Inflate = "inflate"(strm: ZStream, flush: ZFlush) -> Number,
        InflateEnd = "inflateEnd"(strm: ZStream) -> Number,
        Crc32 = "crc32"(crc: Hex, buf: Buf(2), len: Size) -> Number,
        Adler32 = "adler32"(adler: Hex, buf: Buf(2), len: Size) -> Number,
    }
}

/// Name of a zlib status code
#[must_use]
pub fn status_name(code: i64) -> Option<&'static str> {
    Some(match code {
        0 => "Z_OK",
        1 => "Z_STREAM_END",
        2 => "Z_NEED_DICT",
        -1 => "Z_ERRNO",
        -2 => "Z_STREAM_ERROR",
        -3 => "Z_DATA_ERROR",
        -4 => "Z_MEM_ERROR",
        -5 => "Z_BUF_ERROR",
        -6 => "Z_VERSION_ERROR",
        _ => return None,
    })
}

pub(super) fn render_flush(value: u64) -> String {
    match value {
        0 => "Z_NO_FLUSH",
        1 => "Z_PARTIAL_FLUSH",
        2 => "Z_SYNC_FLUSH",
        3 => "Z_FULL_FLUSH",
        4 => "Z_FINISH",
        5 => "Z_BLOCK",
        6 => "Z_TREES",
        _ => return value.to_string(),
    }
    .to_string()
}

/// Summary of the `z_stream` at `address`.
///
/// Every field up to `msg` is one word apart on both ARM and AArch64, the 32-bit counters
/// being padded on the latter.
pub(super) fn render_z_stream(cx: &DecodeContext<'_>, address: u64) -> String {
    const FIELDS: usize = 7;

    if address == 0 {
        return "NULL".to_string();
    }
    let word = cx.abi.word_size();
    if !cx.memory.is_readable(address, FIELDS * word) {
        return format!("{address:#x}");
    }
    let field = |index: usize, width: usize| cx.memory.read_word(address + (index * word) as u64, width);
    let msg = field(6, word);
    let mut out = format!(
        "{address:#x}{{next_in={:#x}, avail_in={}, total_in={}, next_out={:#x}, avail_out={}, total_out={}",
        field(0, word),
        field(1, 4),
        field(2, word),
        field(3, word),
        field(4, 4),
        field(5, word),
    );
    if msg != 0 {
        out.push_str(&format!(", msg=\"{}\"", cx.string_at(msg)));
    }
    out.push('}');
    out
}

impl ZlibFunction {
    /// Whether the function returns a zlib status code
    #[must_use]
    pub fn returns_status(self) -> bool {
        !matches!(
            self,
            Self::ZlibVersion | Self::CompressBound | Self::Crc32 | Self::Adler32
        )
    }
}

impl Decoder for ZlibFunction {
    fn signature(&self) -> Signature {
        self.table_signature()
    }

    fn decode_ret(&self, cx: &mut DecodeContext<'_>) -> String {
        if !self.returns_status() {
            return cx.render_ret(self.signature().ret);
        }
        let code = cx.ret_signed();
        let status = status_name(code).map_or_else(|| code.to_string(), str::to_string);
        match self {
            Self::Compress | Self::Compress2 | Self::Uncompress => {
                let dest_len = cx.arg(1);
                if dest_len != 0 && cx.memory.is_readable(dest_len, cx.abi.word_size()) {
                    let len = cx.memory.read_word(dest_len, cx.abi.word_size());
                    return format!("{status} dest_len={len}");
                }
                status
            }
            Self::Deflate | Self::Inflate => {
                format!("{status} strm={}", render_z_stream(cx, cx.arg(0)))
            }
            _ => status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ZlibFunction;
    use crate::{
        abi::{AArch64Abi, Arm32Abi},
        alloc::AllocationTable,
        dispatch::{tests::with_context, Decoder},
        memory::SnapshotMemory,
        vm::GprState,
    };

    fn z_stream_64(next_in: u64, avail_in: u64, avail_out: u64) -> Vec<u8> {
        [next_in, avail_in, 10, 0x9000, avail_out, 20, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    #[test]
    fn inflate_rereads_the_stream() {
        let mut memory = SnapshotMemory::new().with_region(0x5000, z_stream_64(0x7000, 32, 64));
        let mut allocations = AllocationTable::new();
        let call = GprState::with_args(&[0x5000, 0]);
        let args = with_context(&AArch64Abi, &memory, &mut allocations, &call, None, |cx| {
            ZlibFunction::Inflate.decode_args(cx)
        });
        assert_eq!(
            args,
            vec![
                "strm=0x5000{next_in=0x7000, avail_in=32, total_in=10, next_out=0x9000, avail_out=64, total_out=20}",
                "flush=Z_NO_FLUSH",
            ]
        );

        assert!(memory.write(0x5008, &0u64.to_le_bytes()));
        let ret = GprState::with_args(&[1]);
        let rendered = with_context(&AArch64Abi, &memory, &mut allocations, &call, Some(&ret), |cx| {
            ZlibFunction::Inflate.decode_ret(cx)
        });
        assert!(rendered.starts_with("Z_STREAM_END strm=0x5000{next_in=0x7000, avail_in=0,"));
    }

    #[test]
    fn status_codes() {
        let memory = SnapshotMemory::new().with_region(0x100, 77u32.to_le_bytes().to_vec());
        let mut allocations = AllocationTable::new();
        let call = GprState::with_args(&[0x200, 0x100, 0x300, 5]);
        let ret = GprState::with_args(&[0xffff_fffb]);
        with_context(&Arm32Abi, &memory, &mut allocations, &call, Some(&ret), |cx| {
            assert_eq!(ZlibFunction::Uncompress.decode_ret(cx), "Z_BUF_ERROR dest_len=77");
            assert_eq!(ZlibFunction::DeflateEnd.decode_ret(cx), "Z_BUF_ERROR");
            assert_eq!(ZlibFunction::CompressBound.decode_ret(cx), "-5");
        });
    }

    #[test]
    fn symbols() {
        assert_eq!(
            ZlibFunction::from_symbol("inflateInit2_"),
            Some(ZlibFunction::InflateInit2)
        );
        assert_eq!(ZlibFunction::DeflateInit2.signature().args.len(), 8);
        assert!(!ZlibFunction::Crc32.returns_status());
    }
}
