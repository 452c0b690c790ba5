#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwfCompression {
    None,
    Zlib,
    Lzma,
}

/// Header fields of an embedded Flash payload, parsed for logging and the
/// result record. The body is carried verbatim; decompilation is external.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwfHeader {
    pub signature: [u8; 3],
    pub version: u8,
    pub declared_len: u32,
    pub compression: SwfCompression,
}

pub fn parse_swf_header(data: &[u8]) -> Option<SwfHeader> {
    if data.len() < 8 {
        return None;
    }
    let signature = [data[0], data[1], data[2]];
    let compression = match &signature {
        b"FWS" => SwfCompression::None,
        b"CWS" => SwfCompression::Zlib,
        b"ZWS" => SwfCompression::Lzma,
        _ => return None,
    };
    Some(SwfHeader {
        signature,
        version: data[3],
        declared_len: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        compression,
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_swf_header, SwfCompression};

    #[test]
    fn parses_uncompressed_header() {
        let header = parse_swf_header(b"FWS\x09\x10\x00\x00\x00body").unwrap();
        assert_eq!(header.version, 9);
        assert_eq!(header.declared_len, 16);
        assert_eq!(header.compression, SwfCompression::None);
    }

    #[test]
    fn rejects_short_or_foreign_input() {
        assert!(parse_swf_header(b"FWS").is_none());
        assert!(parse_swf_header(b"GIF89a\x00\x00").is_none());
    }
}
