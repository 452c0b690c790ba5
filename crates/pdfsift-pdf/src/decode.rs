use std::io::Read;

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::lexer::Span;
use crate::object::{RawAtom, RawDict};

#[derive(Debug, Clone)]
pub struct DecodedStream {
    pub data: Vec<u8>,
    pub truncated: bool,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct PredictorParms {
    predictor: u32,
    colors: u32,
    bits_per_component: u32,
    columns: u32,
}

const MAX_PREDICTOR_PARM: u32 = 100_000;

/// Runs a stream's filter chain. Unsupported filters and corrupt input are
/// errors for the caller to degrade into an inline marker.
pub fn decode_stream(bytes: &[u8], dict: &RawDict, data: Span, max_out: usize) -> Result<DecodedStream> {
    let start = data.start as usize;
    let end = data.end as usize;
    if start > end || end > bytes.len() {
        return Err(anyhow!("invalid stream span"));
    }
    let mut out = bytes[start..end].to_vec();
    let mut truncated = false;
    let filters = filter_chain(dict);
    let parms = predictor_parms(dict, filters.len());
    for (idx, filter) in filters.iter().enumerate() {
        let (decoded, was_truncated) = apply_filter(&out, filter, max_out)?;
        out = decoded;
        if let Some(p) = parms.get(idx).copied().flatten() {
            if is_flate(filter) && p.predictor > 1 {
                out = apply_predictor(&out, p)?;
            }
        }
        if was_truncated {
            truncated = true;
            break;
        }
    }
    if out.len() > max_out {
        out.truncate(max_out);
        truncated = true;
    }
    Ok(DecodedStream { data: out, truncated, filters })
}

/// `/Filter` may be a single name or an array of names applied in order.
pub fn filter_chain(dict: &RawDict) -> Vec<String> {
    let mut out = Vec::new();
    match dict.get(b"/Filter") {
        Some(RawAtom::Name(n)) => out.push(String::from_utf8_lossy(n).to_string()),
        Some(RawAtom::Array(items)) => {
            for item in items {
                if let RawAtom::Name(n) = item {
                    out.push(String::from_utf8_lossy(n).to_string());
                }
            }
        }
        _ => {}
    }
    out
}

fn predictor_parms(dict: &RawDict, filters: usize) -> Vec<Option<PredictorParms>> {
    let mut out = vec![None; filters.max(1)];
    match dict.get(b"/DecodeParms") {
        Some(RawAtom::Dict(d)) => out[0] = parms_from_dict(d),
        Some(RawAtom::Array(items)) => {
            for (idx, item) in items.iter().enumerate().take(out.len()) {
                if let RawAtom::Dict(d) = item {
                    out[idx] = parms_from_dict(d);
                }
            }
        }
        _ => {}
    }
    out
}

fn parms_from_dict(dict: &RawDict) -> Option<PredictorParms> {
    let field = |key: &[u8], default: u32| -> u32 {
        match dict.get_int(key) {
            Some(v) if v >= 0 => v as u32,
            _ => default,
        }
    };
    Some(PredictorParms {
        predictor: field(b"/Predictor", 1),
        colors: field(b"/Colors", 1),
        bits_per_component: field(b"/BitsPerComponent", 8),
        columns: field(b"/Columns", 1),
    })
}

fn is_flate(filter: &str) -> bool {
    matches!(filter, "/FlateDecode" | "/Fl")
}

fn apply_filter(data: &[u8], filter: &str, max_out: usize) -> Result<(Vec<u8>, bool)> {
    match filter {
        "/FlateDecode" | "/Fl" => decode_flate(data, max_out),
        "/LZWDecode" | "/LZW" => decode_lzw(data, max_out),
        "/ASCIIHexDecode" | "/AHx" => Ok((decode_ascii_hex(data), false)),
        "/ASCII85Decode" | "/A85" => Ok((decode_ascii85(data), false)),
        "/RunLengthDecode" | "/RL" => Ok((decode_run_length(data), false)),
        other => Err(anyhow!("unsupported filter {}", other)),
    }
}

fn decode_flate(data: &[u8], max_out: usize) -> Result<(Vec<u8>, bool)> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            return Ok((out, false));
        }
        if out.len() + n > max_out {
            let keep = max_out.saturating_sub(out.len());
            out.extend_from_slice(&buf[..keep]);
            return Ok((out, true));
        }
        out.extend_from_slice(&buf[..n]);
    }
}

fn decode_lzw(data: &[u8], max_out: usize) -> Result<(Vec<u8>, bool)> {
    let mut decoder = weezl::decode::Decoder::new(weezl::BitOrder::Msb, 8);
    let mut out = Vec::new();
    let mut input = data;
    loop {
        let res = decoder.decode_bytes(input, &mut out);
        input = &input[res.consumed_in..];
        if res.status.is_ok() {
            break;
        }
        if out.len() > max_out {
            out.truncate(max_out);
            return Ok((out, true));
        }
        if input.is_empty() {
            break;
        }
    }
    if out.len() > max_out {
        out.truncate(max_out);
        return Ok((out, true));
    }
    Ok((out, false))
}

pub fn decode_ascii_hex(data: &[u8]) -> Vec<u8> {
    let mut digits = Vec::new();
    for &b in data {
        if b == b'>' {
            break;
        }
        if b.is_ascii_whitespace() {
            continue;
        }
        digits.push(b);
    }
    let mut out = Vec::with_capacity(digits.len() / 2 + 1);
    let mut i = 0;
    while i < digits.len() {
        let hi = hex_val(digits[i]);
        let lo = if i + 1 < digits.len() { hex_val(digits[i + 1]) } else { Some(0) };
        if let (Some(h), Some(l)) = (hi, lo) {
            out.push((h << 4) | l);
        }
        i += 2;
    }
    out
}

fn decode_ascii85(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut tuple: Vec<u8> = Vec::with_capacity(5);
    let mut i = 0usize;
    while i < data.len() {
        let b = data[i];
        if b == b'~' && data.get(i + 1) == Some(&b'>') {
            break;
        }
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if b == b'z' && tuple.is_empty() {
            out.extend_from_slice(&[0, 0, 0, 0]);
            i += 1;
            continue;
        }
        if !(b'!'..=b'u').contains(&b) {
            i += 1;
            continue;
        }
        tuple.push(b);
        if tuple.len() == 5 {
            let mut value: u32 = 0;
            for &c in &tuple {
                value = value.wrapping_mul(85).wrapping_add((c - 33) as u32);
            }
            out.extend_from_slice(&value.to_be_bytes());
            tuple.clear();
        }
        i += 1;
    }
    if !tuple.is_empty() {
        let padding = 5 - tuple.len();
        let mut value: u32 = 0;
        for &c in &tuple {
            value = value.wrapping_mul(85).wrapping_add((c - 33) as u32);
        }
        for _ in 0..padding {
            value = value.wrapping_mul(85).wrapping_add(84);
        }
        let bytes = value.to_be_bytes();
        out.extend_from_slice(&bytes[..4 - padding]);
    }
    out
}

fn decode_run_length(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < data.len() {
        let n = data[i];
        i += 1;
        if n == 128 {
            break;
        } else if n <= 127 {
            let count = n as usize + 1;
            if i + count > data.len() {
                break;
            }
            out.extend_from_slice(&data[i..i + count]);
            i += count;
        } else {
            let count = 257 - n as usize;
            let Some(&b) = data.get(i) else { break };
            out.extend(std::iter::repeat(b).take(count));
            i += 1;
        }
    }
    out
}

fn apply_predictor(data: &[u8], parms: PredictorParms) -> Result<Vec<u8>> {
    if parms.colors > MAX_PREDICTOR_PARM
        || parms.bits_per_component > MAX_PREDICTOR_PARM
        || parms.columns > MAX_PREDICTOR_PARM
    {
        warn!(
            security = true,
            domain = "pdf.decode",
            kind = "predictor_parms_out_of_range",
            colors = parms.colors,
            bits = parms.bits_per_component,
            columns = parms.columns,
            "Predictor parameters out of range"
        );
        return Err(anyhow!("predictor parms exceed safe limits"));
    }
    if parms.bits_per_component != 8 || parms.columns == 0 {
        return Ok(data.to_vec());
    }
    let bpp = ((parms.colors as u64 * parms.bits_per_component as u64 + 7) / 8) as usize;
    let row_len = parms.columns as usize * bpp;
    if row_len == 0 {
        return Ok(data.to_vec());
    }
    match parms.predictor {
        2 => Ok(tiff_predictor(data, bpp, row_len)),
        10..=15 => Ok(png_predictor(data, bpp, row_len)),
        _ => Ok(data.to_vec()),
    }
}

fn tiff_predictor(data: &[u8], bpp: usize, row_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(row_len) {
        let mut row = chunk.to_vec();
        for i in bpp..row.len() {
            row[i] = row[i].wrapping_add(row[i - bpp]);
        }
        out.extend_from_slice(&row);
    }
    out
}

fn png_predictor(data: &[u8], bpp: usize, row_len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = vec![0u8; row_len];
    let mut i = 0usize;
    while i < data.len() {
        let filter = data[i];
        i += 1;
        if i + row_len > data.len() {
            break;
        }
        let mut row = data[i..i + row_len].to_vec();
        i += row_len;
        match filter {
            0 => {}
            1 => {
                for j in 0..row_len {
                    let left = if j >= bpp { row[j - bpp] } else { 0 };
                    row[j] = row[j].wrapping_add(left);
                }
            }
            2 => {
                for j in 0..row_len {
                    row[j] = row[j].wrapping_add(prev[j]);
                }
            }
            3 => {
                for j in 0..row_len {
                    let left = if j >= bpp { row[j - bpp] } else { 0 };
                    row[j] = row[j].wrapping_add(((left as u16 + prev[j] as u16) / 2) as u8);
                }
            }
            4 => {
                for j in 0..row_len {
                    let left = if j >= bpp { row[j - bpp] } else { 0 };
                    let up_left = if j >= bpp { prev[j - bpp] } else { 0 };
                    row[j] = row[j].wrapping_add(paeth(left, prev[j], up_left));
                }
            }
            _ => {}
        }
        prev.copy_from_slice(&row);
        out.extend_from_slice(&row);
    }
    out
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i32 + b as i32 - c as i32;
    let pa = (p - a as i32).abs();
    let pb = (p - b as i32).abs();
    let pc = (p - c as i32).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(10 + b - b'a'),
        b'A'..=b'F' => Some(10 + b - b'A'),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{RawAtom, RawDict};
    use std::io::Write;

    fn dict_with_filter(name: &str) -> RawDict {
        RawDict { entries: vec![(b"/Filter".to_vec(), RawAtom::Name(name.as_bytes().to_vec()))] }
    }

    #[test]
    fn flate_roundtrip() {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"var x = 1;").unwrap();
        let packed = enc.finish().unwrap();
        let dict = dict_with_filter("/FlateDecode");
        let span = Span { start: 0, end: packed.len() as u64 };
        let decoded = decode_stream(&packed, &dict, span, 1 << 20).unwrap();
        assert_eq!(decoded.data, b"var x = 1;");
        assert!(!decoded.truncated);
    }

    #[test]
    fn ascii_hex_ignores_whitespace() {
        assert_eq!(decode_ascii_hex(b"48 65 6C6C 6F>tail"), b"Hello");
    }

    #[test]
    fn run_length_literal_and_repeat() {
        // 0x02 -> copy 3 literals, 0xFE -> repeat next byte 3 times, 0x80 -> EOD
        assert_eq!(decode_run_length(&[0x02, b'a', b'b', b'c', 0xFE, b'x', 0x80]), b"abcxxx");
    }

    #[test]
    fn unsupported_filter_is_an_error() {
        let dict = dict_with_filter("/JBIG2Decode");
        let err = decode_stream(b"abc", &dict, Span { start: 0, end: 3 }, 64).unwrap_err();
        assert!(err.to_string().contains("unsupported filter"));
    }

    #[test]
    fn output_cap_marks_truncation() {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&vec![b'A'; 4096]).unwrap();
        let packed = enc.finish().unwrap();
        let dict = dict_with_filter("/FlateDecode");
        let span = Span { start: 0, end: packed.len() as u64 };
        let decoded = decode_stream(&packed, &dict, span, 100).unwrap();
        assert_eq!(decoded.data.len(), 100);
        assert!(decoded.truncated);
    }
}
