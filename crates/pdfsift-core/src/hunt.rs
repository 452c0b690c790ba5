/// Substring hunting over hex- and `%u`-unicode-packed script text, used to
/// pull URL fragments out of obfuscated payloads.

/// Needles hunted for in every script payload.
pub const NEEDLES: &[&str] = &["ftp", "http"];

fn ascii_to_hex(s: &str) -> String {
    s.bytes().map(|b| format!("{b:02x}")).collect()
}

/// Decodes pairs of hex digits to text, stopping at the first unprintable
/// character or invalid digit.
pub fn hex_to_ascii(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        let pair = match std::str::from_utf8(&bytes[i..i + 2]) {
            Ok(p) => p,
            Err(_) => break,
        };
        let Ok(v) = u8::from_str_radix(pair, 16) else { break };
        if !(32..=127).contains(&v) {
            break;
        }
        out.push(v as char);
        i += 2;
    }
    out
}

fn ascii_to_unicode(s: &str) -> String {
    let hex = ascii_to_hex(s);
    let bytes = hex.as_bytes();
    let mut out = String::new();
    let mut i = 0;
    // %uXXXX packs two bytes little-endian per unit.
    while i + 3 < bytes.len() {
        out.push_str("%u");
        out.push_str(std::str::from_utf8(&bytes[i + 2..i + 4]).unwrap_or(""));
        out.push_str(std::str::from_utf8(&bytes[i..i + 2]).unwrap_or(""));
        i += 4;
    }
    out
}

fn unicode_to_ascii(s: &str) -> String {
    let stripped = s.replace("%u", "");
    let bytes = stripped.as_bytes();
    let mut swapped = String::new();
    let mut i = 0;
    while i + 3 < bytes.len() {
        swapped.push_str(std::str::from_utf8(&bytes[i + 2..i + 4]).unwrap_or(""));
        swapped.push_str(std::str::from_utf8(&bytes[i..i + 2]).unwrap_or(""));
        i += 4;
    }
    hex_to_ascii(&swapped)
}

/// Finds every occurrence of `needle` (hex-packed) in the haystack and
/// decodes forward from each hit. Results do not overlap.
pub fn find_in_hex(needle: &str, hexstack: &str) -> Vec<(usize, String)> {
    let packed = ascii_to_hex(needle);
    if packed.is_empty() {
        return Vec::new();
    }
    let mut results = Vec::new();
    let mut haystack = hexstack;
    let mut total = 0usize;
    while let Some(idx) = haystack.find(&packed) {
        total += idx;
        results.push((total, hex_to_ascii(&haystack[idx..])));
        haystack = &haystack[idx + 1..];
        total += 1;
    }
    results
}

/// `%u`-packed variant: decodes from each hit up to the nearest quote.
pub fn find_unicode(needle: &str, haystack: &str) -> Vec<(usize, String)> {
    let packed = ascii_to_unicode(needle);
    if packed.is_empty() {
        return Vec::new();
    }
    let mut results = Vec::new();
    let mut rest = haystack;
    let mut total = 0usize;
    while let Some(idx) = rest.find(&packed) {
        total += idx;
        let tail = &rest[idx..];
        let quote = match (tail.find('\''), tail.find('"')) {
            (Some(sq), Some(dq)) => sq.min(dq),
            (Some(sq), None) => sq,
            (None, Some(dq)) => dq,
            (None, None) => tail.len(),
        };
        results.push((total, unicode_to_ascii(&tail[..quote])));
        rest = &rest[idx + 1..];
        total += 1;
    }
    results
}

/// Runs the full needle set over a payload, newline-joining the decodes.
pub fn hunt_urls(haystack: &str) -> Vec<String> {
    let mut out = Vec::new();
    for needle in NEEDLES {
        for (_, hit) in find_in_hex(needle, haystack) {
            out.push(hit);
        }
        for (_, hit) in find_unicode(needle, haystack) {
            out.push(hit);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hex packing of "ftp://google.com".
    const FTP_HEX: &str = "6674703a2f2f676f6f676c652e636f6d";

    #[test]
    fn finds_single_hex_packed_url() {
        let hits = find_in_hex("ftp", FTP_HEX);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, "ftp://google.com");
    }

    #[test]
    fn finds_adjacent_hits_without_overlap() {
        let stack = format!("{FTP_HEX}687474703a2f2f676f6f676c652e636f6df1");
        let http_hits = find_in_hex("http", &stack);
        assert_eq!(http_hits.len(), 1);
        assert_eq!(http_hits[0].1, "http://google.com");
        let ftp_hits = find_in_hex("ftp", &stack);
        assert_eq!(ftp_hits[0].1, "ftp://google.comhttp://google.com");
    }

    #[test]
    fn unicode_packed_url_decodes() {
        // "%u7468%u7470..." pairs byte-swapped per unit.
        let packed = ascii_to_unicode("http://x.com");
        let haystack = format!("var u = '{packed}';");
        let hits = find_unicode("http", &haystack);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, "http://x.com");
    }

    #[test]
    fn decode_stops_at_unprintable() {
        assert_eq!(hex_to_ascii("68690009"), "hi");
        assert_eq!(hex_to_ascii("zz"), "");
    }

    #[test]
    fn hunt_runs_every_needle() {
        let hits = hunt_urls(FTP_HEX);
        assert_eq!(hits, vec!["ftp://google.com".to_string()]);
    }
}
