use std::sync::OnceLock;

use regex::Regex;

/// Token vocabulary scanned for by the script heuristic. The three key
/// tokens must each occur at least once for any positive verdict.
const SCRIPT_TOKENS: &[&str] = &[
    "var ", ";", ")", "(", "function ", "=", "{", "}", "if ", "else", "return", "while ", "for ",
    ",", "eval", "unescape", ".replace",
];
const KEY_TOKENS: &[&str] = &[";", "(", ")"];
const TOKEN_TOTAL_THRESHOLD: usize = 15;
const MIN_DISTINCT_TOKENS: usize = 5;

fn script_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?is)<script[^>]*?contentType\s*?=\s*?['"]application/x-javascript['"][^>]*?>(.*?)</script>"#,
        )
        .expect("script tag regex")
    })
}

fn entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"&#?\w+;").expect("entity regex"))
}

/// Resolves HTML/XML character references; unknown entities pass through.
pub fn unescape_entities(text: &str) -> String {
    entity_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            decode_entity(whole).unwrap_or_else(|| whole.to_string())
        })
        .into_owned()
}

fn decode_entity(entity: &str) -> Option<String> {
    let body = entity.strip_prefix('&')?.strip_suffix(';')?;
    if let Some(num) = body.strip_prefix('#') {
        let code = if let Some(hex) = num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
            u32::from_str_radix(hex, 16).ok()?
        } else {
            num.parse::<u32>().ok()?
        };
        return char::from_u32(code).map(|c| c.to_string());
    }
    let named = match body {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        _ => return None,
    };
    Some(named.to_string())
}

/// Script heuristic per the token-vocabulary rules: an explicit
/// `application/x-javascript` tag wins outright, any binary byte disqualifies,
/// otherwise the token counts decide.
pub fn looks_like_script(content: &str) -> bool {
    let content = unescape_entities(content);
    if script_tag_re().is_match(&content) {
        return true;
    }
    for c in content.chars() {
        let code = c as u32;
        if (code < 32 && !matches!(c, '\n' | '\r' | '\t' | '\x0c' | '\0')) || code >= 127 {
            return false;
        }
    }
    let mut total = 0usize;
    let mut distinct = 0usize;
    for token in SCRIPT_TOKENS {
        let hits = content.matches(token).count();
        total += hits;
        if hits > 0 {
            distinct += 1;
        } else if KEY_TOKENS.contains(token) {
            return false;
        }
    }
    total > TOKEN_TOTAL_THRESHOLD && distinct >= MIN_DISTINCT_TOKENS
}

/// When an explicit script tag is present, returns only the joined tag
/// bodies; callers fall back to the whole payload otherwise.
pub fn extract_script_blocks(content: &str) -> Option<String> {
    let blocks: Vec<String> = script_tag_re()
        .captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();
    if blocks.is_empty() {
        None
    } else {
        Some(blocks.join("\n"))
    }
}

/// Flash payloads announce themselves in the first three bytes.
pub fn looks_like_flash(data: &[u8]) -> bool {
    if data.starts_with(b"CWS") || data.starts_with(b"FWS") {
        return true;
    }
    // Entity-escaped payloads hide the magic behind references.
    if data.contains(&b'&') {
        if let Ok(text) = std::str::from_utf8(data) {
            let unescaped = unescape_entities(text);
            return unescaped.starts_with("CWS") || unescaped.starts_with("FWS");
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_is_not_script() {
        assert!(!looks_like_script(""));
    }

    #[test]
    fn plain_javascript_passes() {
        let js = "var a = 1; function f(x) { if (x) { return eval(x); } } f(a); f(a); f(a);";
        assert!(looks_like_script(js));
    }

    #[test]
    fn missing_key_tokens_fail_regardless_of_volume() {
        let text = "var var var var var var var var var var var var var var var var var = =";
        assert!(!looks_like_script(text));
    }

    #[test]
    fn binary_bytes_disqualify() {
        let mut js = String::from("var a = 1; function f() { return (a); };;;");
        js.push('\u{1}');
        assert!(!looks_like_script(&js));
    }

    #[test]
    fn script_tag_short_circuits() {
        let tagged = "<script contentType='application/x-javascript'>x</script>";
        assert!(looks_like_script(tagged));
        assert_eq!(extract_script_blocks(tagged).as_deref(), Some("x"));
    }

    #[test]
    fn entity_unescape_numeric_and_named() {
        assert_eq!(unescape_entities("&#40;&#x29;&amp;"), "()&");
        assert_eq!(unescape_entities("&bogus;"), "&bogus;");
    }

    #[test]
    fn flash_magic() {
        assert!(looks_like_flash(b"CWS\x09rest"));
        assert!(looks_like_flash(b"FWS\x05rest"));
        assert!(looks_like_flash(b"&#67;WS header"));
        assert!(!looks_like_flash(b"XYZ header"));
    }
}
