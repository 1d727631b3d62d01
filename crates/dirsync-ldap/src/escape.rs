//! Value escaping for search filters (RFC 4515) and DN attribute values (RFC 4514).

use std::fmt::Write;

/// Escape a value for use inside an equality filter such as `(uid=...)`.
pub fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' | '*' | '(' | ')' | '\0' => {
                let _ = write!(out, "\\{:02x}", ch as u32);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Escape a value for use as the value of an RDN such as `uid=...`.
///
/// Separators and quoting characters get a backslash prefix. A space at
/// either end and a `#` at the start are hex-escaped.
pub fn escape_dn_value(value: &str) -> String {
    let last = value.chars().count().saturating_sub(1);
    let mut out = String::with_capacity(value.len() + 8);

    for (pos, ch) in value.chars().enumerate() {
        let edge = pos == 0 || pos == last;
        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            '\0' => out.push_str("\\00"),
            ' ' if edge => out.push_str("\\20"),
            '#' if pos == 0 => out.push_str("\\23"),
            _ => out.push(ch),
        }
    }
    out
}
