//! SQL Escaping Utilities
//!
//! Identifier and value escaping primitives for MySQL, plus the
//! placeholder-escape sentinel that keeps `%` in user data from ever being
//! read as a new placeholder.

use std::sync::OnceLock;

/// Escape an identifier without adding the surrounding backticks
///
/// Backticks inside the identifier are doubled, e.g. ``a`b`` becomes ``a``b``.
///
/// # Example
/// ```
/// use filmometre::sql::escape_identifier_value;
///
/// assert_eq!(escape_identifier_value("rat`ings"), "rat``ings");
/// ```
pub fn escape_identifier_value(identifier: &str) -> String {
    identifier.replace('`', "``")
}

/// Quote an identifier with backticks, escaping internal backticks
///
/// Dotted names (`db.table`) are quoted part by part.
///
/// # Example
/// ```
/// use filmometre::sql::quote_identifier;
///
/// assert_eq!(quote_identifier("ratings"), "`ratings`");
/// assert_eq!(quote_identifier("film.ratings"), "`film`.`ratings`");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| format!("`{}`", escape_identifier_value(part)))
        .collect::<Vec<_>>()
        .join(".")
}

/// Escape a string the way the MySQL client library does for a literal
///
/// Escapes NUL, `\n`, `\r`, `\`, `'`, `"` and `\x1a` with a backslash.
/// Assumes the server does not run with `NO_BACKSLASH_ESCAPES`.
pub fn real_escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        match ch {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\x1a' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out
}

/// Degraded escaping used before any connection exists
///
/// Backslash-escapes `'`, `"`, `\` and NUL only. It knows nothing about the
/// connection charset and must never be the normal path.
pub fn addslashes(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        match ch {
            '\'' | '"' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out
}

/// Escape `%`, `_` and `\` so a string can be embedded in a LIKE pattern
///
/// The result still has to go through `prepare` as a value.
///
/// # Example
/// ```
/// use filmometre::sql::esc_like;
///
/// assert_eq!(esc_like("100%_sure"), "100\\%\\_sure");
/// ```
pub fn esc_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 4);
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Per-process sentinel that stands in for `%` inside prepared statements
///
/// Generated once from random v4 UUIDs, so it cannot be predicted or
/// supplied by user data.
pub fn placeholder_escape() -> &'static str {
    static SENTINEL: OnceLock<String> = OnceLock::new();
    SENTINEL.get_or_init(|| {
        format!(
            "{{{}{}}}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        )
    })
}

/// Replace every `%` with the placeholder-escape sentinel
pub fn add_placeholder_escape(query: &str) -> String {
    query.replace('%', placeholder_escape())
}

/// Restore `%` from the sentinel before a statement is sent to the server
pub fn remove_placeholder_escape(query: &str) -> String {
    query.replace(placeholder_escape(), "%")
}
