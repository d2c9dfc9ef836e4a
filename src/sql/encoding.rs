//! Local invalid-text stripping and truncation
//!
//! Values bound for `utf8`/`utf8mb3`/`utf8mb4` columns are validated here
//! without a server round trip. Every other charset gets a
//! `CONVERT(... USING ...)` expression evaluated by the server instead.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::types::{Charset, ColumnLength, LengthUnit};

const UTF8_3BYTE: &str = r"[\x00-\x7F]|[\xC2-\xDF][\x80-\xBF]|\xE0[\xA0-\xBF][\x80-\xBF]|[\xE1-\xEC][\x80-\xBF]{2}|\xED[\x80-\x9F][\x80-\xBF]|[\xEE-\xEF][\x80-\xBF]{2}";

const UTF8_4BYTE: &str = r"|\xF0[\x90-\xBF][\x80-\xBF]{2}|[\xF1-\xF3][\x80-\xBF]{3}|\xF4[\x80-\x8F][\x80-\xBF]{2}";

static VALID_UTF8MB3: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?s-u)((?:{UTF8_3BYTE}){{1,40}})|."))
        .expect("utf8mb3 pattern is a valid regex")
});

static VALID_UTF8MB4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?s-u)((?:{UTF8_3BYTE}{UTF8_4BYTE}){{1,40}})|."))
        .expect("utf8mb4 pattern is a valid regex")
});

/// Drop every byte that is not part of a well-formed UTF-8 sequence
///
/// 4-byte sequences are only kept when `allow_4byte` is set, which matches
/// MySQL's `utf8mb4`; the 3-byte `utf8`/`utf8mb3` charsets drop them.
pub fn strip_invalid_utf8(bytes: &[u8], allow_4byte: bool) -> Vec<u8> {
    let pattern = if allow_4byte {
        &*VALID_UTF8MB4
    } else {
        &*VALID_UTF8MB3
    };
    pattern.replace_all(bytes, &b"$1"[..]).into_owned()
}

/// First `max` characters of `value`
pub fn truncate_chars(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// At most `max` bytes of `value`, cut back to the last complete character
pub fn truncate_bytes(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Result of stripping a single value locally
#[derive(Debug, Clone, PartialEq)]
pub enum Stripped {
    /// The value was handled locally
    Done {
        value: String,
        /// Content was removed because it is invalid for the charset
        invalid: bool,
    },
    /// The charset can only be checked by the server
    NeedsServer,
}

/// Validate and truncate a text value for a column charset and length
///
/// `check_ascii` allows the pure-ASCII shortcut; it is turned off when the
/// caller already knows the value is not ASCII.
pub fn strip_locally(
    value: &str,
    charset: &Charset,
    length: Option<ColumnLength>,
    check_ascii: bool,
) -> Stripped {
    let mut truncate_by_bytes = matches!(
        length,
        Some(ColumnLength {
            unit: LengthUnit::Byte,
            ..
        })
    );
    let mut needs_validation = true;

    if charset.is_latin1()
        || *charset == Charset::Binary
        || (check_ascii && value.is_ascii())
    {
        truncate_by_bytes = true;
        needs_validation = false;
    }

    let mut value = value;
    if truncate_by_bytes {
        if let Some(len) = length {
            value = truncate_bytes(value, clamp(len.length));
        }
        if !needs_validation {
            return Stripped::Done {
                value: value.to_string(),
                invalid: false,
            };
        }
    }

    if !charset.is_utf8_family() {
        return Stripped::NeedsServer;
    }

    let stripped = strip_invalid_utf8(value.as_bytes(), charset.name() == "utf8mb4");
    let invalid = stripped.as_slice() != value.as_bytes();
    let stripped = String::from_utf8_lossy(&stripped).into_owned();

    let value = match length {
        Some(ColumnLength {
            unit: LengthUnit::Char,
            length,
        }) => truncate_chars(&stripped, clamp(length)).to_string(),
        _ => stripped,
    };

    Stripped::Done { value, invalid }
}

/// Server-side conversion template for a value, with a single `%s`
///
/// Returns `None` when the conversion would be a no-op (binary without a
/// length).
///
/// # Example
/// ```
/// use filmometre::sql::convert_expression;
/// use filmometre::{Charset, ColumnLength};
///
/// let expr = convert_expression(&Charset::named("sjis"), Some(ColumnLength::chars(20)), "utf8mb4");
/// assert_eq!(
///     expr.as_deref(),
///     Some("CONVERT( LEFT( CONVERT( %s USING sjis ), 20 ) USING utf8mb4 )")
/// );
/// ```
pub fn convert_expression(
    charset: &Charset,
    length: Option<ColumnLength>,
    connection_charset: &str,
) -> Option<String> {
    let source = match length {
        Some(ColumnLength {
            unit: LengthUnit::Byte,
            ..
        }) => "binary",
        _ => charset.name(),
    };

    match length {
        Some(len) => Some(format!(
            "CONVERT( LEFT( CONVERT( %s USING {} ), {} ) USING {} )",
            source, len.length, connection_charset
        )),
        None if source != "binary" => Some(format!(
            "CONVERT( CONVERT( %s USING {} ) USING {} )",
            source, connection_charset
        )),
        None => None,
    }
}

fn clamp(length: u64) -> usize {
    usize::try_from(length).unwrap_or(usize::MAX)
}
