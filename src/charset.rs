//! Charset, collation and server capability rules
//!
//! Pure functions over `SHOW FULL COLUMNS` rows and the server version
//! string. The [`Database`](crate::Database) caches their results.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::DbError;
use crate::types::{Charset, ColumnLength, ColumnMeta};

/// Collations whose comparisons are known not to be affected by invalid text
pub const SAFE_COLLATIONS: &[&str] = &[
    "utf8_bin",
    "utf8_general_ci",
    "utf8mb3_bin",
    "utf8mb3_general_ci",
    "utf8mb4_bin",
    "utf8mb4_general_ci",
];

const BINARY_TYPES: &[&str] = &[
    "binary",
    "varbinary",
    "tinyblob",
    "mediumblob",
    "blob",
    "longblob",
];

pub fn is_safe_collation(collation: &str) -> bool {
    SAFE_COLLATIONS.contains(&collation)
}

/// Resolve the charset of a whole table from its columns
///
/// - any binary/blob column makes the table [`Charset::Binary`]
/// - `utf8mb3` counts as `utf8`
/// - a single charset wins; no charset at all means no constraint (`None`)
/// - with several, `latin1` is ignored; `utf8` + `utf8mb4` resolve to
///   `utf8`; any other mix falls back to `ascii`
pub fn classify_table_charset<'a>(
    columns: impl IntoIterator<Item = &'a ColumnMeta>,
) -> Option<Charset> {
    let mut charsets = BTreeSet::new();

    for column in columns {
        if let Some(charset) = column.charset() {
            charsets.insert(charset);
        }
        if BINARY_TYPES.contains(&column.base_type().as_str()) {
            return Some(Charset::Binary);
        }
    }

    if charsets.remove("utf8mb3") {
        charsets.insert("utf8".to_string());
    }

    match charsets.len() {
        0 => None,
        1 => charsets.into_iter().next().map(Charset::named),
        _ => {
            charsets.remove("latin1");
            let mut iter = charsets.iter();
            match (charsets.len(), iter.next(), iter.next()) {
                (1, Some(only), _) => Some(Charset::named(only)),
                (2, Some(a), Some(b)) if a == "utf8" && b == "utf8mb4" => {
                    Some(Charset::named("utf8"))
                }
                _ => Some(Charset::named("ascii")),
            }
        }
    }
}

/// Maximum length of a string column, `None` for other types
pub fn column_length(column: &ColumnMeta) -> Option<ColumnLength> {
    let declared = || -> u64 {
        column
            .column_type
            .split_once('(')
            .and_then(|(_, rest)| rest.split(')').next())
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(0)
    };

    match column.base_type().as_str() {
        "char" | "varchar" => Some(ColumnLength::chars(declared())),
        "binary" | "varbinary" => Some(ColumnLength::bytes(declared())),
        "tinyblob" | "tinytext" => Some(ColumnLength::bytes(255)),
        "blob" | "text" => Some(ColumnLength::bytes(65_535)),
        "mediumblob" | "mediumtext" => Some(ColumnLength::bytes(16_777_215)),
        "longblob" | "longtext" => Some(ColumnLength::bytes(4_294_967_295)),
        _ => None,
    }
}

/// Connection charset and collation to request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharsetCollate {
    pub charset: String,
    pub collate: String,
}

/// Upgrade a requested charset/collation to what the server supports
///
/// `utf8` becomes `utf8mb4`; the legacy `_general_` collation is upgraded to
/// `utf8mb4_unicode_ci`, and to `utf8mb4_unicode_520_ci` when the server
/// has it.
pub fn determine_charset(charset: &str, collate: &str, server_info: &str) -> CharsetCollate {
    let mut charset = charset.to_string();
    let mut collate = collate.to_string();

    if charset == "utf8" {
        charset = "utf8mb4".to_string();
    }

    if charset == "utf8mb4" {
        collate = if collate.is_empty() || collate == "utf8_general_ci" {
            "utf8mb4_unicode_ci".to_string()
        } else {
            collate.replace("utf8_", "utf8mb4_")
        };
    }

    if collate == "utf8mb4_unicode_ci" && has_cap(server_info, DbCapability::Utf8mb4_520) {
        collate = "utf8mb4_unicode_520_ci".to_string();
    }

    CharsetCollate { charset, collate }
}

/// Server features gated on version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum DbCapability {
    Collation,
    GroupConcat,
    Subqueries,
    SetCharset,
    Utf8mb4,
    Utf8mb4_520,
    IdentifierPlaceholders,
}

impl FromStr for DbCapability {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "collation" => Ok(Self::Collation),
            "group_concat" => Ok(Self::GroupConcat),
            "subqueries" => Ok(Self::Subqueries),
            "set_charset" => Ok(Self::SetCharset),
            "utf8mb4" => Ok(Self::Utf8mb4),
            "utf8mb4_520" => Ok(Self::Utf8mb4_520),
            "identifier_placeholders" => Ok(Self::IdentifierPlaceholders),
            other => Err(DbError::validation(format!("Unknown capability '{}'", other))),
        }
    }
}

/// Whether a server reporting `server_info` supports `cap`
pub fn has_cap(server_info: &str, cap: DbCapability) -> bool {
    let version = server_version(server_info);
    match cap {
        DbCapability::Collation | DbCapability::GroupConcat | DbCapability::Subqueries => {
            version_at_least(&version, &[4, 1])
        }
        DbCapability::SetCharset => version_at_least(&version, &[5, 0, 7]),
        DbCapability::Utf8mb4 | DbCapability::IdentifierPlaceholders => true,
        DbCapability::Utf8mb4_520 => version_at_least(&version, &[5, 6]),
    }
}

/// Numeric version from a server info string (`8.0.36-log` -> `[8, 0, 36]`)
///
/// Old MariaDB clients report `5.5.5-10.6.12-MariaDB`; the real version
/// after the prefix is used.
pub fn server_version(server_info: &str) -> Vec<u64> {
    let info = match server_info.strip_prefix("5.5.5-") {
        Some(rest) if server_info.contains("MariaDB") => rest,
        _ => server_info,
    };

    let numeric: String = info
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    numeric
        .split('.')
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

fn version_at_least(version: &[u64], minimum: &[u64]) -> bool {
    let len = version.len().max(minimum.len());
    for i in 0..len {
        let a = version.get(i).copied().unwrap_or(0);
        let b = minimum.get(i).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(field: &str, ty: &str, collation: Option<&str>) -> ColumnMeta {
        ColumnMeta::new(field, ty, collation)
    }

    // =========================================================================
    // Table charset Tests
    // =========================================================================

    #[test]
    fn test_single_charset() {
        let cols = [
            col("id", "int(11)", None),
            col("tconst", "varchar(20)", Some("utf8mb4_unicode_ci")),
        ];
        assert_eq!(classify_table_charset(&cols), Some(Charset::named("utf8mb4")));
    }

    #[test]
    fn test_no_charset_means_no_constraint() {
        let cols = [col("id", "int(11)", None), col("rating", "decimal(3,1)", None)];
        assert_eq!(classify_table_charset(&cols), None);
    }

    #[test]
    fn test_binary_column_wins() {
        let cols = [
            col("title", "varchar(255)", Some("utf8mb4_unicode_ci")),
            col("poster", "mediumblob", None),
        ];
        assert_eq!(classify_table_charset(&cols), Some(Charset::Binary));
    }

    #[test]
    fn test_utf8mb3_folds_into_utf8() {
        let cols = [
            col("a", "varchar(5)", Some("utf8mb3_general_ci")),
            col("b", "varchar(5)", Some("utf8_bin")),
        ];
        assert_eq!(classify_table_charset(&cols), Some(Charset::named("utf8")));
    }

    #[test]
    fn test_latin1_is_dropped_from_mix() {
        let cols = [
            col("a", "varchar(5)", Some("latin1_swedish_ci")),
            col("b", "varchar(5)", Some("utf8mb4_unicode_ci")),
        ];
        assert_eq!(classify_table_charset(&cols), Some(Charset::named("utf8mb4")));
    }

    #[test]
    fn test_utf8_and_utf8mb4_resolve_to_utf8() {
        let cols = [
            col("a", "varchar(5)", Some("utf8_general_ci")),
            col("b", "varchar(5)", Some("utf8mb4_unicode_ci")),
        ];
        assert_eq!(classify_table_charset(&cols), Some(Charset::named("utf8")));
    }

    #[test]
    fn test_other_mix_falls_back_to_ascii() {
        let cols = [
            col("a", "varchar(5)", Some("sjis_japanese_ci")),
            col("b", "varchar(5)", Some("utf8mb4_unicode_ci")),
        ];
        assert_eq!(classify_table_charset(&cols), Some(Charset::named("ascii")));
    }

    // =========================================================================
    // Column length Tests
    // =========================================================================

    #[test]
    fn test_column_lengths() {
        assert_eq!(
            column_length(&col("t", "varchar(20)", None)),
            Some(ColumnLength::chars(20))
        );
        assert_eq!(
            column_length(&col("t", "CHAR(9)", None)),
            Some(ColumnLength::chars(9))
        );
        assert_eq!(
            column_length(&col("t", "varbinary(16)", None)),
            Some(ColumnLength::bytes(16))
        );
        assert_eq!(
            column_length(&col("t", "tinytext", None)),
            Some(ColumnLength::bytes(255))
        );
        assert_eq!(
            column_length(&col("t", "text", None)),
            Some(ColumnLength::bytes(65_535))
        );
        assert_eq!(
            column_length(&col("t", "mediumblob", None)),
            Some(ColumnLength::bytes(16_777_215))
        );
        assert_eq!(
            column_length(&col("t", "longtext", None)),
            Some(ColumnLength::bytes(4_294_967_295))
        );
        assert_eq!(column_length(&col("t", "int(11) unsigned", None)), None);
        assert_eq!(column_length(&col("t", "decimal(3,1)", None)), None);
    }

    // =========================================================================
    // Collation Tests
    // =========================================================================

    #[test]
    fn test_safe_collations() {
        assert!(is_safe_collation("utf8mb4_bin"));
        assert!(is_safe_collation("utf8_general_ci"));
        assert!(!is_safe_collation("utf8mb4_unicode_ci"));
        assert!(!is_safe_collation("latin1_swedish_ci"));
    }

    #[test]
    fn test_determine_charset_upgrades_utf8() {
        let cc = determine_charset("utf8", "utf8_general_ci", "5.5.62");
        assert_eq!(cc.charset, "utf8mb4");
        assert_eq!(cc.collate, "utf8mb4_unicode_ci");
    }

    #[test]
    fn test_determine_charset_uses_520_when_available() {
        let cc = determine_charset("utf8mb4", "", "8.0.36");
        assert_eq!(cc.collate, "utf8mb4_unicode_520_ci");
    }

    #[test]
    fn test_determine_charset_maps_utf8_collation() {
        let cc = determine_charset("utf8mb4", "utf8_bin", "8.0.36");
        assert_eq!(cc.collate, "utf8mb4_bin");
    }

    #[test]
    fn test_determine_charset_leaves_other_charsets() {
        let cc = determine_charset("latin1", "latin1_swedish_ci", "8.0.36");
        assert_eq!(cc.charset, "latin1");
        assert_eq!(cc.collate, "latin1_swedish_ci");
    }

    // =========================================================================
    // Capability Tests
    // =========================================================================

    #[test]
    fn test_server_version_parsing() {
        assert_eq!(server_version("8.0.36-log"), vec![8, 0, 36]);
        assert_eq!(server_version("5.5.5-10.6.12-MariaDB"), vec![10, 6, 12]);
        assert_eq!(server_version("5.5.5-log"), vec![5, 5, 5]);
    }

    #[test]
    fn test_has_cap() {
        assert!(has_cap("5.0.7", DbCapability::SetCharset));
        assert!(!has_cap("5.0.6", DbCapability::SetCharset));
        assert!(has_cap("4.1", DbCapability::Collation));
        assert!(!has_cap("4.0.30", DbCapability::GroupConcat));
        assert!(!has_cap("5.5.62", DbCapability::Utf8mb4_520));
        assert!(has_cap("5.6.0", DbCapability::Utf8mb4_520));
        assert!(has_cap("", DbCapability::Utf8mb4));
        assert!(has_cap("", DbCapability::IdentifierPlaceholders));
    }

    #[test]
    fn test_capability_from_str() {
        assert_eq!(
            "UTF8MB4_520".parse::<DbCapability>().unwrap(),
            DbCapability::Utf8mb4_520
        );
        assert!("window_functions".parse::<DbCapability>().is_err());
    }
}
