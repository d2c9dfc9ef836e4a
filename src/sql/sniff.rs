//! Statement sniffing
//!
//! Best-effort detection of the first table a statement touches, plus the
//! cheap classifications the collation gate and result handling rely on.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Characters allowed in a sniffed table name: ASCII word characters, `$`,
/// `.`, `` ` ``, `-` and two-byte UTF-8 characters.
const NAME: &str = r"(?:[0-9a-zA-Z$_.`\-]|[\u{80}-\u{7FF}])+";

static NON_SELECT_PARENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\(([^(]*?)\)").expect("parenthesis pattern is a valid regex")
});

static QUICK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?is)^\s*(?:SELECT.*?\s+FROM|INSERT(?:\s+LOW_PRIORITY|\s+DELAYED|\s+HIGH_PRIORITY)?(?:\s+IGNORE)?(?:\s+INTO)?|REPLACE(?:\s+LOW_PRIORITY|\s+DELAYED)?(?:\s+INTO)?|UPDATE(?:\s+LOW_PRIORITY)?(?:\s+IGNORE)?|DELETE(?:\s+LOW_PRIORITY|\s+QUICK|\s+IGNORE)*(?:.+?FROM)?)\s+({NAME})"
    ))
    .expect("common statement pattern is a valid regex")
});

static SHOW_WHERE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    let name = r"(?:[0-9a-zA-Z$_.\-]|[\u{80}-\u{7FF}])+";
    Regex::new(&format!(
        r#"(?is)^\s*SHOW\s+(?:TABLE\s+STATUS|(?:FULL\s+)?TABLES).+WHERE\s+Name\s*=\s*(?:"({name})"|'({name})')"#
    ))
    .expect("SHOW ... WHERE Name pattern is a valid regex")
});

static SHOW_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    let name = r"(?:[\\0-9a-zA-Z$_.\-]|[\u{80}-\u{7FF}])+";
    Regex::new(&format!(
        r#"(?is)^\s*SHOW\s+(?:TABLE\s+STATUS|(?:FULL\s+)?TABLES)\s+(?:WHERE\s+Name\s+)?LIKE\s*(?:"({name}?)%?"|'({name}?)%?')"#
    ))
    .expect("SHOW ... LIKE pattern is a valid regex")
});

static OTHER_TABLE_STATEMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?is)^\s*(?:(?:EXPLAIN\s+(?:EXTENDED\s+)?)?SELECT.*?\s+FROM|DESCRIBE|DESC|EXPLAIN|HANDLER|(?:LOCK|UNLOCK)\s+TABLE(?:S)?|(?:RENAME|OPTIMIZE|BACKUP|RESTORE|CHECK|CHECKSUM|ANALYZE|REPAIR).*\s+TABLE|TRUNCATE(?:\s+TABLE)?|CREATE(?:\s+TEMPORARY)?\s+TABLE(?:\s+IF\s+NOT\s+EXISTS)?|ALTER(?:\s+IGNORE)?\s+TABLE|DROP\s+TABLE(?:\s+IF\s+EXISTS)?|CREATE(?:\s+\w+)?\s+INDEX.*\s+ON|DROP\s+INDEX.*\s+ON|LOAD\s+DATA.*INFILE.*INTO\s+TABLE|(?:GRANT|REVOKE).*ON\s+TABLE|SHOW\s+(?:.*FROM|.*TABLE))\s+\(*\s*({NAME})\s*\)*"
    ))
    .expect("table statement pattern is a valid regex")
});

static METADATA_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:SHOW|DESCRIBE|DESC|EXPLAIN|CREATE)\s")
        .expect("metadata statement pattern is a valid regex")
});

static DDL_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:create|alter|truncate|drop)\s").expect("ddl pattern is a valid regex")
});

static WRITE_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:insert|delete|update|replace)\s").expect("write pattern is a valid regex")
});

static INSERT_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:insert|replace)\s").expect("insert pattern is a valid regex")
});

/// What a statement returns once executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// CREATE / ALTER / TRUNCATE / DROP
    Ddl,
    /// INSERT / DELETE / UPDATE / REPLACE: rows affected
    Write {
        /// INSERT or REPLACE: an auto-increment id may be produced
        inserts: bool,
    },
    /// Everything else: a result set
    Read,
}

impl StatementKind {
    pub fn of(sql: &str) -> Self {
        if DDL_STATEMENT.is_match(sql) {
            StatementKind::Ddl
        } else if WRITE_STATEMENT.is_match(sql) {
            StatementKind::Write {
                inserts: INSERT_STATEMENT.is_match(sql),
            }
        } else {
            StatementKind::Read
        }
    }
}

/// Whether the string is pure 7-bit ASCII
pub fn check_ascii(input: &str) -> bool {
    input.is_ascii()
}

/// Whether the statement only reads or defines metadata (SHOW, DESCRIBE,
/// DESC, EXPLAIN, CREATE) and never needs a collation check
pub fn is_metadata_statement(sql: &str) -> bool {
    METADATA_STATEMENT.is_match(trim_leading(sql))
}

fn trim_leading(sql: &str) -> &str {
    sql.trim_start_matches(['\r', '\n', '\t', ' ', '('])
}

/// Find the first table name referenced by a statement
///
/// Backticks are removed from the result. Returns `None` when no table can
/// be identified.
///
/// # Example
/// ```
/// use filmometre::sql::get_table_from_query;
///
/// assert_eq!(
///     get_table_from_query("SELECT * FROM `ratings` WHERE tconst = 'tt0133093'").as_deref(),
///     Some("ratings")
/// );
/// assert_eq!(get_table_from_query("SELECT 1"), None);
/// ```
pub fn get_table_from_query(query: &str) -> Option<String> {
    let query = query.trim_end_matches([';', '/', '-', '#']);
    let query = trim_leading(query);

    // Keep nested selects, empty out every other parenthesized group.
    let query = NON_SELECT_PARENS.replace_all(query, |caps: &Captures| {
        let inner = &caps[1];
        let head = inner.trim_start();
        if head
            .get(..6)
            .is_some_and(|word| word.eq_ignore_ascii_case("select"))
        {
            caps[0].to_string()
        } else {
            "()".to_string()
        }
    });

    if let Some(caps) = QUICK.captures(&query) {
        return Some(caps[1].replace('`', ""));
    }

    if let Some(caps) = SHOW_WHERE_NAME.captures(&query) {
        return caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string());
    }

    if let Some(caps) = SHOW_LIKE.captures(&query) {
        return caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().replace("\\_", "_"));
    }

    OTHER_TABLE_STATEMENTS
        .captures(&query)
        .map(|caps| caps[1].replace('`', ""))
}
