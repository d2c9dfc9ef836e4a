//! Placeholder parsing and safe value substitution
//!
//! Templates use a `sprintf`-like grammar:
//!
//! - `%d` integer, `%f` float (rendered locale-independent), `%s` string,
//!   `%i` identifier
//! - numbered references (`%2$s`), sign/padding/alignment flags, width and
//!   precision (`%.2f`, `%'#10s`)
//! - `%%` for a literal percent
//!
//! Parsing produces a flat list of [`Segment`]s. Rendering escapes every
//! argument according to the placeholder that consumes it and returns a
//! statement in which every `%` has been replaced by the per-process
//! placeholder-escape sentinel.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{DbError, Result};
use crate::sql::escape::{add_placeholder_escape, escape_identifier_value};
use crate::types::Value;

/// Everything allowed between `%` and the conversion character, plus the
/// conversion character itself.
static PLACEHOLDER_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[1-9][0-9]*\$)?[-+0-9]*(?: |0|'.)?[-+0-9]*(?:\.[0-9]+)?[sdfFi]")
        .expect("placeholder grammar is a valid regex")
});

static LEADING_FLOAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:[eE][+-]?[0-9]+)?")
        .expect("leading float is a valid regex")
});

/// How a placeholder renders its argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// `%s`: escaped string value
    Str,
    /// `%d`: integer
    Int,
    /// `%f` / `%F`: float with a `.` decimal separator
    Float,
    /// `%i`: backtick-quoted identifier
    Ident,
}

/// Padding, alignment, sign, width and precision of a placeholder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatSpec {
    pub left_align: bool,
    pub plus_sign: bool,
    pub pad: Option<char>,
    pub width: Option<usize>,
    pub precision: Option<usize>,
}

impl FormatSpec {
    /// Parse the flag/width/precision part of a placeholder (no argnum,
    /// no conversion character)
    pub fn parse(text: &str) -> Self {
        let mut spec = FormatSpec::default();
        let mut chars = text.chars().peekable();

        while let Some(&c) = chars.peek() {
            match c {
                '-' => spec.left_align = true,
                '+' => spec.plus_sign = true,
                '0' | ' ' => spec.pad = Some(c),
                '\'' => {
                    chars.next();
                    spec.pad = chars.peek().copied();
                }
                _ => break,
            }
            chars.next();
        }

        let mut width = String::new();
        while let Some(&c) = chars.peek() {
            match c {
                '0'..='9' => width.push(c),
                // alignment or sign after the width, e.g. `%05-s`
                '-' => spec.left_align = true,
                '+' => spec.plus_sign = true,
                _ => break,
            }
            chars.next();
        }
        spec.width = width.parse().ok();

        if chars.next() == Some('.') {
            let precision: String = chars.take_while(char::is_ascii_digit).collect();
            spec.precision = precision.parse().ok();
        }

        spec
    }

    fn pad(&self, body: String) -> String {
        let width = match self.width {
            Some(w) => w,
            None => return body,
        };
        let len = body.chars().count();
        if len >= width {
            return body;
        }
        let fill: String = std::iter::repeat_n(self.pad.unwrap_or(' '), width - len).collect();
        if self.left_align {
            body + &fill
        } else {
            fill + &body
        }
    }

    fn pad_number(&self, body: String) -> String {
        // zero padding goes between the sign and the digits
        if self.pad == Some('0') && !self.left_align {
            if let Some(width) = self.width {
                let (sign, digits) = match body.strip_prefix(['-', '+']) {
                    Some(rest) => (&body[..1], rest),
                    None => ("", body.as_str()),
                };
                let len = sign.len() + digits.chars().count();
                if len < width {
                    return format!("{}{}{}", sign, "0".repeat(width - len), digits);
                }
                return body;
            }
        }
        self.pad(body)
    }
}

/// A recognized placeholder after rewriting
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    /// Source text, e.g. `%1$s`
    pub text: String,
    /// 1-based numbered reference, when present
    pub argnum: Option<usize>,
    pub spec: FormatSpec,
    pub conversion: Conversion,
    /// Whether the rendered value is wrapped in single quotes
    pub quoted: bool,
    /// 0-based index into the argument list
    pub arg_index: usize,
}

impl Placeholder {
    /// Whether the placeholder carries anything besides the conversion char
    pub fn is_formatted(&self) -> bool {
        self.text.len() > 2
    }
}

/// Piece of a parsed template
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text, with `%%` already collapsed to `%`
    Literal(String),
    Placeholder(Placeholder),
}

/// Options controlling how a template is parsed and rendered
#[derive(Debug, Clone, Copy)]
pub struct PrepareOptions {
    /// Arguments were supplied as one array rather than individually
    pub passed_as_array: bool,
    /// Keep the legacy unquoted `%s` and `%%%f` behaviors
    pub allow_unsafe_unquoted_parameters: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            passed_as_array: false,
            allow_unsafe_unquoted_parameters: true,
        }
    }
}

/// A parsed statement template
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
    placeholder_count: usize,
}

impl Template {
    /// Parse a template, applying the quoting and escaping decision table
    pub fn parse(query: &str, allow_unsafe_unquoted_parameters: bool) -> Result<Self> {
        if !query.contains('%') {
            return Err(DbError::prepare(
                "The query argument of prepare() must have a placeholder.",
            ));
        }

        // Existing quotes around %s are dropped and re-added uniformly.
        let query = query.replace("'%s'", "%s").replace("\"%s\"", "%s");

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut after_percent = false;
        let mut next_sequential = 0usize;
        let mut placeholder_count = 0usize;

        let mut pos = 0;
        while pos < query.len() {
            let rest = &query[pos..];
            let Some(ch) = rest.chars().next() else {
                break;
            };

            if ch != '%' {
                literal.push(ch);
                after_percent = false;
                pos += ch.len_utf8();
                continue;
            }

            let tail = &rest[1..];
            if tail.starts_with('%') {
                literal.push('%');
                after_percent = true;
                pos += 2;
                continue;
            }

            let Some(m) = PLACEHOLDER_SPEC.find(tail) else {
                // unrecognized: treated as an escaped literal percent
                literal.push('%');
                after_percent = true;
                pos += 1;
                continue;
            };

            let body = m.as_str();
            let text = format!("%{}", body);
            pos += 1 + body.len();

            let (type_char, format) = match body.char_indices().last() {
                Some((idx, c)) => (c, &body[..idx]),
                None => continue,
            };

            let (argnum, flags) = match format.find('$') {
                Some(idx) => (format[..idx].parse::<usize>().ok(), &format[idx + 1..]),
                None => (None, format),
            };

            if type_char == 'f' && allow_unsafe_unquoted_parameters && after_percent {
                // "%%%f" stays a literal "%%f", it was never a placeholder
                literal.push('%');
                literal.push_str(format);
                literal.push('f');
                after_percent = false;
                continue;
            }

            let conversion = match type_char {
                'd' => Conversion::Int,
                'f' | 'F' => Conversion::Float,
                'i' => Conversion::Ident,
                _ => Conversion::Str,
            };

            let quoted = conversion == Conversion::Str
                && (!allow_unsafe_unquoted_parameters || (format.is_empty() && !after_percent));

            let arg_index = match argnum {
                Some(n) => n - 1,
                None => {
                    let idx = next_sequential;
                    next_sequential += 1;
                    idx
                }
            };

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Placeholder(Placeholder {
                text,
                argnum,
                spec: FormatSpec::parse(flags),
                conversion,
                quoted,
                arg_index,
            }));
            placeholder_count += 1;
            after_percent = false;
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if placeholder_count == 0 {
            return Err(DbError::prepare(
                "The query argument of prepare() must have a placeholder.",
            ));
        }

        let template = Self {
            segments,
            placeholder_count,
        };
        template.check_dual_use()?;
        Ok(template)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(p) => Some(p),
            Segment::Literal(_) => None,
        })
    }

    pub fn placeholder_count(&self) -> usize {
        self.placeholder_count
    }

    /// Argument indexes that must be escaped as identifiers
    pub fn identifier_indexes(&self) -> BTreeSet<usize> {
        self.placeholders()
            .filter(|p| p.conversion == Conversion::Ident)
            .map(|p| p.arg_index)
            .collect()
    }

    fn check_dual_use(&self) -> Result<()> {
        let identifiers = self.identifier_indexes();
        let strings: BTreeSet<usize> = self
            .placeholders()
            .filter(|p| p.conversion == Conversion::Str)
            .map(|p| p.arg_index)
            .collect();

        let dual_use: Vec<usize> = identifiers.intersection(&strings).copied().collect();
        if dual_use.is_empty() {
            return Ok(());
        }

        let mut used: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for p in self.placeholders() {
            used.entry(p.arg_index).or_default().push(&p.text);
        }
        let conflicts: Vec<String> = dual_use
            .iter()
            .map(|idx| used.get(idx).map(|v| v.join(" and ")).unwrap_or_default())
            .collect();

        Err(DbError::prepare(format!(
            "Arguments cannot be prepared as both an Identifier and Value. Found the following conflicts: {}",
            conflicts.join(", ")
        )))
    }

    /// Substitute arguments and return the escaped statement
    ///
    /// `escape` performs string-literal escaping (normally the connection's
    /// `real_escape_string`).
    pub fn render(
        &self,
        args: &[Value],
        passed_as_array: bool,
        escape: &dyn Fn(&str) -> String,
    ) -> Result<String> {
        self.check_arg_count(args.len(), passed_as_array)?;

        let identifiers = self.identifier_indexes();
        let escaped: Vec<Escaped> = args
            .iter()
            .enumerate()
            .map(|(i, value)| {
                if identifiers.contains(&i) {
                    Escaped::Text(escape_identifier_value(&value.to_text()))
                } else {
                    match value {
                        Value::Int(v) => Escaped::Int(*v),
                        Value::Float(v) => Escaped::Float(*v),
                        Value::Null => Escaped::Text(String::new()),
                        Value::Text(s) | Value::Identifier(s) => {
                            Escaped::Text(add_placeholder_escape(&escape(s)))
                        }
                    }
                }
            })
            .collect();

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(p) => {
                    let arg = escaped.get(p.arg_index).ok_or_else(|| {
                        DbError::prepare(format!(
                            "Placeholder {} refers to argument {} but only {} were passed.",
                            p.text,
                            p.arg_index + 1,
                            args.len()
                        ))
                    })?;
                    out.push_str(&render_placeholder(p, arg));
                }
            }
        }

        Ok(add_placeholder_escape(&out))
    }

    fn check_arg_count(&self, args_count: usize, passed_as_array: bool) -> Result<()> {
        let placeholder_count = self.placeholder_count;
        if args_count == placeholder_count {
            return Ok(());
        }

        if placeholder_count == 1 && passed_as_array {
            return Err(DbError::prepare(
                "The query only expected one placeholder, but an array of multiple placeholders was sent.",
            ));
        }

        let message = format!(
            "The query does not contain the correct number of placeholders ({}) for the number of arguments passed ({}).",
            placeholder_count, args_count
        );
        tracing::warn!(target: "filmometre::prepare", "{}", message);

        if args_count < placeholder_count {
            let max_numbered = self.placeholders().filter_map(|p| p.argnum).max();
            match max_numbered {
                Some(max) if args_count >= max => {}
                _ => return Err(DbError::prepare(message)),
            }
        }

        Ok(())
    }
}

/// Parse and render in one step
pub fn prepare(
    query: &str,
    args: &[Value],
    options: PrepareOptions,
    escape: &dyn Fn(&str) -> String,
) -> Result<String> {
    Template::parse(query, options.allow_unsafe_unquoted_parameters)?.render(
        args,
        options.passed_as_array,
        escape,
    )
}

/// Argument after escaping, before formatting
#[derive(Debug, Clone, PartialEq)]
enum Escaped {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Escaped {
    fn as_text(&self) -> String {
        match self {
            Escaped::Int(v) => v.to_string(),
            Escaped::Float(v) => v.to_string(),
            Escaped::Text(s) => s.clone(),
        }
    }

    fn as_int(&self) -> i64 {
        match self {
            Escaped::Int(v) => *v,
            Escaped::Float(v) => *v as i64,
            Escaped::Text(s) => leading_int(s),
        }
    }

    fn as_float(&self) -> f64 {
        match self {
            Escaped::Int(v) => *v as f64,
            Escaped::Float(v) => *v,
            Escaped::Text(s) => LEADING_FLOAT
                .find(s)
                .and_then(|m| m.as_str().trim().parse().ok())
                .unwrap_or(0.0),
        }
    }
}

/// Integer value of the leading digits of a string, 0 when there are none
fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let value: i64 = digits[..end].parse().unwrap_or(0);
    if negative { -value } else { value }
}

fn render_placeholder(p: &Placeholder, arg: &Escaped) -> String {
    match p.conversion {
        Conversion::Int => {
            let v = arg.as_int();
            let body = if p.spec.plus_sign && v >= 0 {
                format!("+{}", v)
            } else {
                v.to_string()
            };
            p.spec.pad_number(body)
        }
        Conversion::Float => {
            let v = arg.as_float();
            let precision = p.spec.precision.unwrap_or(6);
            let body = if p.spec.plus_sign && v >= 0.0 {
                format!("+{:.*}", precision, v)
            } else {
                format!("{:.*}", precision, v)
            };
            p.spec.pad_number(body)
        }
        Conversion::Str | Conversion::Ident => {
            let mut text = arg.as_text();
            if let Some(precision) = p.spec.precision {
                text = text.chars().take(precision).collect();
            }
            let body = p.spec.pad(text);
            match (p.conversion, p.quoted) {
                (Conversion::Ident, _) => format!("`{}`", body),
                (_, true) => format!("'{}'", body),
                _ => body,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::escape::{real_escape_string, remove_placeholder_escape};

    fn run(query: &str, args: &[Value]) -> Result<String> {
        prepare(
            query,
            args,
            PrepareOptions::default(),
            &real_escape_string,
        )
        .map(|sql| remove_placeholder_escape(&sql))
    }

    // =========================================================================
    // Template parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_segments() {
        let t = Template::parse("SELECT * FROM t WHERE a = %s AND b = %d", true).unwrap();
        assert_eq!(t.placeholder_count(), 2);
        assert_eq!(t.segments().len(), 4);
        assert_eq!(
            t.segments()[0],
            Segment::Literal("SELECT * FROM t WHERE a = ".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_missing_percent() {
        let err = Template::parse("SELECT 1", true).unwrap_err();
        assert!(err.to_string().contains("must have a placeholder"));
    }

    #[test]
    fn test_parse_rejects_only_literal_percents() {
        assert!(Template::parse("SELECT '100%%'", true).is_err());
    }

    #[test]
    fn test_parse_numbered_indexes() {
        let t = Template::parse("%2$s %s %1$d %s", true).unwrap();
        let indexes: Vec<usize> = t.placeholders().map(|p| p.arg_index).collect();
        assert_eq!(indexes, vec![1, 0, 0, 1]);
    }

    #[test]
    fn test_parse_quoting_table() {
        let t = Template::parse("%s %1$s %5s %%%s %d %F %i", true).unwrap();
        let quoted: Vec<bool> = t.placeholders().map(|p| p.quoted).collect();
        assert_eq!(quoted, vec![true, false, false, false, false, false, false]);
    }

    #[test]
    fn test_parse_strict_mode_always_quotes_strings() {
        let t = Template::parse("%1$s %%%s", false).unwrap();
        assert!(t.placeholders().all(|p| p.quoted));
    }

    #[test]
    fn test_format_spec_parse() {
        let spec = FormatSpec::parse("'#10.3");
        assert_eq!(spec.pad, Some('#'));
        assert_eq!(spec.width, Some(10));
        assert_eq!(spec.precision, Some(3));

        let spec = FormatSpec::parse("-+05");
        assert!(spec.left_align);
        assert!(spec.plus_sign);
        assert_eq!(spec.pad, Some('0'));
        assert_eq!(spec.width, Some(5));
    }

    // =========================================================================
    // String value Tests
    // =========================================================================

    #[test]
    fn test_string_is_quoted_and_escaped() {
        let sql = run("SELECT * FROM ratings WHERE tconst = %s", &["x' OR '1'='1".into()]).unwrap();
        assert_eq!(sql, "SELECT * FROM ratings WHERE tconst = 'x\\' OR \\'1\\'=\\'1'");
    }

    #[test]
    fn test_existing_quotes_are_normalized() {
        let a = run("SELECT '%s'", &["v".into()]).unwrap();
        let b = run("SELECT \"%s\"", &["v".into()]).unwrap();
        assert_eq!(a, "SELECT 'v'");
        assert_eq!(b, "SELECT 'v'");
    }

    #[test]
    fn test_percent_in_value_becomes_sentinel() {
        let sql = prepare(
            "SELECT * FROM t WHERE a LIKE %s",
            &["%matrix%".into()],
            PrepareOptions::default(),
            &real_escape_string,
        )
        .unwrap();
        assert!(!sql.contains('%'));
        assert_eq!(
            remove_placeholder_escape(&sql),
            "SELECT * FROM t WHERE a LIKE '%matrix%'"
        );
    }

    #[test]
    fn test_null_renders_empty_string() {
        assert_eq!(run("SELECT %s", &[Value::Null]).unwrap(), "SELECT ''");
    }

    #[test]
    fn test_legacy_numbered_string_unquoted() {
        let sql = run("SELECT * FROM t WHERE a = '%1$s'", &["it's".into()]).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = 'it\\'s'");
    }

    #[test]
    fn test_legacy_like_wrapping() {
        let sql = run("SELECT * FROM t WHERE a LIKE '%%%s%%'", &["neo".into()]).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a LIKE '%neo%'");
    }

    #[test]
    fn test_string_precision_and_padding() {
        assert_eq!(run("SELECT %.3s", &["abcdef".into()]).unwrap(), "SELECT abc");
        assert_eq!(run("SELECT %'*6s", &["ab".into()]).unwrap(), "SELECT ****ab");
        assert_eq!(run("SELECT %-4s|", &["ab".into()]).unwrap(), "SELECT ab  |");
    }

    // =========================================================================
    // Numeric Tests
    // =========================================================================

    #[test]
    fn test_integer_and_float() {
        let sql = run("SELECT %d, %f", &[42.into(), 7.5.into()]).unwrap();
        assert_eq!(sql, "SELECT 42, 7.500000");
    }

    #[test]
    fn test_float_precision() {
        assert_eq!(run("SELECT %.2f", &[8.456.into()]).unwrap(), "SELECT 8.46");
    }

    #[test]
    fn test_numeric_from_text() {
        let sql = run("SELECT %d, %d, %F", &["12abc".into(), "abc".into(), "2.5x".into()]).unwrap();
        assert_eq!(sql, "SELECT 12, 0, 2.500000");
    }

    #[test]
    fn test_numeric_text_is_not_injected() {
        let sql = run("DELETE FROM t WHERE id = %d", &["1 OR 1=1".into()]).unwrap();
        assert_eq!(sql, "DELETE FROM t WHERE id = 1");
    }

    #[test]
    fn test_integer_sign_and_zero_pad() {
        assert_eq!(run("SELECT %+d", &[5.into()]).unwrap(), "SELECT +5");
        assert_eq!(run("SELECT %05d", &[(-3).into()]).unwrap(), "SELECT -0003");
    }

    #[test]
    fn test_legacy_escaped_float_is_literal() {
        let sql = run("SELECT '%%%f', %d", &[3.into()]).unwrap();
        assert_eq!(sql, "SELECT '%%f', 3");
    }

    // =========================================================================
    // Identifier Tests
    // =========================================================================

    #[test]
    fn test_identifier_backticks_doubled() {
        let sql = run("SELECT * FROM %i", &[Value::ident("rat`ings")]).unwrap();
        assert_eq!(sql, "SELECT * FROM `rat``ings`");
    }

    #[test]
    fn test_identifier_text_value() {
        let sql = run("SELECT %i FROM t", &["col'name".into()]).unwrap();
        assert_eq!(sql, "SELECT `col'name` FROM t");
    }

    #[test]
    fn test_identifier_value_in_string_slot_is_text() {
        let sql = run("SELECT %s", &[Value::ident("o'brien")]).unwrap();
        assert_eq!(sql, "SELECT 'o\\'brien'");
    }

    #[test]
    fn test_numbered_string_then_sequential_identifier_conflict() {
        // sequential numbering follows sprintf: `%i` takes argument 1 too
        let err = run("SELECT %1$s FROM %i", &["films".into()]).unwrap_err();
        assert!(err.to_string().contains("%1$s and %i"));

        let sql = run("SELECT %2$s FROM %i", &["films".into(), "title".into()]).unwrap();
        assert_eq!(sql, "SELECT title FROM `films`");
    }

    #[test]
    fn test_dual_use_is_rejected() {
        let err = run("SELECT %1$i FROM t WHERE a = %1$s", &["x".into()]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("both an Identifier and Value"));
        assert!(msg.contains("%1$i and %1$s"));
    }

    // =========================================================================
    // Argument count Tests
    // =========================================================================

    #[test]
    fn test_too_few_arguments_rejected() {
        assert!(run("SELECT %s, %s", &["a".into()]).is_err());
    }

    #[test]
    fn test_too_many_arguments_is_only_a_warning() {
        let sql = run("SELECT %s", &["a".into(), "b".into()]).unwrap();
        assert_eq!(sql, "SELECT 'a'");
    }

    #[test]
    fn test_array_for_single_placeholder_rejected() {
        let template = Template::parse("SELECT %s", true).unwrap();
        let err = template
            .render(&["a".into(), "b".into()], true, &real_escape_string)
            .unwrap_err();
        assert!(err.to_string().contains("only expected one placeholder"));
    }

    #[test]
    fn test_numbered_reuse_with_fewer_arguments() {
        let sql = run("SELECT %1$s, '%1$s'", &["a".into()]).unwrap();
        assert_eq!(sql, "SELECT a, 'a'");
    }

    #[test]
    fn test_numbered_reference_past_arguments_rejected() {
        assert!(run("SELECT %s, %3$s", &["a".into(), "b".into()]).is_err());
    }

    // =========================================================================
    // Helpers Tests
    // =========================================================================

    #[test]
    fn test_leading_int() {
        assert_eq!(leading_int("  42rest"), 42);
        assert_eq!(leading_int("-7"), -7);
        assert_eq!(leading_int("+3"), 3);
        assert_eq!(leading_int("x1"), 0);
    }

    mod escaping_properties {
        use super::*;
        use crate::sql::escape::add_placeholder_escape;
        use proptest::prelude::*;

        /// Undo MySQL backslash escaping; `None` if an unescaped quote
        /// ends the literal early
        fn unescape_literal(body: &str) -> Option<String> {
            let mut out = String::new();
            let mut chars = body.chars();
            while let Some(c) = chars.next() {
                match c {
                    '\'' => return None,
                    '\\' => out.push(match chars.next()? {
                        '0' => '\0',
                        'n' => '\n',
                        'r' => '\r',
                        'Z' => '\x1a',
                        other => other,
                    }),
                    c => out.push(c),
                }
            }
            Some(out)
        }

        proptest! {
            /// A `%s` argument always stays inside its literal
            #[test]
            fn string_argument_never_closes_the_literal(s in r#"[a-z0-9 '`%\\"]{0,40}"#) {
                let sql = run("SELECT %s", &[s.clone().into()]).unwrap();
                let body = sql
                    .strip_prefix("SELECT '")
                    .and_then(|rest| rest.strip_suffix('\''));
                prop_assert!(body.is_some(), "not a single literal: {}", sql);
                prop_assert_eq!(unescape_literal(body.unwrap()), Some(s));
            }

            #[test]
            fn arbitrary_string_argument_round_trips(s in ".*") {
                let sql = run("SELECT %s", &[s.clone().into()]).unwrap();
                let body = &sql["SELECT '".len()..sql.len() - 1];
                prop_assert_eq!(unescape_literal(body), Some(s));
            }

            /// `%i` doubles every backtick and nothing else
            #[test]
            fn identifier_backticks_are_always_doubled(s in r#"[a-z0-9 '`%\\"]{0,40}"#) {
                let sql = run("SELECT * FROM %i", &[Value::ident(s.clone())]).unwrap();
                let body = sql
                    .strip_prefix("SELECT * FROM `")
                    .and_then(|rest| rest.strip_suffix('`'))
                    .unwrap();
                prop_assert!(!body.replace("``", "").contains('`'), "lone backtick in: {}", sql);
                prop_assert_eq!(body.replace("``", "`"), s);
            }

            #[test]
            fn placeholder_escape_round_trips(s in ".*") {
                let escaped = add_placeholder_escape(&s);
                prop_assert!(!escaped.contains('%'));
                prop_assert_eq!(remove_placeholder_escape(&escaped), s);
            }
        }
    }
}
