//! SQL utilities
//!
//! Statement templating, escaping, table-name sniffing and local text
//! validation. Nothing here talks to the server.

pub mod encoding;
pub mod escape;
pub mod placeholder;
pub mod sniff;

pub use encoding::{Stripped, convert_expression, strip_invalid_utf8, strip_locally};
pub use escape::{
    add_placeholder_escape, addslashes, esc_like, escape_identifier_value, placeholder_escape,
    quote_identifier, real_escape_string, remove_placeholder_escape,
};
pub use placeholder::{Placeholder, PrepareOptions, Segment, Template, prepare};
pub use sniff::{StatementKind, check_ascii, get_table_from_query, is_metadata_statement};
