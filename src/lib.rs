//! # filmometre
//!
//! Safe statement building and MySQL access for the Film-o-mètre rating
//! service.
//!
//! Every value that reaches the server is substituted through a
//! printf-style template ([`Database::prepare`]) or the CRUD helpers
//! ([`Database::insert`], [`Database::update`], ...). Before writing, values
//! are checked against the charset and length of their target column; text
//! the column cannot store is refused rather than silently mangled.
//!
//! ## Features
//!
//! - **Placeholder engine**: `%s`, `%d`, `%f`, `%i` (identifiers), numbered
//!   arguments (`%1$s`), padding and precision
//! - **Field pipeline**: format, charset and length resolution from
//!   `SHOW FULL COLUMNS`, cached per table
//! - **Invalid text stripping**: local UTF-8 validation, server-side
//!   `CONVERT` for other charsets
//! - **Reconnect**: lost connections are probed and retried
//! - **Rating API**: handlers for the film and note routes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use filmometre::{Database, DbConfig, FieldFormat, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DbConfig::builder("filmometre")
//!         .user("app")
//!         .password("secret")
//!         .host("localhost:3306")
//!         .build();
//!     let mut db = Database::connect(config).await?;
//!
//!     db.insert(
//!         "ratings",
//!         &[("tconst", "tt0211915".into()), ("rating", 9.0.into())],
//!         &[FieldFormat::Str, FieldFormat::Float],
//!     )
//!     .await?;
//!
//!     let sql = db.prepare(
//!         "SELECT AVG(rating) FROM ratings WHERE tconst = %s",
//!         &[Value::from("tt0211915")],
//!     )?;
//!     let average = db.get_var(&sql, 0, 0).await?;
//!     println!("{:?}", average);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use std::time::Duration;
//! use filmometre::DbConfig;
//!
//! let config = DbConfig::builder("filmometre")
//!     .charset("utf8mb4")                         // Default
//!     .reconnect_retries(5)                       // Default
//!     .reconnect_backoff(Duration::from_secs(1))  // Default
//!     .build();
//! ```
//!
//! `DbConfig::from_env()` reads `DB_HOST`, `DB_NAME`, `DB_USER`, `DB_PASS`
//! and `DB_PORT`.

pub mod api;
pub mod charset;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod sql;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export main types for convenience
pub use api::{ApiResponse, FilmProvider, get_film, get_note, post_note, random_imdb_id};
pub use charset::DbCapability;
pub use config::{DbConfig, DbConfigBuilder, DbHost, parse_db_host};
pub use connection::{Connection, MySqlConnection};
pub use database::Database;
pub use error::{DbError, Result};
pub use types::{
    Cell, Charset, ColumnLength, ColumnMeta, FieldFormat, LengthUnit, QueryOutput, ResolvedField,
    Row, Value,
};

// Re-export SQL utilities for advanced users
pub use sql::{esc_like, prepare, quote_identifier};
