//! Connection seam
//!
//! The [`Database`](crate::Database) talks to the server only through the
//! [`Connection`] trait. [`MySqlConnection`] implements it on a single
//! `sqlx` MySQL connection using the text protocol, so statements are sent
//! exactly as built.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlRow};
use sqlx::{Column, Connection as _, Row as _, TypeInfo};

use crate::config::DbConfig;
use crate::error::{DbError, Result};
use crate::sql::escape::real_escape_string;
use crate::sql::sniff::StatementKind;
use crate::types::{Cell, QueryOutput, Row};

/// A live connection able to run raw SQL statements
#[async_trait]
pub trait Connection: Send {
    /// Execute one statement and return its rows or counters
    async fn execute(&mut self, sql: &str) -> Result<QueryOutput>;

    /// Escape a string value for inclusion between single quotes
    fn escape_string(&self, value: &str) -> String {
        real_escape_string(value)
    }

    /// Charset the connection is using
    fn character_set_name(&self) -> &str;

    /// Liveness probe (`DO 1`)
    async fn ping(&mut self) -> Result<()>;

    /// Re-establish the connection after the server went away
    async fn reconnect(&mut self) -> Result<()>;

    /// Server version string, e.g. `8.0.36` or `10.6.12-MariaDB`
    fn server_version(&self) -> &str;
}

/// [`Connection`] backed by `sqlx::MySqlConnection`
pub struct MySqlConnection {
    conn: sqlx::MySqlConnection,
    options: MySqlConnectOptions,
    charset: String,
    server_version: String,
}

impl MySqlConnection {
    /// Connect using the configured host, credentials and charset
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let host = config.host()?;

        let mut options = MySqlConnectOptions::new()
            .username(&config.db_user)
            .password(&config.db_password)
            .database(&config.db_name)
            .charset(&config.charset);

        options = match &host.socket {
            Some(socket) => options.socket(socket),
            None => options.host(&host.host),
        };
        if let Some(port) = host.port {
            options = options.port(port);
        }

        Self::connect_with(options, config.charset.clone()).await
    }

    /// Connect with explicit `sqlx` options
    pub async fn connect_with(options: MySqlConnectOptions, charset: String) -> Result<Self> {
        let mut conn = sqlx::MySqlConnection::connect_with(&options)
            .await
            .map_err(|e| DbError::connection(format!("Database connection failed: {}", e)))?;

        let server_version = Self::fetch_server_version(&mut conn).await?;
        tracing::info!(server_version = %server_version, "connected to MySQL");

        Ok(Self {
            conn,
            options,
            charset,
            server_version,
        })
    }

    async fn fetch_server_version(conn: &mut sqlx::MySqlConnection) -> Result<String> {
        let rows = sqlx::Executor::fetch_all(&mut *conn, sqlx::raw_sql("SELECT VERSION()")).await?;
        let version = rows
            .first()
            .map(decode_row)
            .transpose()?
            .and_then(|row| row.get_index(0).and_then(Cell::to_text))
            .unwrap_or_default();
        Ok(version)
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn execute(&mut self, sql: &str) -> Result<QueryOutput> {
        match StatementKind::of(sql) {
            StatementKind::Ddl | StatementKind::Write { .. } => {
                let result = sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(sql))
                    .await
                    .map_err(map_sqlx_error)?;
                Ok(QueryOutput {
                    rows: Vec::new(),
                    rows_affected: result.rows_affected(),
                    last_insert_id: result.last_insert_id(),
                })
            }
            StatementKind::Read => {
                let rows = sqlx::Executor::fetch_all(&mut self.conn, sqlx::raw_sql(sql))
                    .await
                    .map_err(map_sqlx_error)?;
                let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
                Ok(QueryOutput::with_rows(rows))
            }
        }
    }

    fn character_set_name(&self) -> &str {
        &self.charset
    }

    async fn ping(&mut self) -> Result<()> {
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql("DO 1"))
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        let conn = sqlx::MySqlConnection::connect_with(&self.options)
            .await
            .map_err(|e| DbError::connection(format!("Reconnect failed: {}", e)))?;
        self.conn = conn;
        self.server_version = Self::fetch_server_version(&mut self.conn).await?;
        tracing::info!("reconnected to MySQL");
        Ok(())
    }

    fn server_version(&self) -> &str {
        &self.server_version
    }
}

/// Server-side failures keep their message; transport failures stay `Sql`
/// so they can be recognized as a lost connection.
fn map_sqlx_error(err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(db_err) => DbError::query(db_err.message().to_string()),
        other => DbError::Sql(other),
    }
}

/// Decode a MySQL row into named cells, by declared column type
pub fn decode_row(row: &MySqlRow) -> Result<Row> {
    let mut out = Row::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let type_name = column.type_info().name().to_uppercase();

        let cell = match type_name.as_str() {
            "NULL" => Cell::Null,
            "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => row
                .try_get_unchecked::<Option<i64>, _>(idx)?
                .map_or(Cell::Null, Cell::Int),
            t if t.ends_with("UNSIGNED") => row
                .try_get_unchecked::<Option<u64>, _>(idx)?
                .map_or(Cell::Null, |v| match i64::try_from(v) {
                    Ok(i) => Cell::Int(i),
                    Err(_) => Cell::Text(v.to_string()),
                }),
            "FLOAT" | "DOUBLE" => row
                .try_get_unchecked::<Option<f64>, _>(idx)?
                .map_or(Cell::Null, Cell::Float),
            "DECIMAL" => row
                .try_get_unchecked::<Option<rust_decimal::Decimal>, _>(idx)?
                .map_or(Cell::Null, Cell::Decimal),
            "DATETIME" | "TIMESTAMP" => row
                .try_get_unchecked::<Option<chrono::NaiveDateTime>, _>(idx)?
                .map_or(Cell::Null, Cell::DateTime),
            "DATE" => row
                .try_get_unchecked::<Option<chrono::NaiveDate>, _>(idx)?
                .map_or(Cell::Null, Cell::Date),
            "JSON" => row
                .try_get_unchecked::<Option<serde_json::Value>, _>(idx)?
                .map_or(Cell::Null, |v| Cell::Text(v.to_string())),
            "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
            | "GEOMETRY" => row
                .try_get_unchecked::<Option<Vec<u8>>, _>(idx)?
                .map_or(Cell::Null, Cell::Bytes),
            _ => match row.try_get_unchecked::<Option<String>, _>(idx) {
                Ok(v) => v.map_or(Cell::Null, Cell::Text),
                Err(_) => row
                    .try_get_unchecked::<Option<Vec<u8>>, _>(idx)?
                    .map_or(Cell::Null, |b| match String::from_utf8(b) {
                        Ok(s) => Cell::Text(s),
                        Err(e) => Cell::Bytes(e.into_bytes()),
                    }),
            },
        };

        out.push(column.name(), cell);
    }

    Ok(out)
}
