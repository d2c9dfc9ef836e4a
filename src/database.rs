//! Database - Main entry point for building and running statements
//!
//! A [`Database`] owns one [`Connection`], the per-table metadata caches and
//! the bookkeeping of the last statement. Every value that reaches the
//! server goes through [`Database::prepare`] or the CRUD helpers, which run
//! the field pipeline (format, charset, length, invalid-text stripping)
//! before building the statement.

use std::collections::HashMap;

use crate::charset::{
    self, CharsetCollate, DbCapability, classify_table_charset, column_length, is_safe_collation,
};
use crate::config::DbConfig;
use crate::connection::{Connection, MySqlConnection};
use crate::error::{DbError, Result};
use crate::sql::encoding::{Stripped, convert_expression, strip_locally};
use crate::sql::escape::{
    addslashes, escape_identifier_value, quote_identifier, remove_placeholder_escape,
};
use crate::sql::placeholder::{PrepareOptions, prepare};
use crate::sql::sniff::{StatementKind, check_ascii, get_table_from_query, is_metadata_statement};
use crate::types::{
    Cell, Charset, ColumnLength, ColumnMeta, FieldFormat, QueryOutput, ResolvedField, Row, Value,
};

/// Database session over a single connection
///
/// Methods that may touch the connection or the caches take `&mut self`;
/// share a session between tasks behind a `tokio::sync::Mutex`.
pub struct Database<C: Connection> {
    config: DbConfig,
    conn: Option<C>,
    /// Effective connection charset and collation
    charset: String,
    collate: String,
    /// lower(table) -> lower(column) -> metadata
    col_meta: HashMap<String, HashMap<String, ColumnMeta>>,
    /// lower(table) -> charset, `None` when the table has no constraint
    table_charset: HashMap<String, Option<Charset>>,
    last_query: Option<String>,
    last_error: Option<String>,
    last_result: Vec<Row>,
    insert_id: u64,
    rows_affected: u64,
    num_queries: u64,
}

impl Database<MySqlConnection> {
    /// Connect to MySQL with the given configuration
    pub async fn connect(config: DbConfig) -> Result<Self> {
        let conn = MySqlConnection::connect(&config).await?;
        Self::new(config, conn).await
    }
}

impl<C: Connection> Database<C> {
    /// Create a session over an established connection
    ///
    /// Resolves the effective charset/collation for the server and applies
    /// it with `SET NAMES`.
    pub async fn new(config: DbConfig, conn: C) -> Result<Self> {
        let mut db = Self::with_connection(config, Some(conn));
        db.init_charset();
        db.set_charset(None, None).await?;
        Ok(db)
    }

    /// Create a session without a connection
    ///
    /// Only statement building works. String escaping falls back to
    /// `addslashes`, which ignores the connection charset; every use is
    /// logged.
    pub fn disconnected(config: DbConfig) -> Self {
        Self::with_connection(config, None)
    }

    fn with_connection(config: DbConfig, conn: Option<C>) -> Self {
        Self {
            charset: config.charset.clone(),
            collate: config.collate.clone(),
            config,
            conn,
            col_meta: HashMap::new(),
            table_charset: HashMap::new(),
            last_query: None,
            last_error: None,
            last_result: Vec::new(),
            insert_id: 0,
            rows_affected: 0,
            num_queries: 0,
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn connection(&self) -> Option<&C> {
        self.conn.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut C> {
        self.conn.as_mut()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn collate(&self) -> &str {
        &self.collate
    }

    /// Last statement sent (or refused), with `%` restored
    pub fn last_query(&self) -> Option<&str> {
        self.last_query.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Rows of the last read statement
    pub fn last_result(&self) -> &[Row] {
        &self.last_result
    }

    /// Auto-increment id of the last INSERT/REPLACE
    pub fn insert_id(&self) -> u64 {
        self.insert_id
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn num_rows(&self) -> usize {
        self.last_result.len()
    }

    /// Statements sent to the server by this session
    pub fn num_queries(&self) -> u64 {
        self.num_queries
    }

    // =========================================================================
    // Charset and capabilities
    // =========================================================================

    fn init_charset(&mut self) {
        if let Some(conn) = &self.conn {
            let CharsetCollate { charset, collate } =
                charset::determine_charset(&self.config.charset, &self.config.collate, conn.server_version());
            self.charset = charset;
            self.collate = collate;
        }
    }

    /// Numeric server version, `None` without a connection
    pub fn db_version(&self) -> Option<Vec<u64>> {
        self.conn
            .as_ref()
            .map(|c| charset::server_version(c.server_version()))
    }

    /// Whether the connected server supports a feature
    pub fn has_cap(&self, cap: DbCapability) -> bool {
        let info = self.conn.as_ref().map(|c| c.server_version()).unwrap_or("");
        charset::has_cap(info, cap)
    }

    /// Apply a connection charset and collation (`SET NAMES ... COLLATE ...`)
    ///
    /// `None` uses the session defaults.
    pub async fn set_charset(&mut self, charset: Option<&str>, collate: Option<&str>) -> Result<()> {
        let charset = charset.unwrap_or(&self.charset).to_string();
        let collate = collate.unwrap_or(&self.collate).to_string();

        if charset.is_empty() || !self.has_cap(DbCapability::Collation) {
            return Ok(());
        }

        let mut sql = self.prepare("SET NAMES %s", &[Value::from(charset.as_str())])?;
        if !collate.is_empty() {
            sql.push_str(&self.prepare(" COLLATE %s", &[Value::from(collate.as_str())])?);
        }
        self.do_query(&remove_placeholder_escape(&sql)).await?;
        Ok(())
    }

    fn connection_charset(&self) -> String {
        if !self.charset.is_empty() {
            return self.charset.clone();
        }
        self.conn
            .as_ref()
            .map(|c| c.character_set_name().to_string())
            .unwrap_or_default()
    }

    // =========================================================================
    // Statement building
    // =========================================================================

    fn escape(&self, value: &str) -> String {
        match &self.conn {
            Some(conn) => conn.escape_string(value),
            None => {
                tracing::warn!("no database connection, escaping with addslashes");
                addslashes(value)
            }
        }
    }

    /// Build a safe statement from a template and individual arguments
    ///
    /// See [`sql::placeholder`](crate::sql::placeholder) for the grammar.
    /// The result still carries the placeholder-escape sentinel in place of
    /// `%`; [`query`](Self::query) restores it before execution.
    pub fn prepare(&self, query: &str, args: &[Value]) -> Result<String> {
        self.prepare_with(query, args, false)
    }

    /// Same as [`prepare`](Self::prepare), for arguments supplied as one array
    ///
    /// An array of several values for a single-placeholder template is
    /// rejected.
    pub fn prepare_array(&self, query: &str, args: &[Value]) -> Result<String> {
        self.prepare_with(query, args, true)
    }

    fn prepare_with(&self, query: &str, args: &[Value], passed_as_array: bool) -> Result<String> {
        let options = PrepareOptions {
            passed_as_array,
            allow_unsafe_unquoted_parameters: self.config.allow_unsafe_unquoted_parameters,
        };
        prepare(query, args, options, &|value: &str| self.escape(value)).inspect_err(|e| {
            tracing::warn!(error = %e, query = %query, "prepare rejected the statement");
        })
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn flush(&mut self) {
        self.last_result.clear();
        self.last_error = None;
        self.rows_affected = 0;
    }

    async fn do_query(&mut self, sql: &str) -> Result<QueryOutput> {
        self.num_queries += 1;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DbError::connection("No database connection"))?;
        tracing::debug!(target: "filmometre::sql", sql = %sql, "executing statement");
        conn.execute(sql).await
    }

    /// Execute, reconnecting once when the server went away
    async fn do_query_reconnecting(&mut self, sql: &str) -> Result<QueryOutput> {
        match self.do_query(sql).await {
            Err(e) if e.is_connection_lost() => {
                tracing::warn!(error = %e, "database connection lost");
                self.check_connection().await?;
                self.do_query(sql).await
            }
            other => other,
        }
    }

    /// Run a raw statement
    ///
    /// Non-ASCII statements are checked against the charset of the table
    /// they touch and refused when they contain text the table cannot
    /// store.
    pub async fn query(&mut self, sql: &str) -> Result<QueryOutput> {
        self.run_query(sql, true).await
    }

    async fn run_query(&mut self, sql: &str, check_current_query: bool) -> Result<QueryOutput> {
        if sql.trim().is_empty() {
            self.insert_id = 0;
            return Err(DbError::query("Empty query"));
        }

        let sql = remove_placeholder_escape(sql);
        self.flush();

        if check_current_query && !check_ascii(&sql) {
            let stripped = self.strip_invalid_text_from_query(&sql).await?;
            self.flush();
            if stripped != sql {
                self.insert_id = 0;
                self.last_query = Some(sql);
                let message = "Could not perform query because it contains invalid data.";
                self.last_error = Some(message.to_string());
                tracing::warn!("{}", message);
                return Err(DbError::query(message));
            }
        }

        self.last_query = Some(sql.clone());

        let result = self.do_query_reconnecting(&sql).await;

        let kind = StatementKind::of(&sql);
        match result {
            Ok(output) => {
                match kind {
                    StatementKind::Ddl => {}
                    StatementKind::Write { inserts } => {
                        self.rows_affected = output.rows_affected;
                        if inserts {
                            self.insert_id = output.last_insert_id;
                        }
                    }
                    StatementKind::Read => {
                        self.last_result = output.rows.clone();
                    }
                }
                Ok(output)
            }
            Err(e) => {
                if matches!(e, DbError::Connection(_))
                    || matches!(kind, StatementKind::Write { inserts: true })
                {
                    self.insert_id = 0;
                }
                self.last_error = Some(e.to_string());
                tracing::error!(error = %e, sql = %sql, "statement failed");
                Err(e)
            }
        }
    }

    /// Make sure the server is reachable, reconnecting if needed
    ///
    /// Probes with `DO 1`, then tries `reconnect_retries` reconnects with
    /// `reconnect_backoff` between attempts. The session charset is applied
    /// again after a successful reconnect.
    pub async fn check_connection(&mut self) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DbError::connection("No database connection"))?;

        if conn.ping().await.is_ok() {
            return Ok(());
        }

        let retries = self.config.reconnect_retries;
        for attempt in 1..=retries {
            let conn = self
                .conn
                .as_mut()
                .ok_or_else(|| DbError::connection("No database connection"))?;
            match conn.reconnect().await {
                Ok(()) => {
                    tracing::info!(attempt, "reconnected to the database");
                    self.set_charset(None, None).await?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, retries, error = %e, "reconnect attempt failed");
                    if attempt < retries {
                        tokio::time::sleep(self.config.reconnect_backoff).await;
                    }
                }
            }
        }

        let message = format!(
            "Lost contact with the database server at {} after {} reconnect attempts",
            self.config.db_host, retries
        );
        self.last_error = Some(message.clone());
        tracing::error!("{}", message);
        Err(DbError::connection(message))
    }

    // =========================================================================
    // Result helpers
    // =========================================================================

    async fn query_checked(&mut self, sql: &str) -> Result<QueryOutput> {
        let check = !self.check_safe_collation(sql).await;
        self.run_query(sql, check).await
    }

    /// All rows of a read statement
    pub async fn get_results(&mut self, sql: &str) -> Result<Vec<Row>> {
        Ok(self.query_checked(sql).await?.rows)
    }

    /// Row `y` of a read statement
    pub async fn get_row(&mut self, sql: &str, y: usize) -> Result<Option<Row>> {
        Ok(self.query_checked(sql).await?.rows.into_iter().nth(y))
    }

    /// Cell `(x, y)` of a read statement; NULL and empty strings are `None`
    pub async fn get_var(&mut self, sql: &str, x: usize, y: usize) -> Result<Option<Cell>> {
        let rows = self.query_checked(sql).await?.rows;
        Ok(rows.get(y).and_then(|row| non_empty(row.get_index(x))))
    }

    /// Column `x` of every row of a read statement
    pub async fn get_col(&mut self, sql: &str, x: usize) -> Result<Vec<Option<Cell>>> {
        let rows = self.query_checked(sql).await?.rows;
        Ok(rows.iter().map(|row| non_empty(row.get_index(x))).collect())
    }

    // =========================================================================
    // CRUD helpers
    // =========================================================================

    /// Insert a row; returns the number of rows affected
    ///
    /// `formats` are consumed in order; when the list runs out the last
    /// one repeats. With no formats, configured `field_types` apply, else
    /// `%s`. `Value::Null` is written as `NULL`.
    ///
    /// # Example
    /// ```rust,no_run
    /// use filmometre::{Database, DbConfig, FieldFormat};
    ///
    /// # async fn run() -> filmometre::Result<()> {
    /// let mut db = Database::connect(DbConfig::from_env()?).await?;
    /// db.insert(
    ///     "ratings",
    ///     &[("tconst", "tt0133093".into()), ("rating", 8.5.into())],
    ///     &[FieldFormat::Str, FieldFormat::Float],
    /// )
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn insert(
        &mut self,
        table: &str,
        data: &[(&str, Value)],
        formats: &[FieldFormat],
    ) -> Result<u64> {
        self.insert_replace_helper(table, data, formats, "INSERT").await
    }

    /// Insert or replace a row by primary/unique key
    pub async fn replace(
        &mut self,
        table: &str,
        data: &[(&str, Value)],
        formats: &[FieldFormat],
    ) -> Result<u64> {
        self.insert_replace_helper(table, data, formats, "REPLACE").await
    }

    async fn insert_replace_helper(
        &mut self,
        table: &str,
        data: &[(&str, Value)],
        formats: &[FieldFormat],
        verb: &str,
    ) -> Result<u64> {
        self.insert_id = 0;
        if data.is_empty() {
            return Err(DbError::validation(format!("{} requires at least one column", verb)));
        }

        let fields = self.process_fields(table, data, formats).await?;

        let mut columns = Vec::with_capacity(fields.len());
        let mut placeholders = Vec::with_capacity(fields.len());
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            columns.push(template_identifier(&field.field));
            if field.value.is_null() {
                placeholders.push("NULL");
            } else {
                placeholders.push(field.format.placeholder());
                values.push(field.value);
            }
        }

        let sql = format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            template_identifier(table),
            columns.join(", "),
            placeholders.join(", ")
        );

        let statement = self.finish_statement(&sql, &values)?;
        Ok(self.run_query(&statement, false).await?.rows_affected)
    }

    /// Update rows matching every `where_` pair; returns rows affected
    ///
    /// A `Value::Null` in `data` sets the column to NULL; in `where_` it
    /// becomes `IS NULL`.
    pub async fn update(
        &mut self,
        table: &str,
        data: &[(&str, Value)],
        where_: &[(&str, Value)],
        formats: &[FieldFormat],
        where_formats: &[FieldFormat],
    ) -> Result<u64> {
        if data.is_empty() || where_.is_empty() {
            return Err(DbError::validation(
                "UPDATE requires at least one column and one condition",
            ));
        }

        let fields = self.process_fields(table, data, formats).await?;
        let conditions = self.process_conditions(table, where_, where_formats).await?;

        let mut values = Vec::new();
        let mut set = Vec::with_capacity(fields.len());
        for field in fields {
            let column = template_identifier(&field.field);
            if field.value.is_null() {
                set.push(format!("{} = NULL", column));
            } else {
                set.push(format!("{} = {}", column, field.format.placeholder()));
                values.push(field.value);
            }
        }
        let clauses = where_clauses(conditions, &mut values);

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            template_identifier(table),
            set.join(", "),
            clauses.join(" AND ")
        );

        let statement = self.finish_statement(&sql, &values)?;
        Ok(self.run_query(&statement, false).await?.rows_affected)
    }

    /// Delete rows matching every `where_` pair; returns rows affected
    pub async fn delete(
        &mut self,
        table: &str,
        where_: &[(&str, Value)],
        where_formats: &[FieldFormat],
    ) -> Result<u64> {
        if where_.is_empty() {
            return Err(DbError::validation("DELETE requires at least one condition"));
        }

        let conditions = self.process_conditions(table, where_, where_formats).await?;
        let mut values = Vec::new();
        let clauses = where_clauses(conditions, &mut values);

        let sql = format!(
            "DELETE FROM {} WHERE {}",
            template_identifier(table),
            clauses.join(" AND ")
        );

        let statement = self.finish_statement(&sql, &values)?;
        Ok(self.run_query(&statement, false).await?.rows_affected)
    }

    /// Substitute values into a CRUD template; a template without values
    /// (all NULL) only needs its doubled `%` collapsed.
    fn finish_statement(&self, sql: &str, values: &[Value]) -> Result<String> {
        if values.is_empty() {
            Ok(sql.replace("%%", "%"))
        } else {
            self.prepare_array(sql, values)
        }
    }

    // =========================================================================
    // Field pipeline
    // =========================================================================

    /// Resolve format, charset and length of every column and strip
    /// invalid text
    ///
    /// Fails with [`DbError::InvalidFieldData`] naming every column whose
    /// value contained text its charset cannot store. Truncation to the
    /// column length alone is not an error.
    pub async fn process_fields(
        &mut self,
        table: &str,
        data: &[(&str, Value)],
        formats: &[FieldFormat],
    ) -> Result<Vec<ResolvedField>> {
        let mut fields = self.process_field_formats(data, formats);
        self.process_field_charsets(&mut fields, table).await?;
        self.process_field_lengths(&mut fields, table).await?;
        self.strip_invalid_text(&mut fields, true).await?;
        self.reject_invalid_fields(table, fields)
    }

    /// Field pipeline for WHERE conditions
    ///
    /// A condition is never sent truncated: any value that would be
    /// shortened or stripped is rejected as invalid data.
    async fn process_conditions(
        &mut self,
        table: &str,
        where_: &[(&str, Value)],
        formats: &[FieldFormat],
    ) -> Result<Vec<ResolvedField>> {
        let mut fields = self.process_field_formats(where_, formats);
        self.process_field_charsets(&mut fields, table).await?;
        self.process_field_lengths(&mut fields, table).await?;
        self.strip_invalid_text(&mut fields, true).await?;

        for (field, (_, original)) in fields.iter_mut().zip(where_) {
            if field.value.as_text() != original.as_text() {
                field.invalid = true;
            }
        }
        self.reject_invalid_fields(table, fields)
    }

    fn reject_invalid_fields(
        &mut self,
        table: &str,
        fields: Vec<ResolvedField>,
    ) -> Result<Vec<ResolvedField>> {
        let problems: Vec<String> = fields
            .iter()
            .filter(|f| f.invalid)
            .map(|f| f.field.clone())
            .collect();

        if problems.is_empty() {
            return Ok(fields);
        }

        let message = if problems.len() == 1 {
            format!(
                "Processing the value for the following field failed: {}. The supplied value contains invalid data.",
                problems[0]
            )
        } else {
            format!(
                "Processing the values for the following fields failed: {}. The supplied values contain invalid data.",
                problems.join(", ")
            )
        };
        tracing::warn!(table, fields = ?problems, "rejected invalid field data");
        self.last_error = Some(message);
        Err(DbError::InvalidFieldData { fields: problems })
    }

    /// Pair every value with its format
    pub fn process_field_formats(
        &self,
        data: &[(&str, Value)],
        formats: &[FieldFormat],
    ) -> Vec<ResolvedField> {
        data.iter()
            .enumerate()
            .map(|(i, (field, value))| {
                let format = if formats.is_empty() {
                    self.config.field_type(field).unwrap_or(FieldFormat::Str)
                } else {
                    formats
                        .get(i)
                        .or(formats.last())
                        .copied()
                        .unwrap_or(FieldFormat::Str)
                };
                ResolvedField::new(*field, value.clone(), format)
            })
            .collect()
    }

    async fn process_field_charsets(
        &mut self,
        fields: &mut [ResolvedField],
        table: &str,
    ) -> Result<()> {
        for field in fields.iter_mut() {
            field.charset = if field.format.is_numeric() {
                None
            } else {
                self.get_col_charset(table, &field.field).await?
            };
        }
        Ok(())
    }

    async fn process_field_lengths(
        &mut self,
        fields: &mut [ResolvedField],
        table: &str,
    ) -> Result<()> {
        for field in fields.iter_mut() {
            field.length = if field.format.is_numeric() {
                None
            } else {
                self.get_col_length(table, &field.field).await?
            };
        }
        Ok(())
    }

    /// Validate and truncate text values in place
    ///
    /// Values for charsets that cannot be checked locally are converted by
    /// the server in one batched `SELECT CONVERT(...)`.
    async fn strip_invalid_text(
        &mut self,
        fields: &mut [ResolvedField],
        check_ascii: bool,
    ) -> Result<()> {
        let connection_charset = self.connection_charset();
        let mut pending: Vec<(usize, String)> = Vec::new();

        for (idx, field) in fields.iter_mut().enumerate() {
            let Some(charset) = field.charset.clone() else {
                continue;
            };
            let Value::Text(text) = &field.value else {
                continue;
            };

            match strip_locally(text, &charset, field.length, check_ascii) {
                Stripped::Done { value, invalid } => {
                    field.value = Value::Text(value);
                    field.invalid |= invalid;
                }
                Stripped::NeedsServer => {
                    if let Some(expr) =
                        convert_expression(&charset, field.length, &connection_charset)
                    {
                        let expr = self.prepare(&expr, std::slice::from_ref(&field.value))?;
                        pending.push((idx, expr));
                    }
                }
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        let select = pending
            .iter()
            .map(|(idx, expr)| {
                format!("{} AS `{}`", expr, escape_identifier_value(&alias(&fields[*idx])))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = remove_placeholder_escape(&format!("SELECT {}", select));

        let row = self
            .do_query_reconnecting(&sql)
            .await
            .map_err(|e| DbError::query(format!("Could not strip invalid text: {}", e)))?
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| DbError::query("Could not strip invalid text."))?;

        for (idx, _) in pending {
            let field = &mut fields[idx];
            let original = field.value.to_text();
            match row.get(&alias(field)).and_then(Cell::to_text) {
                Some(converted) => {
                    field.invalid |= !original.starts_with(&converted);
                    field.value = Value::Text(converted);
                }
                None => field.invalid = true,
            }
        }

        Ok(())
    }

    /// Validate a whole raw statement against the charset of its table
    async fn strip_invalid_text_from_query(&mut self, sql: &str) -> Result<String> {
        if is_metadata_statement(sql) {
            return Ok(sql.to_string());
        }

        let charset = match get_table_from_query(sql) {
            Some(table) => match self.get_table_charset(&table).await? {
                // Tables with binary columns cannot be stripped reliably.
                Some(Charset::Binary) => return Ok(sql.to_string()),
                other => other,
            },
            None => Some(self.connection_charset())
                .filter(|c| !c.is_empty())
                .map(Charset::named),
        };

        let mut fields = [ResolvedField {
            charset,
            ..ResolvedField::new("query", Value::Text(sql.to_string()), FieldFormat::Str)
        }];
        self.strip_invalid_text(&mut fields, false).await?;
        Ok(fields[0].value.to_text())
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Charset of a table, from `SHOW FULL COLUMNS` (cached)
    ///
    /// `None` means the table has no charset constraint.
    pub async fn get_table_charset(&mut self, table: &str) -> Result<Option<Charset>> {
        let key = table.to_lowercase();
        if let Some(charset) = self.table_charset.get(&key) {
            return Ok(charset.clone());
        }

        let sql = format!("SHOW FULL COLUMNS FROM {}", quote_identifier(table));
        let output = self.do_query_reconnecting(&sql).await.map_err(|e| {
            DbError::metadata(format!("Could not retrieve table charset for '{}': {}", table, e))
        })?;
        if output.rows.is_empty() {
            return Err(DbError::metadata(format!(
                "Could not retrieve table charset for '{}'",
                table
            )));
        }

        let columns: HashMap<String, ColumnMeta> = output
            .rows
            .iter()
            .filter_map(column_meta_from_row)
            .map(|col| (col.field.to_lowercase(), col))
            .collect();

        let charset = classify_table_charset(columns.values());
        tracing::debug!(table, charset = ?charset, "resolved table charset");

        self.col_meta.insert(key.clone(), columns);
        self.table_charset.insert(key, charset.clone());
        Ok(charset)
    }

    async fn ensure_table_meta(&mut self, table: &str) -> Result<()> {
        if !self.table_charset.contains_key(&table.to_lowercase()) {
            self.get_table_charset(table).await?;
        }
        Ok(())
    }

    /// Charset of a column
    ///
    /// The table charset is used for unknown columns; non-string columns
    /// have none.
    pub async fn get_col_charset(&mut self, table: &str, column: &str) -> Result<Option<Charset>> {
        if self.conn.is_none() {
            return Ok(None);
        }
        self.ensure_table_meta(table).await?;

        let key = table.to_lowercase();
        let table_charset = self.table_charset.get(&key).cloned().flatten();

        match self
            .col_meta
            .get(&key)
            .and_then(|cols| cols.get(&column.to_lowercase()))
        {
            None => Ok(table_charset),
            Some(meta) => Ok(meta.charset().map(Charset::named)),
        }
    }

    /// Maximum length of a column, `None` for unknown and non-string columns
    pub async fn get_col_length(
        &mut self,
        table: &str,
        column: &str,
    ) -> Result<Option<ColumnLength>> {
        if self.conn.is_none() {
            return Ok(None);
        }
        self.ensure_table_meta(table).await?;

        Ok(self
            .col_meta
            .get(&table.to_lowercase())
            .and_then(|cols| cols.get(&column.to_lowercase()))
            .and_then(column_length))
    }

    /// Whether a raw read can skip invalid-text checking
    ///
    /// Metadata statements and pure-ASCII statements are safe. Otherwise
    /// every collated column of the table must use a known-safe collation.
    pub async fn check_safe_collation(&mut self, sql: &str) -> bool {
        if is_metadata_statement(sql) || check_ascii(sql) {
            return true;
        }

        let Some(table) = get_table_from_query(sql) else {
            return false;
        };

        match self.get_table_charset(&table).await {
            Ok(None) => return true,
            Ok(Some(c)) if c.is_latin1() => return true,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, table = %table, "collation check could not describe the table");
                return false;
            }
        }

        match self.col_meta.get(&table.to_lowercase()) {
            Some(cols) if !cols.is_empty() => cols
                .values()
                .filter_map(|c| c.collation.as_deref().filter(|s| !s.is_empty()))
                .all(is_safe_collation),
            _ => false,
        }
    }
}

/// Backtick-quoted identifier for a CRUD template; `%` is doubled so it
/// stays literal through `prepare`.
fn template_identifier(name: &str) -> String {
    format!("`{}`", escape_identifier_value(name).replace('%', "%%"))
}

fn where_clauses(conditions: Vec<ResolvedField>, values: &mut Vec<Value>) -> Vec<String> {
    conditions
        .into_iter()
        .map(|field| {
            let column = template_identifier(&field.field);
            if field.value.is_null() {
                format!("{} IS NULL", column)
            } else {
                values.push(field.value);
                format!("{} = {}", column, field.format.placeholder())
            }
        })
        .collect()
}

fn alias(field: &ResolvedField) -> String {
    format!("x_{}", field.field)
}

fn non_empty(cell: Option<&Cell>) -> Option<Cell> {
    match cell {
        None | Some(Cell::Null) => None,
        Some(Cell::Text(s)) if s.is_empty() => None,
        Some(cell) => Some(cell.clone()),
    }
}

fn column_meta_from_row(row: &Row) -> Option<ColumnMeta> {
    let field = row.get_str("Field")?;
    let column_type = row.get("Type").and_then(Cell::to_text)?;
    let collation = row.get("Collation").and_then(Cell::to_text);
    Some(ColumnMeta::new(field, column_type, collation.as_deref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryConnection;
    use crate::types::LengthUnit;

    fn ratings_table() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta::new("id", "int(11) unsigned", None),
            ColumnMeta::new("tconst", "varchar(10)", Some("utf8mb4_unicode_ci")),
            ColumnMeta::new("rating", "decimal(3,1)", None),
        ]
    }

    async fn db_with(conn: MemoryConnection) -> Database<MemoryConnection> {
        let config = DbConfig::builder("filmometre")
            .reconnect_backoff(std::time::Duration::from_millis(1))
            .build();
        Database::new(config, conn).await.unwrap()
    }

    // =========================================================================
    // Session setup Tests
    // =========================================================================

    #[tokio::test]
    async fn test_new_sets_names() {
        let db = db_with(MemoryConnection::new()).await;
        assert_eq!(db.charset(), "utf8mb4");
        assert_eq!(db.collate(), "utf8mb4_unicode_520_ci");
        let executed = db.connection().unwrap().executed();
        assert_eq!(
            executed,
            vec!["SET NAMES 'utf8mb4' COLLATE 'utf8mb4_unicode_520_ci'".to_string()]
        );
    }

    #[tokio::test]
    async fn test_disconnected_prepare_uses_fallback() {
        let db: Database<MemoryConnection> =
            Database::disconnected(DbConfig::builder("filmometre").build());
        let sql = db.prepare("SELECT %s", &["it's".into()]).unwrap();
        assert_eq!(remove_placeholder_escape(&sql), "SELECT 'it\\'s'");
        assert!(!db.is_connected());
    }

    #[tokio::test]
    async fn test_disconnected_query_fails() {
        let mut db: Database<MemoryConnection> =
            Database::disconnected(DbConfig::builder("filmometre").build());
        let err = db.query("SELECT 1").await.unwrap_err();
        assert!(matches!(err, DbError::Connection(_)));
    }

    #[tokio::test]
    async fn test_has_cap_follows_server_version() {
        let db = db_with(MemoryConnection::new().with_server_version("5.5.62")).await;
        assert!(!db.has_cap(DbCapability::Utf8mb4_520));
        assert!(db.has_cap(DbCapability::SetCharset));
        assert_eq!(db.collate(), "utf8mb4_unicode_ci");
        assert_eq!(db.db_version(), Some(vec![5, 5, 62]));
    }

    // =========================================================================
    // Metadata Tests
    // =========================================================================

    #[tokio::test]
    async fn test_table_charset_is_cached() {
        let mut db = db_with(MemoryConnection::new().with_table("ratings", ratings_table())).await;

        assert_eq!(
            db.get_table_charset("Ratings").await.unwrap(),
            Some(Charset::named("utf8mb4"))
        );
        assert_eq!(
            db.get_table_charset("ratings").await.unwrap(),
            Some(Charset::named("utf8mb4"))
        );

        let describes = db
            .connection()
            .unwrap()
            .executed()
            .iter()
            .filter(|s| s.starts_with("SHOW FULL COLUMNS"))
            .count();
        assert_eq!(describes, 1);
    }

    #[tokio::test]
    async fn test_unknown_table_is_a_metadata_error() {
        let mut db = db_with(MemoryConnection::new()).await;
        let err = db.get_table_charset("missing").await.unwrap_err();
        assert!(matches!(err, DbError::Metadata(_)));
    }

    #[tokio::test]
    async fn test_col_charset_and_length() {
        let mut db = db_with(MemoryConnection::new().with_table("ratings", ratings_table())).await;

        assert_eq!(
            db.get_col_charset("ratings", "TCONST").await.unwrap(),
            Some(Charset::named("utf8mb4"))
        );
        assert_eq!(db.get_col_charset("ratings", "rating").await.unwrap(), None);
        // unknown column falls back to the table charset
        assert_eq!(
            db.get_col_charset("ratings", "nope").await.unwrap(),
            Some(Charset::named("utf8mb4"))
        );

        let len = db.get_col_length("ratings", "tconst").await.unwrap().unwrap();
        assert_eq!(len.unit, LengthUnit::Char);
        assert_eq!(len.length, 10);
        assert_eq!(db.get_col_length("ratings", "rating").await.unwrap(), None);
        assert_eq!(db.get_col_length("ratings", "nope").await.unwrap(), None);
    }

    // =========================================================================
    // Field pipeline Tests
    // =========================================================================

    #[tokio::test]
    async fn test_formats_repeat_last_seen() {
        let db = db_with(MemoryConnection::new()).await;
        let data = [("a", Value::from(1)), ("b", Value::from(2)), ("c", Value::from(3))];
        let fields = db.process_field_formats(&data, &[FieldFormat::Str, FieldFormat::Int]);
        let formats: Vec<FieldFormat> = fields.iter().map(|f| f.format).collect();
        assert_eq!(formats, vec![FieldFormat::Str, FieldFormat::Int, FieldFormat::Int]);
    }

    #[tokio::test]
    async fn test_formats_from_field_types() {
        let config = DbConfig::builder("filmometre")
            .field_type("rating", FieldFormat::Float)
            .build();
        let db = Database::new(config, MemoryConnection::new()).await.unwrap();
        let data = [("tconst", Value::from("tt1")), ("rating", Value::from(7.5))];
        let fields = db.process_field_formats(&data, &[]);
        assert_eq!(fields[0].format, FieldFormat::Str);
        assert_eq!(fields[1].format, FieldFormat::Float);
    }

    #[tokio::test]
    async fn test_process_fields_truncates_by_characters() {
        let mut db = db_with(MemoryConnection::new().with_table("ratings", ratings_table())).await;
        let data = [("tconst", Value::from("ééééééééééééééé"))];
        let fields = db
            .process_fields("ratings", &data, &[FieldFormat::Str])
            .await
            .unwrap();
        assert_eq!(fields[0].value, Value::from("éééééééééé"));
        assert!(!fields[0].invalid);
    }

    #[tokio::test]
    async fn test_process_fields_rejects_invalid_text() {
        let table = vec![ColumnMeta::new("title", "varchar(50)", Some("utf8_general_ci"))];
        let mut db = db_with(MemoryConnection::new().with_table("films", table)).await;
        let data = [("title", Value::from("Matrix 🎬"))];
        let err = db
            .process_fields("films", &data, &[])
            .await
            .unwrap_err();
        match err {
            DbError::InvalidFieldData { fields } => assert_eq!(fields, vec!["title".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(db.last_error().unwrap().contains("title"));
    }

    #[tokio::test]
    async fn test_process_fields_server_conversion() {
        let table = vec![ColumnMeta::new("title", "varchar(4)", Some("sjis_japanese_ci"))];
        let conn = MemoryConnection::new()
            .with_table("films", table)
            .with_handler(|sql| {
                assert!(sql.contains("CONVERT( LEFT( CONVERT( 'Amélie' USING sjis ), 4 ) USING utf8mb4 )"));
                Ok(QueryOutput::with_rows(vec![Row::new().with("x_title", "Amél")]))
            });
        let mut db = db_with(conn).await;
        let data = [("title", Value::from("Amélie"))];
        let fields = db.process_fields("films", &data, &[]).await.unwrap();
        assert_eq!(fields[0].value, Value::from("Amél"));
    }

    #[tokio::test]
    async fn test_numeric_fields_skip_metadata() {
        let mut db = db_with(MemoryConnection::new()).await;
        let data = [("rating", Value::from(7.5))];
        let fields = db
            .process_fields("unknown_table", &data, &[FieldFormat::Float])
            .await
            .unwrap();
        assert_eq!(fields[0].charset, None);
        assert_eq!(fields[0].length, None);
    }

    // =========================================================================
    // CRUD Tests
    // =========================================================================

    #[tokio::test]
    async fn test_insert_builds_statement() {
        let mut db = db_with(MemoryConnection::new().with_table("ratings", ratings_table())).await;
        let affected = db
            .insert(
                "ratings",
                &[("tconst", "tt0133093".into()), ("rating", 8.5.into())],
                &[FieldFormat::Str, FieldFormat::Float],
            )
            .await
            .unwrap();

        assert_eq!(affected, 1);
        assert_eq!(
            db.last_query(),
            Some("INSERT INTO `ratings` (`tconst`, `rating`) VALUES ('tt0133093', 8.500000)")
        );
        assert_eq!(db.insert_id(), 1);
    }

    #[tokio::test]
    async fn test_insert_null_value() {
        let mut db = db_with(MemoryConnection::new().with_table("ratings", ratings_table())).await;
        db.replace(
            "ratings",
            &[("tconst", "tt1".into()), ("rating", Value::Null)],
            &[FieldFormat::Str, FieldFormat::Float],
        )
        .await
        .unwrap();
        assert_eq!(
            db.last_query(),
            Some("REPLACE INTO `ratings` (`tconst`, `rating`) VALUES ('tt1', NULL)")
        );
    }

    #[tokio::test]
    async fn test_update_statement() {
        let mut db = db_with(MemoryConnection::new().with_table("ratings", ratings_table())).await;
        db.update(
            "ratings",
            &[("rating", 9.0.into())],
            &[("tconst", "tt1".into()), ("id", Value::Null)],
            &[FieldFormat::Float],
            &[FieldFormat::Str],
        )
        .await
        .unwrap();
        assert_eq!(
            db.last_query(),
            Some("UPDATE `ratings` SET `rating` = 9.000000 WHERE `tconst` = 'tt1' AND `id` IS NULL")
        );
    }

    #[tokio::test]
    async fn test_delete_statement() {
        let mut db = db_with(MemoryConnection::new().with_table("ratings", ratings_table())).await;
        db.delete("ratings", &[("id", 3.into())], &[FieldFormat::Int])
            .await
            .unwrap();
        assert_eq!(db.last_query(), Some("DELETE FROM `ratings` WHERE `id` = 3"));
    }

    #[tokio::test]
    async fn test_delete_refuses_overlong_key() {
        let mut db = db_with(MemoryConnection::new().with_table("ratings", ratings_table())).await;
        let err = db
            .delete("ratings", &[("tconst", "tt01330930000".into())], &[])
            .await
            .unwrap_err();
        match err {
            DbError::InvalidFieldData { fields } => assert_eq!(fields, vec!["tconst".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(
            !db.connection()
                .unwrap()
                .executed()
                .iter()
                .any(|sql| sql.starts_with("DELETE"))
        );
    }

    #[tokio::test]
    async fn test_update_condition_is_not_truncated() {
        let mut db = db_with(MemoryConnection::new().with_table("ratings", ratings_table())).await;

        // data values are still truncated
        db.update(
            "ratings",
            &[("tconst", "tt01330930000".into())],
            &[("tconst", "tt0133093".into())],
            &[],
            &[],
        )
        .await
        .unwrap();
        assert_eq!(
            db.last_query(),
            Some("UPDATE `ratings` SET `tconst` = 'tt01330930' WHERE `tconst` = 'tt0133093'")
        );

        let err = db
            .update(
                "ratings",
                &[("rating", 9.0.into())],
                &[("tconst", "tt01330930000".into())],
                &[FieldFormat::Float],
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidFieldData { .. }));
    }

    #[tokio::test]
    async fn test_delete_requires_condition() {
        let mut db = db_with(MemoryConnection::new()).await;
        assert!(db.delete("ratings", &[], &[]).await.is_err());
    }

    // =========================================================================
    // Query Tests
    // =========================================================================

    #[tokio::test]
    async fn test_query_restores_percent() {
        let mut db = db_with(MemoryConnection::new()).await;
        let sql = db
            .prepare("SELECT * FROM films WHERE title LIKE %s", &["%Matrix%".into()])
            .unwrap();
        db.query(&sql).await.unwrap();
        assert_eq!(
            db.last_query(),
            Some("SELECT * FROM films WHERE title LIKE '%Matrix%'")
        );
    }

    #[tokio::test]
    async fn test_query_refuses_text_the_table_cannot_store() {
        let table = vec![ColumnMeta::new("title", "varchar(50)", Some("utf8_general_ci"))];
        let mut db = db_with(MemoryConnection::new().with_table("films", table)).await;
        let err = db
            .query("INSERT INTO films (title) VALUES ('🎬')")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid data"));
    }

    #[tokio::test]
    async fn test_query_accepts_multibyte_text_in_parens() {
        let table = vec![ColumnMeta::new("title", "varchar(50)", Some("utf8mb4_unicode_ci"))];
        let mut db = db_with(MemoryConnection::new().with_table("films", table)).await;

        for title in ["映画", "Bébé"] {
            let sql = format!("INSERT INTO films (title) VALUES ('{}')", title);
            db.query(&sql).await.unwrap();
            assert_eq!(db.last_query(), Some(sql.as_str()));
        }
        assert!(
            !db.check_safe_collation("SELECT * FROM films WHERE title IN ('映画')")
                .await
        );
    }

    #[tokio::test]
    async fn test_get_var_and_col() {
        let conn = MemoryConnection::new().with_handler(|_| {
            Ok(QueryOutput::with_rows(vec![
                Row::new().with("votes", 2i64).with("note", ""),
                Row::new().with("votes", 5i64).with("note", "ok"),
            ]))
        });
        let mut db = db_with(conn).await;

        let var = db.get_var("SELECT votes, note FROM t", 0, 1).await.unwrap();
        assert_eq!(var, Some(Cell::Int(5)));
        let empty = db.get_var("SELECT votes, note FROM t", 1, 0).await.unwrap();
        assert_eq!(empty, None);

        let col = db.get_col("SELECT votes, note FROM t", 0).await.unwrap();
        assert_eq!(col, vec![Some(Cell::Int(2)), Some(Cell::Int(5))]);
        assert_eq!(db.num_rows(), 2);

        let row = db.get_row("SELECT votes, note FROM t", 5).await.unwrap();
        assert!(row.is_none());
    }

    // =========================================================================
    // Collation gate Tests
    // =========================================================================

    #[tokio::test]
    async fn test_safe_collation_shortcuts() {
        let mut db = db_with(MemoryConnection::new()).await;
        assert!(db.check_safe_collation("SHOW TABLES").await);
        assert!(db.check_safe_collation("SELECT * FROM t").await);
        assert!(!db.check_safe_collation("SELECT 'é'").await);
    }

    #[tokio::test]
    async fn test_safe_collation_by_table() {
        let safe = vec![ColumnMeta::new("title", "varchar(50)", Some("utf8mb4_bin"))];
        let unsafe_ = vec![ColumnMeta::new("title", "varchar(50)", Some("utf8mb4_unicode_ci"))];
        let mut db = db_with(
            MemoryConnection::new()
                .with_table("safe", safe)
                .with_table("risky", unsafe_),
        )
        .await;

        assert!(db.check_safe_collation("SELECT * FROM safe WHERE title = 'é'").await);
        assert!(!db.check_safe_collation("SELECT * FROM risky WHERE title = 'é'").await);
    }

    // =========================================================================
    // Reconnect Tests
    // =========================================================================

    #[tokio::test]
    async fn test_reconnects_and_retries_once() {
        let mut db = db_with(MemoryConnection::new()).await;
        db.connection_mut().unwrap().go_away();

        db.query("SELECT 1").await.unwrap();
        let conn = db.connection().unwrap();
        assert_eq!(conn.reconnects(), 1);
        assert_eq!(
            conn.executed().iter().filter(|s| s.as_str() == "SELECT 1").count(),
            2
        );
    }

    #[tokio::test]
    async fn test_metadata_fetch_reconnects() {
        let mut db = db_with(MemoryConnection::new().with_table("ratings", ratings_table())).await;
        db.connection_mut().unwrap().go_away();

        assert_eq!(
            db.get_table_charset("ratings").await.unwrap(),
            Some(Charset::named("utf8mb4"))
        );
        assert_eq!(db.connection().unwrap().reconnects(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up() {
        let config = DbConfig::builder("filmometre")
            .reconnect_retries(2)
            .reconnect_backoff(std::time::Duration::from_millis(1))
            .build();
        let mut db = Database::new(config, MemoryConnection::new()).await.unwrap();
        let conn = db.connection_mut().unwrap();
        conn.go_away();
        conn.fail_reconnects(5);

        let err = db.query("SELECT 1").await.unwrap_err();
        assert!(matches!(err, DbError::Connection(_)));
        assert_eq!(db.insert_id(), 0);
    }
}
