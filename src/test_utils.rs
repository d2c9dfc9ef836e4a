//! In-memory [`Connection`] for tests
//!
//! Answers `SHOW FULL COLUMNS`, `SET NAMES` and `DO 1` from registered table
//! definitions and hands every other statement to an optional handler.
//! Every statement is logged, including ones that fail.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::{DbError, Result};
use crate::sql::sniff::StatementKind;
use crate::types::{Cell, ColumnMeta, QueryOutput, Row};

type Handler = Box<dyn FnMut(&str) -> Result<QueryOutput> + Send>;

pub struct MemoryConnection {
    tables: HashMap<String, Vec<ColumnMeta>>,
    handler: Option<Handler>,
    executed: Vec<String>,
    charset: String,
    server_version: String,
    alive: bool,
    failing_reconnects: u32,
    reconnects: u32,
    next_insert_id: u64,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            handler: None,
            executed: Vec::new(),
            charset: "utf8mb4".to_string(),
            server_version: "8.0.36".to_string(),
            alive: true,
            failing_reconnects: 0,
            reconnects: 0,
            next_insert_id: 0,
        }
    }

    /// Register a table answered by `SHOW FULL COLUMNS`
    pub fn with_table(mut self, table: &str, columns: Vec<ColumnMeta>) -> Self {
        self.tables.insert(table.to_lowercase(), columns);
        self
    }

    /// Answer every other statement with `handler`
    pub fn with_handler(
        mut self,
        handler: impl FnMut(&str) -> Result<QueryOutput> + Send + 'static,
    ) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn with_server_version(mut self, version: &str) -> Self {
        self.server_version = version.to_string();
        self
    }

    pub fn with_charset(mut self, charset: &str) -> Self {
        self.charset = charset.to_string();
        self
    }

    /// Statements received so far
    pub fn executed(&self) -> Vec<String> {
        self.executed.clone()
    }

    /// Simulate the server going away; statements and pings fail until a
    /// reconnect succeeds
    pub fn go_away(&mut self) {
        self.alive = false;
    }

    /// Make the next `count` reconnect attempts fail
    pub fn fail_reconnects(&mut self, count: u32) {
        self.failing_reconnects = count;
    }

    /// Successful reconnects so far
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    fn describe(&self, sql: &str) -> Option<Result<QueryOutput>> {
        let table = sql.strip_prefix("SHOW FULL COLUMNS FROM ")?;
        let table = table.replace("``", "\u{0}").replace('`', "").replace('\u{0}', "`");

        let result = match self.tables.get(&table.to_lowercase()) {
            Some(columns) => Ok(QueryOutput::with_rows(
                columns
                    .iter()
                    .map(|col| {
                        Row::new()
                            .with("Field", col.field.as_str())
                            .with("Type", col.column_type.as_str())
                            .with(
                                "Collation",
                                col.collation.as_deref().map_or(Cell::Null, Cell::from),
                            )
                    })
                    .collect(),
            )),
            None => Err(DbError::query(format!("Table '{}' doesn't exist", table))),
        };
        Some(result)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> Result<QueryOutput> {
        self.executed.push(sql.to_string());

        if !self.alive {
            return Err(DbError::connection("MySQL server has gone away"));
        }
        if let Some(result) = self.describe(sql) {
            return result;
        }
        if sql.starts_with("SET NAMES") {
            return Ok(QueryOutput::default());
        }
        if let Some(handler) = self.handler.as_mut() {
            return handler(sql);
        }

        Ok(match StatementKind::of(sql) {
            StatementKind::Read => QueryOutput::default(),
            StatementKind::Ddl => QueryOutput::default(),
            StatementKind::Write { inserts } => {
                let mut output = QueryOutput::affected(1);
                if inserts {
                    self.next_insert_id += 1;
                    output.last_insert_id = self.next_insert_id;
                }
                output
            }
        })
    }

    fn character_set_name(&self) -> &str {
        &self.charset
    }

    async fn ping(&mut self) -> Result<()> {
        self.executed.push("DO 1".to_string());
        if self.alive {
            Ok(())
        } else {
            Err(DbError::connection("MySQL server has gone away"))
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        if self.failing_reconnects > 0 {
            self.failing_reconnects -= 1;
            return Err(DbError::connection("Can't connect to MySQL server"));
        }
        self.alive = true;
        self.reconnects += 1;
        Ok(())
    }

    fn server_version(&self) -> &str {
        &self.server_version
    }
}
