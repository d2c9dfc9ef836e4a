//! Configuration for the database session
//!
//! Provides a builder pattern for configuring a [`Database`](crate::Database),
//! plus the host-string parsing used to derive connection options.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use url::Url;

use crate::error::{DbError, Result};
use crate::types::FieldFormat;

static IPV6_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\[)?(?P<host>[0-9a-fA-F:]+)(?:\]:(?P<port>[\d]+))?")
        .expect("IPv6 host pattern is a valid regex")
});

static IPV4_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<host>[^:/]*)(?::(?P<port>[\d]+))?")
        .expect("IPv4 host pattern is a valid regex")
});

/// Parts of a `DB_HOST` style string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHost {
    pub host: String,
    pub port: Option<u16>,
    /// Unix socket path, from a `host:/path/to.sock` suffix
    pub socket: Option<String>,
    pub is_ipv6: bool,
}

/// Split a host string into host, port, socket and an IPv6 flag
///
/// Accepted forms: `localhost`, `db:3307`, `localhost:/tmp/mysql.sock`,
/// `::1`, `[::1]:3307`. Returns `None` when an IPv6-looking address cannot
/// be parsed.
///
/// # Example
/// ```
/// use filmometre::config::parse_db_host;
///
/// let parsed = parse_db_host("db.internal:3307").unwrap();
/// assert_eq!(parsed.host, "db.internal");
/// assert_eq!(parsed.port, Some(3307));
/// ```
pub fn parse_db_host(host: &str) -> Option<DbHost> {
    let (host, socket) = match host.find(":/") {
        Some(pos) => (&host[..pos], Some(host[pos + 1..].to_string())),
        None => (host, None),
    };

    let is_ipv6 = host.matches(':').count() > 1;
    let pattern = if is_ipv6 { &*IPV6_HOST } else { &*IPV4_HOST };
    let caps = pattern.captures(host)?;

    let port = caps
        .name("port")
        .and_then(|p| p.as_str().parse::<u16>().ok())
        .filter(|p| *p != 0);

    Some(DbHost {
        host: caps
            .name("host")
            .map(|h| h.as_str().to_string())
            .unwrap_or_default(),
        port,
        socket,
        is_ipv6,
    })
}

/// Configuration for a database session
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database (schema) name
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    /// Host string, parsed by [`parse_db_host`] (default: "localhost")
    pub db_host: String,
    /// Requested connection charset (default: "utf8mb4")
    pub charset: String,
    /// Requested collation, empty to let the server-aware default apply
    pub collate: String,
    /// Reconnect attempts after the server went away (default: 5)
    pub reconnect_retries: u32,
    /// Pause between reconnect attempts (default: 1 second)
    pub reconnect_backoff: Duration,
    /// Keep the legacy unquoted `%s` behavior for formatted placeholders
    /// (default: true)
    pub allow_unsafe_unquoted_parameters: bool,
    /// Default formats for known columns when a CRUD call passes none
    pub field_types: HashMap<String, FieldFormat>,
}

impl DbConfig {
    /// Create a new configuration builder
    pub fn builder(db_name: impl Into<String>) -> DbConfigBuilder {
        DbConfigBuilder::new(db_name)
    }

    /// Read `DB_HOST`, `DB_NAME`, `DB_USER`, `DB_PASS` and `DB_PORT`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |key: &str| -> Result<String> {
            lookup(key).ok_or_else(|| {
                DbError::config(format!("Missing environment variable {}", key))
            })
        };

        let host = require("DB_HOST")?;
        let name = require("DB_NAME")?;
        let user = require("DB_USER")?;
        let password = require("DB_PASS")?;
        let port = require("DB_PORT")?;

        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| DbError::config(format!("DB_PORT is not a valid port: '{}'", port)))?;

        // An explicit port or socket inside DB_HOST wins.
        let host = match parse_db_host(&host) {
            Some(parsed) if parsed.port.is_none() && parsed.socket.is_none() => {
                if parsed.is_ipv6 {
                    format!("[{}]:{}", parsed.host, port)
                } else {
                    format!("{}:{}", parsed.host, port)
                }
            }
            _ => host,
        };

        Ok(Self::builder(name)
            .user(user)
            .password(password)
            .host(host)
            .build())
    }

    /// Parsed form of `db_host`
    pub fn host(&self) -> Result<DbHost> {
        parse_db_host(&self.db_host)
            .ok_or_else(|| DbError::config(format!("Cannot parse database host '{}'", self.db_host)))
    }

    /// `mysql://` URL for the configured server
    ///
    /// Credentials, database name and socket path are percent-encoded.
    pub fn database_url(&self) -> Result<String> {
        let host = self.host()?;
        let invalid = |part: &str| DbError::config(format!("Invalid {} for database URL", part));

        let mut url = Url::parse("mysql://localhost/").map_err(|_| invalid("scheme"))?;
        let authority = if host.is_ipv6 {
            format!("[{}]", host.host)
        } else {
            host.host.clone()
        };
        url.set_host(Some(&authority)).map_err(|_| invalid("host"))?;
        url.set_port(host.port).map_err(|_| invalid("port"))?;
        url.set_username(&self.db_user)
            .map_err(|_| invalid("user"))?;
        if !self.db_password.is_empty() {
            url.set_password(Some(&self.db_password))
                .map_err(|_| invalid("password"))?;
        }
        url.set_path(&format!("/{}", self.db_name));
        if let Some(socket) = &host.socket {
            url.query_pairs_mut().append_pair("socket", socket);
        }
        Ok(url.into())
    }

    /// Default format for a column, if configured
    pub fn field_type(&self, column: &str) -> Option<FieldFormat> {
        self.field_types.get(column).copied()
    }
}

/// Builder for DbConfig
#[derive(Debug)]
pub struct DbConfigBuilder {
    db_name: String,
    db_user: String,
    db_password: String,
    db_host: String,
    charset: String,
    collate: String,
    reconnect_retries: u32,
    reconnect_backoff: Duration,
    allow_unsafe_unquoted_parameters: bool,
    field_types: HashMap<String, FieldFormat>,
}

impl DbConfigBuilder {
    /// Create a new builder with the database name
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            db_user: String::new(),
            db_password: String::new(),
            db_host: "localhost".to_string(),
            charset: "utf8mb4".to_string(),
            collate: String::new(),
            reconnect_retries: 5,
            reconnect_backoff: Duration::from_secs(1),
            allow_unsafe_unquoted_parameters: true,
            field_types: HashMap::new(),
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.db_user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.db_password = password.into();
        self
    }

    /// Set the host string (default: "localhost")
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.db_host = host.into();
        self
    }

    /// Set the connection charset (default: "utf8mb4")
    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    /// Set the connection collation (default: chosen from the server version)
    pub fn collate(mut self, collate: impl Into<String>) -> Self {
        self.collate = collate.into();
        self
    }

    /// Set the number of reconnect attempts (default: 5)
    pub fn reconnect_retries(mut self, retries: u32) -> Self {
        self.reconnect_retries = retries;
        self
    }

    /// Set the pause between reconnect attempts (default: 1s)
    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Enable or disable the legacy unquoted placeholder behavior (default: true)
    pub fn allow_unsafe_unquoted_parameters(mut self, enabled: bool) -> Self {
        self.allow_unsafe_unquoted_parameters = enabled;
        self
    }

    /// Register a default format for a column
    pub fn field_type(mut self, column: impl Into<String>, format: FieldFormat) -> Self {
        self.field_types.insert(column.into(), format);
        self
    }

    /// Build the configuration
    pub fn build(self) -> DbConfig {
        DbConfig {
            db_name: self.db_name,
            db_user: self.db_user,
            db_password: self.db_password,
            db_host: self.db_host,
            charset: self.charset,
            collate: self.collate,
            reconnect_retries: self.reconnect_retries,
            reconnect_backoff: self.reconnect_backoff,
            allow_unsafe_unquoted_parameters: self.allow_unsafe_unquoted_parameters,
            field_types: self.field_types,
        }
    }
}
