//! Connections and the consistency-primed pool adapter
//!
//! All SQL in the crate flows through the narrow `Connection` trait so the
//! orchestrator, chunker and workers can be driven by a scripted fake in
//! tests. The production implementation wraps a `mysql_async` connection and
//! carries rows as text-protocol values; the dump output is SQL text, so
//! strings are the natural carrier.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;

use crate::config::Config;
use crate::error::Result;
use crate::sql::escape_string;
use crate::task::ColumnInfo;

/// One row of text-protocol values; `None` is SQL NULL
pub type RowValues = Vec<Option<String>>;

/// A fully materialized query result
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<RowValues>,
}

impl ResultSet {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Value of a named column in a row, if present and non-NULL
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

/// A single server connection
#[async_trait]
pub trait Connection: Send {
    /// Run a statement, return the affected row count
    async fn execute(&mut self, sql: &str) -> Result<u64>;
    /// Run a query and materialize the full result
    async fn query(&mut self, sql: &str) -> Result<ResultSet>;
    /// Check the connection is still alive
    async fn ping(&mut self) -> Result<()>;
}

/// Source of new connections; the production provider draws from a
/// `mysql_async` pool, tests substitute a scripted factory.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// `mysql_async`-backed connection
pub struct MysqlConn {
    inner: mysql_async::Conn,
}

#[async_trait]
impl Connection for MysqlConn {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.inner.query_drop(sql).await?;
        Ok(self.inner.affected_rows())
    }

    async fn query(&mut self, sql: &str) -> Result<ResultSet> {
        let mut result = self.inner.query_iter(sql).await?;
        let columns = match result.columns() {
            Some(cols) => cols
                .iter()
                .map(|c| ColumnInfo {
                    name: c.name_str().into_owned(),
                    type_name: column_type_name(c.column_type()).to_string(),
                })
                .collect(),
            None => Vec::new(),
        };
        let raw: Vec<mysql_async::Row> = result.collect().await?;
        let rows = raw
            .into_iter()
            .map(|row| row.unwrap().into_iter().map(value_to_text).collect())
            .collect();
        Ok(ResultSet { columns, rows })
    }

    async fn ping(&mut self) -> Result<()> {
        self.inner.ping().await?;
        Ok(())
    }
}

/// Render a protocol value as text, the way the server would in the text
/// protocol. NULL stays `None`.
fn value_to_text(value: mysql_async::Value) -> Option<String> {
    use mysql_async::Value;
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(u) => Some(u.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(d) => Some(d.to_string()),
        Value::Date(y, m, d, h, mi, s, us) => {
            if us == 0 {
                Some(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    y, m, d, h, mi, s
                ))
            } else {
                Some(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                    y, m, d, h, mi, s, us
                ))
            }
        }
        Value::Time(neg, d, h, mi, s, us) => {
            let sign = if neg { "-" } else { "" };
            let hours = u32::from(h) + d * 24;
            if us == 0 {
                Some(format!("{}{:02}:{:02}:{:02}", sign, hours, mi, s))
            } else {
                Some(format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, mi, s, us))
            }
        }
    }
}

/// Map protocol column types onto `information_schema.columns` data types
fn column_type_name(t: ColumnType) -> &'static str {
    match t {
        ColumnType::MYSQL_TYPE_TINY => "tinyint",
        ColumnType::MYSQL_TYPE_SHORT => "smallint",
        ColumnType::MYSQL_TYPE_INT24 => "mediumint",
        ColumnType::MYSQL_TYPE_LONG => "int",
        ColumnType::MYSQL_TYPE_LONGLONG => "bigint",
        ColumnType::MYSQL_TYPE_FLOAT => "float",
        ColumnType::MYSQL_TYPE_DOUBLE => "double",
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => "decimal",
        ColumnType::MYSQL_TYPE_YEAR => "year",
        ColumnType::MYSQL_TYPE_BIT => "bit",
        ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => "date",
        ColumnType::MYSQL_TYPE_DATETIME => "datetime",
        ColumnType::MYSQL_TYPE_TIMESTAMP => "timestamp",
        ColumnType::MYSQL_TYPE_TIME => "time",
        ColumnType::MYSQL_TYPE_JSON => "json",
        ColumnType::MYSQL_TYPE_ENUM => "enum",
        ColumnType::MYSQL_TYPE_SET => "set",
        ColumnType::MYSQL_TYPE_VARCHAR | ColumnType::MYSQL_TYPE_VAR_STRING => "varchar",
        ColumnType::MYSQL_TYPE_STRING => "char",
        ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB => "blob",
        ColumnType::MYSQL_TYPE_GEOMETRY => "geometry",
        _ => "varchar",
    }
}

/// Production connection provider backed by a `mysql_async` pool
pub struct MysqlProvider {
    pool: mysql_async::Pool,
}

impl MysqlProvider {
    pub fn new(config: &Config) -> Self {
        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()));
        Self {
            pool: mysql_async::Pool::new(opts),
        }
    }
}

#[async_trait]
impl ConnectionProvider for MysqlProvider {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = self.pool.get_conn().await?;
        Ok(Box::new(MysqlConn { inner: conn }))
    }
}

/// Session setup applied to every connection the pool hands out, fixed once
/// the orchestrator has resolved consistency and acquired its snapshot.
#[derive(Debug, Clone, Default)]
pub struct SessionPriming {
    /// `SET SESSION tidb_snapshot = ...` on TiKV-backed TiDB
    pub snapshot: Option<String>,
    /// Extra session variables from the configuration
    pub session_params: BTreeMap<String, String>,
    /// `tidb_mem_quota_query`; 0 leaves the server default
    pub mem_quota: u64,
    /// Open a consistent-snapshot transaction on each worker connection so
    /// the global/table read locks can be released early
    pub consistent_snapshot_txn: bool,
}

impl SessionPriming {
    /// The statements applied to a fresh connection, in order
    pub fn statements(&self) -> Vec<String> {
        let mut stmts = Vec::new();
        for (key, value) in &self.session_params {
            stmts.push(format!("SET SESSION {} = {}", key, session_value(value)));
        }
        if self.mem_quota > 0 {
            stmts.push(format!("SET SESSION tidb_mem_quota_query = {}", self.mem_quota));
        }
        if let Some(snapshot) = &self.snapshot {
            stmts.push(format!(
                "SET SESSION tidb_snapshot = '{}'",
                escape_string(snapshot)
            ));
        }
        if self.consistent_snapshot_txn {
            stmts.push("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ".to_string());
            stmts.push("START TRANSACTION /*!40108 WITH CONSISTENT SNAPSHOT */".to_string());
        }
        stmts
    }
}

/// Numbers pass through bare, everything else is quoted
fn session_value(value: &str) -> String {
    if value.parse::<f64>().is_ok() {
        value.to_string()
    } else {
        format!("'{}'", escape_string(value))
    }
}

/// Yields consistency-primed connections. Every worker's connection comes
/// from here, so all workers observe the same logical point in time under
/// snapshot isolation.
pub struct ConnectionPool {
    provider: Arc<dyn ConnectionProvider>,
    priming: SessionPriming,
}

impl ConnectionPool {
    pub fn new(provider: Arc<dyn ConnectionProvider>, priming: SessionPriming) -> Self {
        Self { provider, priming }
    }

    /// A connection with no session setup, for control statements
    pub async fn plain_connection(&self) -> Result<Box<dyn Connection>> {
        self.provider.connect().await
    }

    /// A connection set up for the active consistency regime
    pub async fn connection_with_consistency(&self) -> Result<Box<dyn Connection>> {
        let mut conn = self.provider.connect().await?;
        for stmt in self.priming.statements() {
            conn.execute(&stmt).await?;
        }
        Ok(conn)
    }
}
