//! Dump configuration
//!
//! A `Config` is built once (from flags or a JSON file) and is immutable for
//! the lifetime of the dump. The only adjustment the orchestrator makes is
//! resolving the `auto` consistency level against the detected server.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{QuarryError, Result};

/// The consistency regime used to make the dump see a single logical
/// snapshot of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// Resolved against the detected server kind before the dump starts
    Auto,
    /// `FLUSH TABLES WITH READ LOCK` held on a dedicated connection
    Flush,
    /// `LOCK TABLES ... READ` over every selected table
    Lock,
    /// Server-side MVCC snapshot applied to every worker connection
    Snapshot,
    /// No consistency guarantee
    None,
}

impl Consistency {
    /// Parse a consistency name as given on the command line
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Consistency::Auto),
            "flush" => Ok(Consistency::Flush),
            "lock" => Ok(Consistency::Lock),
            "snapshot" => Ok(Consistency::Snapshot),
            "none" => Ok(Consistency::None),
            other => Err(QuarryError::Config(format!(
                "unknown consistency level '{}' (expected auto, flush, lock, snapshot or none)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Consistency::Auto => "auto",
            Consistency::Flush => "flush",
            Consistency::Lock => "lock",
            Consistency::Snapshot => "snapshot",
            Consistency::None => "none",
        }
    }
}

/// Dump configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// User name
    pub user: String,
    /// Password
    pub password: String,
    /// Databases to dump; empty means every non-system database
    pub databases: Vec<String>,
    /// Directory the artifacts are written into
    pub output_dir: PathBuf,
    /// Consistency regime
    pub consistency: Consistency,
    /// Number of dump workers
    pub threads: usize,
    /// Target rows per chunk; `None` disables chunking
    pub rows: Option<u64>,
    /// User WHERE clause appended to every data select
    pub where_clause: Option<String>,
    /// Raw SQL mode: dump the result of this statement instead of tables
    pub sql: String,
    /// Skip row data
    pub no_data: bool,
    /// Skip schema DDL
    pub no_schemas: bool,
    /// Skip views
    pub no_views: bool,
    /// Always write explicit column lists in INSERT statements
    pub complete_insert: bool,
    /// Release the global/table read locks once every worker has started a
    /// consistent-snapshot transaction
    pub transactional_consistency: bool,
    /// Record the server position a second time after worker connections
    /// are live
    pub pos_after_connect: bool,
    /// Opaque server snapshot handle; acquired automatically when empty
    pub snapshot: String,
    /// Per-session memory quota on TiDB servers; 0 leaves the server default
    pub tidb_mem_quota_query: u64,
    /// Extra session variables applied to every connection
    pub session_params: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            databases: Vec::new(),
            output_dir: PathBuf::from("./dump-data"),
            consistency: Consistency::Auto,
            threads: 4,
            rows: None,
            where_clause: None,
            sql: String::new(),
            no_data: false,
            no_schemas: false,
            no_views: false,
            complete_insert: false,
            transactional_consistency: true,
            pos_after_connect: false,
            snapshot: String::new(),
            tidb_mem_quota_query: 0,
            session_params: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load a configuration from a JSON file
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the dump cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(QuarryError::Config("threads must be at least 1".into()));
        }
        if let Some(rows) = self.rows {
            if rows == 0 {
                return Err(QuarryError::Config("rows must be at least 1".into()));
            }
        }
        if !self.sql.is_empty() && self.no_data {
            return Err(QuarryError::Config(
                "raw SQL mode and no-data cannot be combined".into(),
            ));
        }
        Ok(())
    }
}
