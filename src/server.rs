//! Server probe
//!
//! Detects the server kind and version from `SELECT version()` and derives
//! the capability flags the chunker and the orchestrator branch on. The
//! distributed SQL engine (TiDB) announces itself with a `-TiDB-` marker in
//! the version string; whether it sits on a distributed storage layer is
//! probed separately because the SQL layer can also run standalone.

use log::{debug, warn};
use semver::Version;

use crate::conn::Connection;
use crate::error::Result;

/// Which flavor of MySQL-protocol server we are talking to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    MySql,
    MariaDb,
    Tidb,
    Unknown,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::MySql => "MySQL",
            ServerKind::MariaDb => "MariaDB",
            ServerKind::Tidb => "TiDB",
            ServerKind::Unknown => "unknown",
        }
    }
}

/// Detected server identity plus capability inputs
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub kind: ServerKind,
    pub version: Option<Version>,
    pub has_distributed_storage: bool,
}

impl ServerInfo {
    /// Parse a `SELECT version()` string. The storage probe result is
    /// filled in separately.
    pub fn parse(version_text: &str) -> Self {
        let kind = if version_text.contains("TiDB") {
            ServerKind::Tidb
        } else if version_text.contains("MariaDB") {
            ServerKind::MariaDb
        } else if !version_text.is_empty() {
            ServerKind::MySql
        } else {
            ServerKind::Unknown
        };

        let version = extract_version(version_text, kind);
        if version.is_none() {
            warn!("cannot parse server version from {:?}", version_text);
        }

        ServerInfo {
            kind,
            version,
            has_distributed_storage: false,
        }
    }

    fn version_at_least(&self, major: u64, minor: u64, patch: u64) -> bool {
        match &self.version {
            Some(v) => (v.major, v.minor, v.patch) >= (major, minor, patch),
            None => false,
        }
    }

    /// TiDB 5.0 added `TABLESAMPLE REGIONS()`
    pub fn supports_table_sampling(&self) -> bool {
        self.kind == ServerKind::Tidb && self.version_at_least(5, 0, 0)
    }

    /// TiDB 3.0 added `tidb_decode_key`, usable when regions exist at all
    pub fn supports_region_decoding(&self) -> bool {
        self.kind == ServerKind::Tidb
            && self.has_distributed_storage
            && self.version_at_least(3, 0, 0)
    }

    /// TiDB 4.0 added service-level GC safepoints
    pub fn supports_gc_safepoint(&self) -> bool {
        self.kind == ServerKind::Tidb
            && self.has_distributed_storage
            && self.version_at_least(4, 0, 0)
    }
}

/// Pull the numeric version out of the server greeting.
///
/// TiDB reports something like `5.7.25-TiDB-v4.0.0`; MySQL `8.0.32-0ubuntu`;
/// MariaDB `10.6.12-MariaDB-1:10.6.12+maria~ubu2204`.
fn extract_version(text: &str, kind: ServerKind) -> Option<Version> {
    let raw = match kind {
        ServerKind::Tidb => {
            let marker = "-TiDB-";
            let start = text.find(marker)? + marker.len();
            let rest = &text[start..];
            rest.strip_prefix('v').unwrap_or(rest)
        }
        _ => text.split('-').next()?,
    };
    // Cut anything after the numeric (and optional prerelease) core so
    // vendor suffixes do not break the parse.
    let core: String = raw
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || c.is_ascii_alphanumeric())
        .collect();
    Version::parse(core.trim_end_matches('.')).ok()
}

/// Detect the server kind, version and storage layer over a live connection.
pub async fn detect_server_info(conn: &mut dyn Connection) -> Result<ServerInfo> {
    let result = conn.query("SELECT version()").await?;
    let version_text = result
        .rows
        .first()
        .and_then(|row| row.first())
        .and_then(|v| v.as_deref())
        .unwrap_or("");
    let mut info = ServerInfo::parse(version_text);

    if info.kind == ServerKind::Tidb {
        info.has_distributed_storage = probe_distributed_storage(conn).await;
    }

    debug!(
        "detected server: kind={} version={:?} distributed_storage={}",
        info.kind.as_str(),
        info.version,
        info.has_distributed_storage
    );
    Ok(info)
}

/// A TiDB server backed by the distributed KV layer exposes the GC lifetime
/// variable; a standalone SQL layer does not. Probe failures are treated as
/// "no storage layer" so vanilla deployments keep working.
async fn probe_distributed_storage(conn: &mut dyn Connection) -> bool {
    let sql = "SELECT COUNT(1) FROM mysql.tidb WHERE VARIABLE_NAME = 'tikv_gc_life_time'";
    match conn.query(sql).await {
        Ok(result) => result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_deref())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|count| count > 0)
            .unwrap_or(false),
        Err(e) => {
            debug!("distributed storage probe failed, assuming none: {}", e);
            false
        }
    }
}
