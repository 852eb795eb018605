//! Metadata recorder
//!
//! Captures the server position (binlog file/offset/GTID set, or the TiDB
//! snapshot timestamp) plus start/finish times into a single text artifact.
//! The artifact is written to the external store only after a successful
//! dump; recording failures are logged and never fail the dump.

use chrono::{DateTime, Utc};
use log::info;

use crate::conn::Connection;
use crate::error::Result;
use crate::server::ServerInfo;
use crate::storage::ExternalStorage;

/// Artifact object name in the external store
pub const METADATA_OBJECT: &str = "metadata";

#[derive(Debug, Clone, Default)]
pub struct BinlogPosition {
    pub log_file: Option<String>,
    pub offset: Option<String>,
    pub gtid_set: Option<String>,
}

impl BinlogPosition {
    fn is_empty(&self) -> bool {
        self.log_file.is_none() && self.offset.is_none() && self.gtid_set.is_none()
    }
}

/// Accumulates the global metadata over the lifetime of a dump
pub struct Metadata {
    server: ServerInfo,
    snapshot: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    position: BinlogPosition,
    /// Second capture, taken after worker connections were live
    position_after_connect: Option<BinlogPosition>,
}

impl Metadata {
    pub fn new(server: ServerInfo, snapshot: Option<String>) -> Self {
        Self {
            server,
            snapshot,
            started_at: Utc::now(),
            finished_at: None,
            position: BinlogPosition::default(),
            position_after_connect: None,
        }
    }

    /// Capture `SHOW MASTER STATUS` into the initial position
    pub async fn record_start_position(&mut self, conn: &mut dyn Connection) -> Result<()> {
        self.position = query_position(conn).await?;
        Ok(())
    }

    /// Capture the position again once the worker connections are live.
    /// This uses the metadata connection, so the result is "at or after the
    /// moment the workers were primed" -- the safe side for consumers that
    /// resume replication from it.
    pub async fn record_position_after_connect(
        &mut self,
        conn: &mut dyn Connection,
    ) -> Result<()> {
        self.position_after_connect = Some(query_position(conn).await?);
        Ok(())
    }

    pub fn record_finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Render the artifact text
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Started dump at: {}\n",
            self.started_at.format("%Y-%m-%d %H:%M:%S")
        ));
        out.push_str(&format!(
            "Server: {} {}\n",
            self.server.kind.as_str(),
            self.server
                .version
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        ));
        render_position(
            &mut out,
            "SHOW MASTER STATUS:",
            &self.position,
            self.snapshot.as_deref(),
        );
        if let Some(pos) = &self.position_after_connect {
            render_position(&mut out, "SHOW MASTER STATUS: /* after connection */", pos, None);
        }
        if let Some(finished) = self.finished_at {
            out.push_str(&format!(
                "Finished dump at: {}\n",
                finished.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        out
    }

    /// Write the artifact; called only when the dump succeeded
    pub async fn write_to(&self, storage: &dyn ExternalStorage) -> Result<()> {
        storage
            .write_object(METADATA_OBJECT, self.render().as_bytes())
            .await?;
        info!("metadata artifact written");
        Ok(())
    }
}

async fn query_position(conn: &mut dyn Connection) -> Result<BinlogPosition> {
    let result = conn.query("SHOW MASTER STATUS").await?;
    if result.rows.is_empty() {
        return Ok(BinlogPosition::default());
    }
    Ok(BinlogPosition {
        log_file: result.value(0, "File").map(str::to_string),
        offset: result.value(0, "Position").map(str::to_string),
        gtid_set: result
            .value(0, "Executed_Gtid_Set")
            .map(str::to_string)
            .filter(|s| !s.is_empty()),
    })
}

fn render_position(out: &mut String, header: &str, pos: &BinlogPosition, snapshot: Option<&str>) {
    if pos.is_empty() && snapshot.is_none() {
        return;
    }
    out.push_str(header);
    out.push('\n');
    if let Some(log) = &pos.log_file {
        out.push_str(&format!("\tLog: {}\n", log));
    }
    if let Some(offset) = &pos.offset {
        out.push_str(&format!("\tPos: {}\n", offset));
    }
    if let Some(gtid) = &pos.gtid_set {
        out.push_str(&format!("\tGTID: {}\n", gtid));
    }
    if let Some(snapshot) = snapshot {
        out.push_str(&format!("\tSnapshot: {}\n", snapshot));
    }
    out.push('\n');
}
