//! Consistency controller
//!
//! Implements the four consistency regimes. `flush` and `lock` hold their
//! locks on a dedicated connection that must stay alive for the duration;
//! `snapshot` relies on the per-connection session snapshot applied by the
//! pool adapter; `none` does nothing.
//!
//! Lifecycle: `Idle -> Prepared -> Active -> Released`. Teardown is
//! idempotent so the orchestrator can release early (transactional
//! consistency) and again on the way out without tracking which happened.

use log::{debug, info};

use crate::catalog::{DatabaseTables, TableKind};
use crate::config::Consistency;
use crate::conn::{Connection, ConnectionPool};
use crate::error::{QuarryError, Result};
use crate::server::{ServerInfo, ServerKind};
use crate::sql::quote_table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Prepared,
    Active,
    Released,
}

/// Resolve `auto` against the detected server kind
pub fn resolve_auto(mode: Consistency, server: &ServerInfo) -> Consistency {
    if mode != Consistency::Auto {
        return mode;
    }
    match server.kind {
        ServerKind::Tidb => Consistency::Snapshot,
        ServerKind::MySql | ServerKind::MariaDb => Consistency::Flush,
        ServerKind::Unknown => Consistency::None,
    }
}

/// Whether a worker may replace a broken data connection without
/// invalidating the dump's consistency guarantee.
pub fn can_rebuild_conn(mode: Consistency, transactional_only: bool) -> bool {
    match mode {
        Consistency::Lock | Consistency::Flush => !transactional_only,
        Consistency::Snapshot | Consistency::None => true,
        Consistency::Auto => false,
    }
}

pub struct ConsistencyController {
    mode: Consistency,
    state: ControllerState,
    /// Holds the read locks for `flush`/`lock`; absent otherwise
    lock_conn: Option<Box<dyn Connection>>,
    lock_statement: Option<String>,
}

impl ConsistencyController {
    /// Build a controller for a resolved regime. `lock` needs the selected
    /// tables up front so the LOCK TABLES statement can be assembled.
    pub fn new(mode: Consistency, tables: Option<&DatabaseTables>) -> Result<Self> {
        let lock_statement = match mode {
            Consistency::Auto => {
                return Err(QuarryError::Consistency(
                    "consistency must be resolved before the controller is built".into(),
                ))
            }
            Consistency::Lock => {
                let tables = tables.ok_or_else(|| {
                    QuarryError::Consistency(
                        "lock consistency needs the table list before setup".into(),
                    )
                })?;
                Some(build_lock_tables_sql(tables)?)
            }
            _ => None,
        };
        Ok(Self {
            mode,
            state: ControllerState::Prepared,
            lock_conn: None,
            lock_statement,
        })
    }

    pub fn mode(&self) -> Consistency {
        self.mode
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Acquire the regime's server-side resources. For `flush`/`lock` this
    /// draws the dedicated lock-holding connection from the pool.
    pub async fn setup(&mut self, pool: &ConnectionPool) -> Result<()> {
        if self.state != ControllerState::Prepared {
            return Err(QuarryError::Consistency(format!(
                "consistency setup in state {:?}",
                self.state
            )));
        }
        match self.mode {
            Consistency::Flush => {
                let mut conn = pool.plain_connection().await?;
                conn.execute("FLUSH TABLES WITH READ LOCK").await?;
                info!("acquired global read lock");
                self.lock_conn = Some(conn);
            }
            Consistency::Lock => {
                let stmt = self
                    .lock_statement
                    .as_ref()
                    .ok_or_else(|| {
                        QuarryError::Consistency("lock statement missing at setup".into())
                    })?
                    .clone();
                let mut conn = pool.plain_connection().await?;
                conn.execute(&stmt).await?;
                info!("acquired table read locks");
                self.lock_conn = Some(conn);
            }
            Consistency::Snapshot | Consistency::None => {}
            Consistency::Auto => unreachable!("rejected in new"),
        }
        self.state = ControllerState::Active;
        Ok(())
    }

    /// Release the regime's resources. Safe to call more than once; only
    /// the first call after setup does work.
    pub async fn teardown(&mut self) -> Result<()> {
        if self.state != ControllerState::Active {
            self.state = ControllerState::Released;
            return Ok(());
        }
        self.state = ControllerState::Released;
        if let Some(mut conn) = self.lock_conn.take() {
            conn.execute("UNLOCK TABLES").await?;
            debug!("released read locks");
        }
        Ok(())
    }

    /// Verify the lock-holding connection is still alive. Workers call this
    /// before rebuilding a broken data connection: if the locks are gone the
    /// dump is no longer consistent and must fail.
    pub async fn ping_context(&mut self) -> Result<()> {
        match self.mode {
            Consistency::Flush | Consistency::Lock => {
                if self.state != ControllerState::Active {
                    // Locks released on purpose (transactional consistency):
                    // worker transactions carry the guarantee now.
                    return Ok(());
                }
                match self.lock_conn.as_mut() {
                    Some(conn) => conn
                        .ping()
                        .await
                        .map_err(|e| QuarryError::lock_connection_lost(&e.to_string())),
                    None => Err(QuarryError::lock_connection_lost("connection missing")),
                }
            }
            _ => Ok(()),
        }
    }
}

/// `LOCK TABLES a READ, b READ, ...` over every selected base table
fn build_lock_tables_sql(tables: &DatabaseTables) -> Result<String> {
    let mut parts = Vec::new();
    for (database, infos) in tables {
        for info in infos {
            if info.kind == TableKind::Base {
                parts.push(format!("{} READ", quote_table(database, &info.name)));
            }
        }
    }
    if parts.is_empty() {
        return Err(QuarryError::Consistency(
            "lock consistency selected but no base tables to lock".into(),
        ));
    }
    Ok(format!("LOCK TABLES {}", parts.join(",")))
}
