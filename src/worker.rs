//! Dump workers
//!
//! A fixed-size pool of consumers. Each worker owns a consistency-primed
//! connection and dequeues tasks until the queue is closed and drained or
//! the shared context is canceled. Data-connection failures go through the
//! rebuild gate: if the regime still guarantees a consistent view on a
//! fresh connection, the worker swaps connections and retries the chunk
//! once instead of failing the dump.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::config::Consistency;
use crate::conn::{Connection, ConnectionPool, ResultSet};
use crate::consistency::{can_rebuild_conn, ConsistencyController};
use crate::error::{QuarryError, Result};
use crate::metadata::Metadata;
use crate::task::{ChunkSource, Task};
use crate::writer::Writer;

/// Observer notified as tasks and tables complete. Keeps workers and the
/// orchestrator free of references to each other.
pub trait Progress: Send + Sync {
    fn task_finished(&self, task: &Task);
    fn table_finished(&self, database: &str, table: &str);
}

/// Counts finished tasks and, by tracking each table's remaining chunks,
/// finished tables.
#[derive(Default)]
pub struct ProgressTracker {
    finished_tasks: AtomicU64,
    finished_tables: AtomicU64,
    remaining_chunks: Mutex<HashMap<(String, String), usize>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a table's chunk count before its first chunk is enqueued
    pub fn register_table(&self, database: &str, table: &str, chunks: usize) {
        if chunks == 0 {
            self.table_finished(database, table);
            return;
        }
        let mut remaining = self.remaining_chunks.lock().unwrap_or_else(|e| e.into_inner());
        remaining.insert((database.to_string(), table.to_string()), chunks);
    }

    pub fn finished_tasks(&self) -> u64 {
        self.finished_tasks.load(Ordering::Relaxed)
    }

    pub fn finished_tables(&self) -> u64 {
        self.finished_tables.load(Ordering::Relaxed)
    }
}

impl Progress for ProgressTracker {
    fn task_finished(&self, task: &Task) {
        self.finished_tasks.fetch_add(1, Ordering::Relaxed);
        if let Task::TableData { meta, .. } = task {
            let done = {
                let mut remaining =
                    self.remaining_chunks.lock().unwrap_or_else(|e| e.into_inner());
                match remaining.get_mut(&(meta.database.clone(), meta.table.clone())) {
                    Some(count) => {
                        *count = count.saturating_sub(1);
                        *count == 0
                    }
                    None => false,
                }
            };
            if done {
                self.table_finished(&meta.database, &meta.table);
            }
        }
    }

    fn table_finished(&self, database: &str, table: &str) {
        self.finished_tables.fetch_add(1, Ordering::Relaxed);
        info!("finished dumping `{}`.`{}`", database, table);
    }
}

/// Narrow capability object a worker uses to replace a broken data
/// connection: probe the consistency controller, draw a fresh primed
/// connection, and re-record the position when the dump asked for it.
pub struct RebuildHandle {
    pub controller: Arc<AsyncMutex<ConsistencyController>>,
    pub pool: Arc<ConnectionPool>,
    pub metadata: Arc<AsyncMutex<Metadata>>,
    pub mode: Consistency,
    pub transactional_only: bool,
    pub pos_after_connect: bool,
}

impl RebuildHandle {
    pub fn permitted(&self) -> bool {
        can_rebuild_conn(self.mode, self.transactional_only)
    }

    /// Acquire a replacement connection. Fails if the lock-holding
    /// connection died, since chunk work would no longer be consistent.
    pub async fn rebuild(&self) -> Result<Box<dyn Connection>> {
        self.controller.lock().await.ping_context().await?;
        let mut conn = self.pool.connection_with_consistency().await?;
        if self.pos_after_connect {
            self.metadata
                .lock()
                .await
                .record_position_after_connect(conn.as_mut())
                .await?;
        }
        Ok(conn)
    }
}

pub struct Worker {
    id: usize,
    conn: Box<dyn Connection>,
    writer: Arc<dyn Writer>,
    rebuild: Arc<RebuildHandle>,
    token: CancellationToken,
    progress: Arc<dyn Progress>,
}

impl Worker {
    pub fn new(
        id: usize,
        conn: Box<dyn Connection>,
        writer: Arc<dyn Writer>,
        rebuild: Arc<RebuildHandle>,
        token: CancellationToken,
        progress: Arc<dyn Progress>,
    ) -> Self {
        Self {
            id,
            conn,
            writer,
            rebuild,
            token,
            progress,
        }
    }

    /// Consume tasks until the queue closes or the context is canceled
    pub async fn run(mut self, rx: async_channel::Receiver<Task>) -> Result<()> {
        loop {
            let task = tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("worker {} canceled", self.id);
                    return Ok(());
                }
                task = rx.recv() => match task {
                    Ok(task) => task,
                    Err(_) => {
                        debug!("worker {} drained", self.id);
                        return Ok(());
                    }
                },
            };
            self.handle_task(&task).await?;
            self.progress.task_finished(&task);
        }
    }

    async fn handle_task(&mut self, task: &Task) -> Result<()> {
        match task {
            Task::DatabaseMeta {
                database,
                create_sql,
            } => self.writer.write_database_meta(database, create_sql).await,
            Task::TableMeta {
                database,
                table,
                create_sql,
            } => {
                self.writer
                    .write_table_meta(database, table, create_sql)
                    .await
            }
            Task::ViewMeta {
                database,
                view,
                create_table_sql,
                create_view_sql,
            } => {
                self.writer
                    .write_view_meta(database, view, create_table_sql, create_view_sql)
                    .await
            }
            Task::TableData {
                meta,
                source,
                chunk_index,
                total_chunks,
            } => {
                match self
                    .run_chunk(meta, source, *chunk_index, *total_chunks)
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_connection_error() && self.rebuild.permitted() => {
                        warn!(
                            "worker {}: data connection failed on {} ({}), rebuilding",
                            self.id,
                            task.describe(),
                            e
                        );
                        self.conn = self.rebuild.rebuild().await?;
                        self.run_chunk(meta, source, *chunk_index, *total_chunks)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Execute the chunk's query (or queries) and hand the rows to the
    /// writer as one logical chunk.
    async fn run_chunk(
        &mut self,
        meta: &crate::task::TableMeta,
        source: &ChunkSource,
        chunk_index: usize,
        total_chunks: usize,
    ) -> Result<()> {
        let rows = match source {
            ChunkSource::SingleQuery { sql, .. } => self.conn.query(sql).await?,
            ChunkSource::MultiQuery { sqls, column_count } => {
                let mut combined = ResultSet::default();
                for sql in sqls {
                    let part = self.conn.query(sql).await?;
                    if !part.columns.is_empty() && part.columns.len() != *column_count {
                        return Err(QuarryError::Internal(format!(
                            "sub-query of `{}`.`{}` returned {} columns, expected {}",
                            meta.database,
                            meta.table,
                            part.columns.len(),
                            column_count
                        )));
                    }
                    if combined.columns.is_empty() {
                        combined.columns = part.columns;
                    }
                    combined.rows.extend(part.rows);
                }
                combined
            }
        };
        self.writer
            .write_table_data(meta, &rows, chunk_index, total_chunks)
            .await
    }
}
