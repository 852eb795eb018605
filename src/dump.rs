//! Dump orchestrator
//!
//! Ties everything together: initialization steps run in `new`, the dump
//! phases run in `dump`, and `close` cancels the shared context.
//!
//! Initialization: open the SQL handle, detect the server, resolve `auto`
//! consistency, acquire a snapshot and start the GC safepoint keeper on a
//! distributed server, then freeze the session priming every connection
//! will get.
//!
//! Dump phases: enumerate (before consistency setup for `lock`, after it
//! otherwise), set up consistency, record metadata, pre-compute region
//! handles for older TiDB versions, start the workers, optionally release
//! locks once every worker holds a consistent-snapshot transaction, run the
//! chunkers, close the queue, drain the workers and finally write the
//! metadata artifact iff everything succeeded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::catalog::{self, DatabaseTables, TableKind};
use crate::chunk::{region, ChunkPlanner};
use crate::config::{Config, Consistency};
use crate::conn::{
    Connection, ConnectionPool, ConnectionProvider, MysqlProvider, SessionPriming,
};
use crate::consistency::{resolve_auto, ConsistencyController};
use crate::error::{QuarryError, Result};
use crate::metadata::Metadata;
use crate::queue::TaskQueue;
use crate::safepoint::{snapshot_to_safe_point, Coordinator, SafePointKeeper};
use crate::server::{detect_server_info, ServerInfo, ServerKind};
use crate::storage::{ExternalStorage, LocalStorage};
use crate::task::{ChunkSource, Task, TableMeta};
use crate::worker::{ProgressTracker, RebuildHandle, Worker};
use crate::writer::{SqlWriter, Writer};

/// Comment block at the top of every data artifact
const LEADING_COMMENTS: &str = "/*!40101 SET NAMES binary*/;\n";

/// Handles pre-computed per table for servers whose region catalog is
/// better read in one sweep
type RegionOverrides = HashMap<(String, String), Vec<String>>;

pub struct Dumper {
    config: Arc<Config>,
    token: CancellationToken,
    storage: Arc<dyn ExternalStorage>,
    writer: Arc<dyn Writer>,
    pool: Arc<ConnectionPool>,
    server: ServerInfo,
    consistency_mode: Consistency,
    snapshot: Option<String>,
    metadata: Arc<AsyncMutex<Metadata>>,
    tables: Option<DatabaseTables>,
    keeper: Option<tokio::task::JoinHandle<()>>,
}

impl Dumper {
    /// Build a dumper against a real server and a local output directory
    pub async fn new(config: Config) -> Result<Self> {
        let storage: Arc<dyn ExternalStorage> =
            Arc::new(LocalStorage::new(config.output_dir.clone())?);
        let provider: Arc<dyn ConnectionProvider> = Arc::new(MysqlProvider::new(&config));
        let writer: Arc<dyn Writer> = Arc::new(SqlWriter::new(storage.clone()));
        Self::with_components(config, provider, storage, writer, None).await
    }

    /// Build a dumper from explicit collaborators. This is the seam for
    /// embedding applications (custom stores, writers, a real coordinator
    /// client) and for tests.
    pub async fn with_components(
        config: Config,
        provider: Arc<dyn ConnectionProvider>,
        storage: Arc<dyn ExternalStorage>,
        writer: Arc<dyn Writer>,
        coordinator: Option<Arc<dyn Coordinator>>,
    ) -> Result<Self> {
        config.validate()?;

        // Open the SQL handle and probe the server
        let mut conn = provider.connect().await?;
        let server = detect_server_info(conn.as_mut()).await?;
        let consistency_mode = resolve_auto(config.consistency, &server);
        info!(
            "server {} {:?}, consistency {}",
            server.kind.as_str(),
            server.version,
            consistency_mode.as_str()
        );

        // The coordinator is only useful on a server that honors service
        // safepoints
        let coordinator = coordinator.filter(|_| server.supports_gc_safepoint());

        // Acquire a snapshot when one is needed and none was given
        let mut snapshot =
            (!config.snapshot.is_empty()).then(|| config.snapshot.clone());
        if server.kind == ServerKind::Tidb
            && snapshot.is_none()
            && (consistency_mode == Consistency::Snapshot || coordinator.is_some())
        {
            snapshot = acquire_snapshot(conn.as_mut()).await?;
        }
        drop(conn);

        let token = CancellationToken::new();

        // Keep the snapshot's history alive for the whole dump
        let keeper = match (&coordinator, &snapshot) {
            (Some(coordinator), Some(snapshot)) => match snapshot_to_safe_point(snapshot) {
                Some(safe_point) => {
                    let keeper = SafePointKeeper::new(
                        coordinator.clone(),
                        safe_point,
                        token.child_token(),
                    );
                    info!("safepoint keeper {} started", keeper.service_id());
                    Some(keeper.spawn())
                }
                None => {
                    warn!("snapshot {:?} is not a timestamp, GC safepoint not kept", snapshot);
                    None
                }
            },
            _ => None,
        };

        // Freeze the session priming every pooled connection receives
        let priming = SessionPriming {
            snapshot: if server.kind == ServerKind::Tidb && server.has_distributed_storage {
                snapshot.clone()
            } else {
                None
            },
            session_params: config.session_params.clone(),
            mem_quota: config.tidb_mem_quota_query,
            consistent_snapshot_txn: config.transactional_consistency
                && matches!(consistency_mode, Consistency::Flush | Consistency::Lock),
        };
        let pool = Arc::new(ConnectionPool::new(provider, priming));
        let metadata = Arc::new(AsyncMutex::new(Metadata::new(
            server.clone(),
            snapshot.clone(),
        )));

        Ok(Self {
            config: Arc::new(config),
            token,
            storage,
            writer,
            pool,
            server,
            consistency_mode,
            snapshot,
            metadata,
            tables: None,
            keeper,
        })
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    pub fn consistency_mode(&self) -> Consistency {
        self.consistency_mode
    }

    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    /// Execute the full dump; blocks until completion or cancellation
    pub async fn dump(&mut self) -> Result<()> {
        let started = Instant::now();

        // `lock` needs the table list before setup to build its statement
        if self.consistency_mode == Consistency::Lock && self.config.sql.is_empty() {
            let mut conn = self.pool.plain_connection().await?;
            self.prepare_table_list(conn.as_mut()).await?;
        }

        let mut controller =
            ConsistencyController::new(self.consistency_mode, self.tables.as_ref())?;
        controller.setup(&self.pool).await?;
        let controller = Arc::new(AsyncMutex::new(controller));

        let result = self.run_phases(controller.clone()).await;

        // Teardown runs on every exit path; it is idempotent, so an early
        // release under transactional consistency is fine.
        let teardown = controller.lock().await.teardown().await;
        let result = match (result, teardown) {
            (Ok(()), Err(e)) => Err(e),
            (result, Err(e)) => {
                error!("consistency teardown failed: {}", e);
                result
            }
            (result, Ok(())) => result,
        };

        result?;

        // The metadata artifact marks a successful dump; failing to write
        // it is logged, not fatal.
        {
            let mut metadata = self.metadata.lock().await;
            metadata.record_finish();
            if let Err(e) = metadata.write_to(self.storage.as_ref()).await {
                info!("metadata artifact not written: {}", e);
            }
        }
        info!("dump finished in {:.1?}", started.elapsed());
        Ok(())
    }

    /// Cancel the shared context and release background resources
    pub async fn close(&mut self) -> Result<()> {
        self.token.cancel();
        if let Some(keeper) = self.keeper.take() {
            let _ = keeper.await;
        }
        Ok(())
    }

    async fn run_phases(&mut self, controller: Arc<AsyncMutex<ConsistencyController>>) -> Result<()> {
        // Metadata connection and initial position
        let mut meta_conn = self.pool.plain_connection().await?;
        if let Err(e) = self
            .metadata
            .lock()
            .await
            .record_start_position(meta_conn.as_mut())
            .await
        {
            info!("initial position not recorded: {}", e);
        }

        // Producer connection: catalog reads and chunk planning happen
        // inside the consistency regime
        let mut producer_conn = self.pool.connection_with_consistency().await?;
        if self.config.sql.is_empty() {
            self.prepare_table_list(producer_conn.as_mut()).await?;
        }

        let overrides = self.compute_region_overrides(producer_conn.as_mut()).await?;

        // Queue and workers
        let queue = TaskQueue::new();
        let progress = Arc::new(ProgressTracker::new());
        let rebuild = Arc::new(RebuildHandle {
            controller: controller.clone(),
            pool: self.pool.clone(),
            metadata: self.metadata.clone(),
            mode: self.consistency_mode,
            transactional_only: self.config.transactional_consistency,
            pos_after_connect: self.config.pos_after_connect,
        });
        // The dump-scoped token: a failing worker cancels it so its
        // siblings and a producer blocked on the full queue return
        // promptly. Canceling it does not touch the root token, so the
        // safepoint keeper survives until `close`.
        let dump_token = self.token.child_token();
        let mut join_set = JoinSet::new();
        for id in 0..self.config.threads {
            let conn = self.pool.connection_with_consistency().await?;
            let worker = Worker::new(
                id,
                conn,
                self.writer.clone(),
                rebuild.clone(),
                dump_token.clone(),
                progress.clone(),
            );
            let rx = queue.receiver();
            let failure_token = dump_token.clone();
            join_set.spawn(async move {
                let result = worker.run(rx).await;
                if result.is_err() {
                    failure_token.cancel();
                }
                result
            });
        }

        // Every worker connection now holds its transaction; under
        // transactional consistency the global/table locks can go.
        if self.config.transactional_consistency
            && matches!(
                self.consistency_mode,
                Consistency::Flush | Consistency::Lock
            )
        {
            controller.lock().await.teardown().await?;
        }

        if self.config.pos_after_connect {
            if let Err(e) = self
                .metadata
                .lock()
                .await
                .record_position_after_connect(meta_conn.as_mut())
                .await
            {
                info!("position after connect not recorded: {}", e);
            }
        }

        // Produce all tasks, then close the queue exactly once. A chunker
        // failure stops production; the workers still drain what was
        // enqueued before the error surfaces.
        let produced = self
            .produce_tasks(
                producer_conn.as_mut(),
                &queue,
                &dump_token,
                &overrides,
                progress.as_ref(),
            )
            .await;
        queue.close();

        let produce_error = produced.err();
        let mut worker_error = None;
        while let Some(joined) = join_set.join_next().await {
            let worker_result = match joined {
                Ok(result) => result,
                Err(e) => Err(QuarryError::Internal(format!("worker panicked: {}", e))),
            };
            if let Err(e) = worker_result {
                if worker_error.is_none() {
                    worker_error = Some(e);
                }
            }
        }

        match (produce_error, worker_error) {
            // Production stopped because a worker failed; the worker error
            // is the real cause
            (Some(QuarryError::Canceled), Some(e)) => Err(e),
            (Some(e), _) => Err(e),
            (None, Some(e)) => Err(e),
            (None, None) => {
                debug!(
                    "{} tasks across {} tables completed",
                    progress.finished_tasks(),
                    progress.finished_tables()
                );
                Ok(())
            }
        }
    }

    /// Enumerate databases and tables once; calling it again is a no-op so
    /// the `lock` pre-pass and the regular pass cannot double-enumerate.
    async fn prepare_table_list(&mut self, conn: &mut dyn Connection) -> Result<()> {
        if self.tables.is_some() {
            return Ok(());
        }
        self.tables = Some(catalog::list_tables(conn, &self.config).await?);
        Ok(())
    }

    /// Older TiDB versions without `TABLESAMPLE` read the whole region
    /// catalog in one sweep instead of querying per table.
    async fn compute_region_overrides(
        &self,
        conn: &mut dyn Connection,
    ) -> Result<RegionOverrides> {
        let mut overrides = RegionOverrides::new();
        if self.config.rows.is_none()
            || self.config.no_data
            || !self.config.sql.is_empty()
            || !self.server.supports_region_decoding()
            || self.server.supports_table_sampling()
        {
            return Ok(overrides);
        }
        let Some(tables) = &self.tables else {
            return Ok(overrides);
        };

        let sql = "SELECT db_name, table_name, START_KEY, tidb_decode_key(START_KEY) \
                   FROM information_schema.tikv_region_status WHERE is_index = 0 \
                   ORDER BY db_name, table_name, start_key";
        let result = match conn.query(sql).await {
            Ok(result) => result,
            Err(e) => {
                warn!("region catalog sweep failed: {}, falling back to per-table queries", e);
                return Ok(overrides);
            }
        };

        let mut current: Option<(String, String)> = None;
        for row in &result.rows {
            let (db, table) = match (row.first(), row.get(1)) {
                (Some(Some(db)), Some(Some(table))) => (db.clone(), table.clone()),
                _ => continue,
            };
            let selected = tables
                .get(&db)
                .map(|infos| {
                    infos
                        .iter()
                        .any(|t| t.name == table && t.kind == TableKind::Base)
                })
                .unwrap_or(false);
            if !selected {
                continue;
            }
            let key = (db, table);
            if current.as_ref() != Some(&key) {
                // First region of a table: its start key belongs to the
                // neighbor, drop it
                current = Some(key.clone());
                overrides.entry(key).or_default();
                continue;
            }
            let decoded = row.get(3).and_then(|v| v.as_deref()).unwrap_or_default();
            if let Some(handle) = region::extract_row_id(decoded) {
                if let Some(handles) = overrides.get_mut(&key) {
                    handles.push(handle.to_string());
                }
            }
        }
        debug!("pre-computed region handles for {} tables", overrides.len());
        Ok(overrides)
    }

    /// Run the chunkers (or the single raw-SQL task) and feed the queue
    async fn produce_tasks(
        &self,
        conn: &mut dyn Connection,
        queue: &TaskQueue,
        token: &CancellationToken,
        overrides: &RegionOverrides,
        progress: &ProgressTracker,
    ) -> Result<()> {
        if !self.config.sql.is_empty() {
            return self.produce_raw_sql_task(queue, token).await;
        }
        let Some(tables) = &self.tables else {
            return Err(QuarryError::Internal("tables not enumerated".into()));
        };
        let planner = ChunkPlanner::new(&self.config, &self.server);

        for (database, infos) in tables {
            if !self.config.no_schemas {
                let create_sql = catalog::show_create_database(conn, database).await?;
                queue
                    .push_unless_canceled(
                        Task::DatabaseMeta {
                            database: database.clone(),
                            create_sql,
                        },
                        token,
                    )
                    .await?;
            }
            for info in infos {
                match info.kind {
                    TableKind::View => {
                        if self.config.no_schemas {
                            continue;
                        }
                        let (create_table_sql, create_view_sql) =
                            catalog::show_create_view(conn, database, &info.name).await?;
                        queue
                            .push_unless_canceled(
                                Task::ViewMeta {
                                    database: database.clone(),
                                    view: info.name.clone(),
                                    create_table_sql,
                                    create_view_sql,
                                },
                                token,
                            )
                            .await?;
                    }
                    TableKind::Base => {
                        self.produce_table_tasks(
                            conn,
                            queue,
                            token,
                            &planner,
                            database,
                            &info.name,
                            overrides,
                            progress,
                        )
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn produce_table_tasks(
        &self,
        conn: &mut dyn Connection,
        queue: &TaskQueue,
        token: &CancellationToken,
        planner: &ChunkPlanner<'_>,
        database: &str,
        table: &str,
        overrides: &RegionOverrides,
        progress: &ProgressTracker,
    ) -> Result<()> {
        let columns = catalog::table_columns(conn, database, table).await?;
        let select_fields = catalog::build_select_fields(&columns, self.config.complete_insert);
        let create_table_ddl = if self.config.no_schemas {
            None
        } else {
            Some(catalog::show_create_table(conn, database, table).await?)
        };

        if let Some(create_sql) = &create_table_ddl {
            queue
                .push_unless_canceled(
                    Task::TableMeta {
                        database: database.to_string(),
                        table: table.to_string(),
                        create_sql: create_sql.clone(),
                    },
                    token,
                )
                .await?;
        }
        if self.config.no_data {
            return Ok(());
        }

        let meta = Arc::new(TableMeta {
            database: database.to_string(),
            table: table.to_string(),
            columns: columns.into_iter().map(|(c, _)| c).collect(),
            select_fields,
            create_table_ddl,
            create_view_ddl: None,
            leading_comments: LEADING_COMMENTS.to_string(),
        });

        let table_overrides = overrides
            .get(&(database.to_string(), table.to_string()))
            .map(|handles| handles.as_slice());
        let sources = planner.plan(conn, &meta, table_overrides).await?;
        let total_chunks = sources.len();
        progress.register_table(database, table, total_chunks);
        debug!(
            "`{}`.`{}` planned as {} chunks",
            database, table, total_chunks
        );
        for (chunk_index, source) in sources.into_iter().enumerate() {
            queue
                .push_unless_canceled(
                    Task::TableData {
                        meta: meta.clone(),
                        source,
                        chunk_index,
                        total_chunks,
                    },
                    token,
                )
                .await?;
        }
        Ok(())
    }

    /// Raw SQL mode: one data task wrapping the operator's statement, no
    /// enumeration and no schema tasks.
    async fn produce_raw_sql_task(&self, queue: &TaskQueue, token: &CancellationToken) -> Result<()> {
        let meta = Arc::new(TableMeta {
            database: String::new(),
            table: "result".to_string(),
            columns: Vec::new(),
            select_fields: String::new(),
            create_table_ddl: None,
            create_view_ddl: None,
            leading_comments: LEADING_COMMENTS.to_string(),
        });
        queue
            .push_unless_canceled(
                Task::TableData {
                    meta,
                    source: ChunkSource::SingleQuery {
                        sql: self.config.sql.clone(),
                        column_count: 0,
                        is_raw: true,
                    },
                    chunk_index: 0,
                    total_chunks: 1,
                },
                token,
            )
            .await
    }
}

/// The server position doubles as the snapshot handle on TiDB
async fn acquire_snapshot(conn: &mut dyn Connection) -> Result<Option<String>> {
    let result = conn.query("SHOW MASTER STATUS").await?;
    Ok(result.value(0, "Position").map(str::to_string))
}
