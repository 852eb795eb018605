//! Chunker: splits each table into independently dumpable chunks
//!
//! Strategy is chosen once per table from the server capabilities:
//!
//! - chunking disabled -> one chunk per table (on TiDB, region sub-selects
//!   concatenated into one logical chunk to keep region locality)
//! - TiDB with `TABLESAMPLE REGIONS()` -> sampled region keys
//! - TiDB with decodable regions -> region start keys, partition aware
//! - everything else -> integer key ranges sized by an estimated row count
//!
//! Every strategy produces the full chunk list before anything is
//! enqueued, so each emitted task carries the final total.

pub mod range;
pub mod region;

use log::warn;

use crate::config::Config;
use crate::conn::Connection;
use crate::error::Result;
use crate::server::{ServerInfo, ServerKind};
use crate::sql::{build_select_query, combine_where};
use crate::task::{ChunkSource, TableMeta};

use self::range::RangePlan;
use self::region::RegionPlan;

pub struct ChunkPlanner<'a> {
    config: &'a Config,
    server: &'a ServerInfo,
}

impl<'a> ChunkPlanner<'a> {
    pub fn new(config: &'a Config, server: &'a ServerInfo) -> Self {
        Self { config, server }
    }

    /// Plan the data chunks of one table. The returned list is complete:
    /// its length is the table's total chunk count.
    pub async fn plan(
        &self,
        conn: &mut dyn Connection,
        meta: &TableMeta,
        overrides: Option<&[String]>,
    ) -> Result<Vec<ChunkSource>> {
        match self.config.rows {
            None => self.plan_sequential(conn, meta, overrides).await,
            Some(rows) => self.plan_concurrent(conn, meta, rows, overrides).await,
        }
    }

    /// Chunking disabled: one logical chunk per table. On TiDB the chunk is
    /// built as a concatenation of region sub-selects when regions are
    /// known, so the storage layer still serves region-local scans while
    /// the writer produces a single file.
    async fn plan_sequential(
        &self,
        conn: &mut dyn Connection,
        meta: &TableMeta,
        overrides: Option<&[String]>,
    ) -> Result<Vec<ChunkSource>> {
        if self.server.kind == ServerKind::Tidb {
            match self.plan_tidb_regions(conn, meta, overrides).await {
                Ok(Some(sources)) => {
                    let sqls: Vec<String> = sources
                        .iter()
                        .filter_map(|s| match s {
                            ChunkSource::SingleQuery { sql, .. } => Some(sql.clone()),
                            ChunkSource::MultiQuery { .. } => None,
                        })
                        .collect();
                    let counts: Vec<usize> = sources.iter().map(|s| s.column_count()).collect();
                    if sqls.len() > 1 {
                        if counts.windows(2).all(|w| w[0] == w[1]) {
                            return Ok(vec![ChunkSource::MultiQuery {
                                sqls,
                                column_count: counts[0],
                            }]);
                        }
                        warn!(
                            "region sub-chunks of `{}`.`{}` disagree on column count {:?}, \
                             falling back to a whole-table select",
                            meta.database, meta.table, counts
                        );
                    } else if sqls.len() == 1 {
                        return Ok(sources);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "region concat build failed for `{}`.`{}`: {}, \
                         falling back to a whole-table select",
                        meta.database, meta.table, e
                    );
                }
            }
        }
        Ok(vec![self.whole_table_source(meta)])
    }

    /// Chunking enabled: choose a split strategy by server capability
    async fn plan_concurrent(
        &self,
        conn: &mut dyn Connection,
        meta: &TableMeta,
        rows: u64,
        overrides: Option<&[String]>,
    ) -> Result<Vec<ChunkSource>> {
        if self.server.kind == ServerKind::Tidb {
            match self.plan_tidb_regions(conn, meta, overrides).await {
                Ok(Some(sources)) => return Ok(sources),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "region chunking failed for `{}`.`{}`: {}, \
                         falling back to key ranges",
                        meta.database, meta.table, e
                    );
                }
            }
        }
        self.plan_ranges(conn, meta, rows).await
    }

    /// Region-aligned chunks on TiDB; `Ok(None)` means the server offers
    /// neither sampling nor region decoding and the caller should fall back.
    async fn plan_tidb_regions(
        &self,
        conn: &mut dyn Connection,
        meta: &TableMeta,
        overrides: Option<&[String]>,
    ) -> Result<Option<Vec<ChunkSource>>> {
        if self.server.supports_table_sampling() {
            let pk = region::primary_key_columns(conn, &meta.database, &meta.table).await?;
            let wheres = region::sample_plan(conn, &meta.database, &meta.table, &pk).await?;
            if wheres.is_empty() {
                return Ok(Some(vec![self.whole_table_source(meta)]));
            }
            return Ok(Some(self.sources_from_wheres(meta, None, &wheres)));
        }
        if self.server.supports_region_decoding() {
            let pk = region::primary_key_columns(conn, &meta.database, &meta.table).await?;
            let handle_column = region::region_handle_column(&pk)?;
            let plan =
                region::region_plan(conn, &meta.database, &meta.table, &handle_column, overrides)
                    .await?;
            let sources = match plan {
                RegionPlan::Unpartitioned(wheres) => {
                    if wheres.is_empty() {
                        vec![self.whole_table_source(meta)]
                    } else {
                        self.sources_from_wheres(meta, None, &wheres)
                    }
                }
                RegionPlan::Partitioned(parts) => {
                    let mut sources = Vec::new();
                    for (partition, wheres) in &parts {
                        if wheres.is_empty() {
                            sources.push(self.partition_source(meta, partition, None));
                        } else {
                            for clause in wheres {
                                sources.push(self.partition_source(
                                    meta,
                                    partition,
                                    Some(clause.as_str()),
                                ));
                            }
                        }
                    }
                    sources
                }
            };
            return Ok(Some(sources));
        }
        Ok(None)
    }

    /// Integer key range chunks for MySQL/MariaDB (and TiDB fallback)
    async fn plan_ranges(
        &self,
        conn: &mut dyn Connection,
        meta: &TableMeta,
        rows: u64,
    ) -> Result<Vec<ChunkSource>> {
        let plan = range::plan(conn, self.config, &meta.database, &meta.table, rows).await?;
        Ok(match plan {
            RangePlan::WholeTable => vec![self.whole_table_source(meta)],
            RangePlan::Empty => Vec::new(),
            RangePlan::Chunks { wheres, .. } => self.sources_from_wheres(meta, None, &wheres),
        })
    }

    fn sources_from_wheres(
        &self,
        meta: &TableMeta,
        partition: Option<&str>,
        wheres: &[String],
    ) -> Vec<ChunkSource> {
        wheres
            .iter()
            .map(|clause| self.partition_source_opt(meta, partition, Some(clause.as_str())))
            .collect()
    }

    fn partition_source(
        &self,
        meta: &TableMeta,
        partition: &str,
        chunk_where: Option<&str>,
    ) -> ChunkSource {
        self.partition_source_opt(meta, Some(partition), chunk_where)
    }

    fn partition_source_opt(
        &self,
        meta: &TableMeta,
        partition: Option<&str>,
        chunk_where: Option<&str>,
    ) -> ChunkSource {
        let combined = combine_where(self.config.where_clause.as_deref(), chunk_where);
        ChunkSource::SingleQuery {
            sql: build_select_query(
                &meta.database,
                &meta.table,
                &meta.select_fields,
                partition,
                combined.as_deref(),
                None,
            ),
            column_count: meta.selected_column_count(),
            is_raw: false,
        }
    }

    fn whole_table_source(&self, meta: &TableMeta) -> ChunkSource {
        self.partition_source_opt(meta, None, None)
    }
}
