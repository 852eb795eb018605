//! Tasks handed from the chunker to the workers
//!
//! A `Task` is the unit of work on the queue: schema DDL for a database,
//! table or view, or one data chunk. Data chunks carry a shared `TableMeta`
//! and a `ChunkSource` the worker executes on its own connection.

use std::sync::Arc;

/// A column name plus its `information_schema` data type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
        }
    }
}

/// Everything a worker needs to know about a table to dump its rows
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub database: String,
    pub table: String,
    /// Column descriptors in table order
    pub columns: Vec<ColumnInfo>,
    /// Textual column list for SELECT/INSERT; empty means select all
    pub select_fields: String,
    pub create_table_ddl: Option<String>,
    pub create_view_ddl: Option<String>,
    /// Comment block written at the top of every data artifact
    pub leading_comments: String,
}

impl TableMeta {
    /// Number of columns a chunk query for this table yields
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Columns actually selected: all of them, or the explicit field list
    pub fn selected_column_count(&self) -> usize {
        if self.select_fields.is_empty() {
            self.columns.len()
        } else {
            self.select_fields.split(',').count()
        }
    }
}

/// Where a worker pulls the rows of one chunk from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkSource {
    /// One SELECT producing all rows of this chunk
    SingleQuery {
        sql: String,
        column_count: usize,
        /// Raw SQL mode: the statement came from the operator, not the chunker
        is_raw: bool,
    },
    /// Several SELECTs whose combined output is one logical chunk
    MultiQuery {
        sqls: Vec<String>,
        column_count: usize,
    },
}

impl ChunkSource {
    pub fn column_count(&self) -> usize {
        match self {
            ChunkSource::SingleQuery { column_count, .. } => *column_count,
            ChunkSource::MultiQuery { column_count, .. } => *column_count,
        }
    }
}

/// A unit of work consumed by a dump worker
#[derive(Debug, Clone)]
pub enum Task {
    DatabaseMeta {
        database: String,
        create_sql: String,
    },
    TableMeta {
        database: String,
        table: String,
        create_sql: String,
    },
    ViewMeta {
        database: String,
        view: String,
        create_table_sql: String,
        create_view_sql: String,
    },
    TableData {
        meta: Arc<TableMeta>,
        source: ChunkSource,
        chunk_index: usize,
        total_chunks: usize,
    },
}

impl Task {
    /// Short description used in logs and progress reporting
    pub fn describe(&self) -> String {
        match self {
            Task::DatabaseMeta { database, .. } => format!("schema of database `{}`", database),
            Task::TableMeta { database, table, .. } => {
                format!("schema of `{}`.`{}`", database, table)
            }
            Task::ViewMeta { database, view, .. } => format!("view `{}`.`{}`", database, view),
            Task::TableData {
                meta,
                chunk_index,
                total_chunks,
                ..
            } => format!(
                "data of `{}`.`{}` chunk {}/{}",
                meta.database, meta.table, chunk_index, total_chunks
            ),
        }
    }
}
