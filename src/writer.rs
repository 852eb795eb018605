//! Writers consume tasks and produce artifacts
//!
//! The default `SqlWriter` renders mysqldump-style SQL text: one artifact
//! per schema task and one per data chunk. Artifact naming follows the
//! `{database}.{table}.{chunk}.sql` convention so chunks of the same table
//! sort together.

use std::sync::Arc;

use async_trait::async_trait;

use crate::conn::ResultSet;
use crate::error::Result;
use crate::sql::{escape_string, is_numeric_type, quote_ident};
use crate::storage::ExternalStorage;
use crate::task::TableMeta;

/// Consumer side of the task queue. Implementations must be shareable
/// across workers; the default writer is stateless per call.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write_database_meta(&self, database: &str, create_sql: &str) -> Result<()>;
    async fn write_table_meta(&self, database: &str, table: &str, create_sql: &str) -> Result<()>;
    async fn write_view_meta(
        &self,
        database: &str,
        view: &str,
        create_table_sql: &str,
        create_view_sql: &str,
    ) -> Result<()>;
    async fn write_table_data(
        &self,
        meta: &TableMeta,
        rows: &ResultSet,
        chunk_index: usize,
        total_chunks: usize,
    ) -> Result<()>;
}

/// Renders SQL-text artifacts into the external store
pub struct SqlWriter {
    storage: Arc<dyn ExternalStorage>,
    /// Rows per INSERT statement in data artifacts
    insert_batch: usize,
}

impl SqlWriter {
    pub fn new(storage: Arc<dyn ExternalStorage>) -> Self {
        Self {
            storage,
            insert_batch: 100,
        }
    }

    fn data_object_name(meta: &TableMeta, chunk_index: usize) -> String {
        if meta.database.is_empty() {
            format!("{}.{}.sql", meta.table, chunk_index)
        } else {
            format!("{}.{}.{}.sql", meta.database, meta.table, chunk_index)
        }
    }

    /// Render one chunk as INSERT statements
    fn render_inserts(&self, meta: &TableMeta, rows: &ResultSet) -> String {
        let mut out = String::new();
        if !meta.leading_comments.is_empty() {
            out.push_str(&meta.leading_comments);
            if !meta.leading_comments.ends_with('\n') {
                out.push('\n');
            }
        }
        if rows.rows.is_empty() {
            return out;
        }

        let insert_head = if meta.select_fields.is_empty() {
            format!("INSERT INTO {} VALUES\n", quote_ident(&meta.table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES\n",
                quote_ident(&meta.table),
                meta.select_fields
            )
        };

        for batch in rows.rows.chunks(self.insert_batch) {
            out.push_str(&insert_head);
            for (i, row) in batch.iter().enumerate() {
                out.push('(');
                for (j, value) in row.iter().enumerate() {
                    if j > 0 {
                        out.push(',');
                    }
                    out.push_str(&render_value(
                        value.as_deref(),
                        rows.columns.get(j).map(|c| c.type_name.as_str()),
                    ));
                }
                out.push(')');
                out.push_str(if i + 1 == batch.len() { ";\n" } else { ",\n" });
            }
        }
        out
    }
}

/// NULL stays NULL, numeric column types go bare, everything else is quoted
fn render_value(value: Option<&str>, type_name: Option<&str>) -> String {
    match value {
        None => "NULL".to_string(),
        Some(v) => {
            if type_name.map(is_numeric_type).unwrap_or(false) {
                v.to_string()
            } else {
                format!("'{}'", escape_string(v))
            }
        }
    }
}

#[async_trait]
impl Writer for SqlWriter {
    async fn write_database_meta(&self, database: &str, create_sql: &str) -> Result<()> {
        let name = format!("{}-schema-create.sql", database);
        let mut body = create_sql.to_string();
        if !body.ends_with(";\n") {
            body.push_str(";\n");
        }
        self.storage.write_object(&name, body.as_bytes()).await
    }

    async fn write_table_meta(&self, database: &str, table: &str, create_sql: &str) -> Result<()> {
        let name = format!("{}.{}-schema.sql", database, table);
        let mut body = create_sql.to_string();
        if !body.ends_with(";\n") {
            body.push_str(";\n");
        }
        self.storage.write_object(&name, body.as_bytes()).await
    }

    async fn write_view_meta(
        &self,
        database: &str,
        view: &str,
        create_table_sql: &str,
        create_view_sql: &str,
    ) -> Result<()> {
        let table_name = format!("{}.{}-schema.sql", database, view);
        self.storage
            .write_object(&table_name, create_table_sql.as_bytes())
            .await?;
        let view_name = format!("{}.{}-schema-view.sql", database, view);
        let mut body = format!("DROP TABLE IF EXISTS {};\n", quote_ident(view));
        body.push_str(create_view_sql);
        if !body.ends_with(";\n") {
            body.push_str(";\n");
        }
        self.storage.write_object(&view_name, body.as_bytes()).await
    }

    async fn write_table_data(
        &self,
        meta: &TableMeta,
        rows: &ResultSet,
        chunk_index: usize,
        _total_chunks: usize,
    ) -> Result<()> {
        let name = Self::data_object_name(meta, chunk_index);
        let body = self.render_inserts(meta, rows);
        self.storage.write_object(&name, body.as_bytes()).await
    }
}
