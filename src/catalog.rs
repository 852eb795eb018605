//! Catalog enumerator
//!
//! Lists databases, tables and views after applying the configured filters,
//! and captures the DDL the schema tasks carry. Enumeration runs on a
//! consistency-primed connection so the catalog matches the data snapshot.

use std::collections::BTreeMap;

use log::debug;

use crate::config::Config;
use crate::conn::Connection;
use crate::error::{QuarryError, Result};
use crate::sql::{quote_ident, quote_table};
use crate::task::ColumnInfo;

/// Schemas that are never dumped
pub const SYSTEM_SCHEMAS: &[&str] = &[
    "information_schema",
    "performance_schema",
    "mysql",
    "sys",
    "metrics_schema",
    "inspection_schema",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Base,
    View,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub database: String,
    pub name: String,
    pub kind: TableKind,
}

/// Database name to its tables, in stable order per database
pub type DatabaseTables = BTreeMap<String, Vec<TableInfo>>;

fn is_system_schema(name: &str) -> bool {
    SYSTEM_SCHEMAS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(name))
}

/// Databases selected by the configuration: the explicit list, or every
/// non-system database on the server.
pub async fn list_databases(conn: &mut dyn Connection, config: &Config) -> Result<Vec<String>> {
    if !config.databases.is_empty() {
        return Ok(config.databases.clone());
    }
    let result = conn.query("SHOW DATABASES").await?;
    let mut names = Vec::new();
    for row in &result.rows {
        if let Some(Some(name)) = row.first() {
            if !is_system_schema(name) {
                names.push(name.clone());
            }
        }
    }
    Ok(names)
}

/// Enumerate base tables (and views unless disabled) in the selected
/// databases with one `information_schema` sweep.
pub async fn list_tables(
    conn: &mut dyn Connection,
    config: &Config,
) -> Result<DatabaseTables> {
    let databases = list_databases(conn, config).await?;
    let mut selected: DatabaseTables = BTreeMap::new();
    for db in &databases {
        selected.insert(db.clone(), Vec::new());
    }

    let sql = "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE FROM information_schema.tables \
               ORDER BY TABLE_SCHEMA, TABLE_NAME";
    let result = conn.query(sql).await?;
    for row in &result.rows {
        let (schema, name, kind) = match (row.first(), row.get(1), row.get(2)) {
            (Some(Some(s)), Some(Some(n)), Some(Some(k))) => (s, n, k),
            _ => continue,
        };
        let Some(tables) = selected.get_mut(schema) else {
            continue;
        };
        let kind = if kind.eq_ignore_ascii_case("VIEW") {
            if config.no_views {
                continue;
            }
            TableKind::View
        } else {
            TableKind::Base
        };
        tables.push(TableInfo {
            database: schema.clone(),
            name: name.clone(),
            kind,
        });
    }

    let total: usize = selected.values().map(|t| t.len()).sum();
    debug!(
        "enumerated {} tables across {} databases",
        total,
        selected.len()
    );
    Ok(selected)
}

/// `SHOW CREATE DATABASE`, second column
pub async fn show_create_database(conn: &mut dyn Connection, database: &str) -> Result<String> {
    let sql = format!(
        "SHOW CREATE DATABASE IF NOT EXISTS {}",
        quote_ident(database)
    );
    let result = conn.query(&sql).await?;
    result
        .rows
        .first()
        .and_then(|row| row.get(1))
        .and_then(|v| v.clone())
        .ok_or_else(|| {
            QuarryError::Sql(format!("empty SHOW CREATE DATABASE result for `{}`", database))
        })
}

/// `SHOW CREATE TABLE`, second column
pub async fn show_create_table(
    conn: &mut dyn Connection,
    database: &str,
    table: &str,
) -> Result<String> {
    let sql = format!("SHOW CREATE TABLE {}", quote_table(database, table));
    let result = conn.query(&sql).await?;
    result
        .rows
        .first()
        .and_then(|row| row.get(1))
        .and_then(|v| v.clone())
        .ok_or_else(|| {
            QuarryError::Sql(format!(
                "empty SHOW CREATE TABLE result for `{}`.`{}`",
                database, table
            ))
        })
}

/// The view DDL plus a placeholder table DDL. Downstream loaders create the
/// placeholder first so views referencing each other restore in any order,
/// then replace it with the real view.
pub async fn show_create_view(
    conn: &mut dyn Connection,
    database: &str,
    view: &str,
) -> Result<(String, String)> {
    let fields_sql = format!("SHOW FIELDS FROM {}", quote_table(database, view));
    let fields = conn.query(&fields_sql).await?;
    let mut placeholder = format!("CREATE TABLE {} (", quote_ident(view));
    let mut first = true;
    for row in &fields.rows {
        if let Some(Some(name)) = row.first() {
            if !first {
                placeholder.push(',');
            }
            placeholder.push_str(&format!("{} int", quote_ident(name)));
            first = false;
        }
    }
    placeholder.push_str(");");

    let view_sql = format!("SHOW CREATE VIEW {}", quote_table(database, view));
    let result = conn.query(&view_sql).await?;
    let create_view = result
        .rows
        .first()
        .and_then(|row| row.get(1))
        .and_then(|v| v.clone())
        .ok_or_else(|| {
            QuarryError::Sql(format!(
                "empty SHOW CREATE VIEW result for `{}`.`{}`",
                database, view
            ))
        })?;
    Ok((placeholder, create_view))
}

/// Column descriptors of a table, in table order, with the EXTRA flags that
/// mark generated columns.
pub async fn table_columns(
    conn: &mut dyn Connection,
    database: &str,
    table: &str,
) -> Result<Vec<(ColumnInfo, bool)>> {
    let sql = format!(
        "SELECT COLUMN_NAME, DATA_TYPE, EXTRA FROM information_schema.columns \
         WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}' ORDER BY ORDINAL_POSITION",
        crate::sql::escape_string(database),
        crate::sql::escape_string(table)
    );
    let result = conn.query(&sql).await?;
    let mut columns = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let name = row.first().and_then(|v| v.as_deref()).unwrap_or_default();
        let type_name = row.get(1).and_then(|v| v.as_deref()).unwrap_or_default();
        let extra = row.get(2).and_then(|v| v.as_deref()).unwrap_or_default();
        let generated = extra.to_ascii_uppercase().contains("GENERATED");
        columns.push((ColumnInfo::new(name, type_name), generated));
    }
    Ok(columns)
}

/// Build the textual select-field list for a table. Returns the empty
/// string ("select all") unless an explicit list is needed: either the
/// operator asked for complete INSERTs or the table has generated columns
/// that must be excluded.
pub fn build_select_fields(columns: &[(ColumnInfo, bool)], complete_insert: bool) -> String {
    let has_generated = columns.iter().any(|(_, generated)| *generated);
    if !complete_insert && !has_generated {
        return String::new();
    }
    columns
        .iter()
        .filter(|(_, generated)| !generated)
        .map(|(c, _)| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(",")
}
