//! Region-aligned chunking for the distributed SQL engine
//!
//! On TiDB the natural chunk boundaries are region boundaries: each region
//! is a contiguous key range, so chunks cut at region starts give every
//! worker a scan the storage layer can serve locally.
//!
//! Two ways to learn the boundaries, picked by server version:
//! - `TABLESAMPLE REGIONS()` (5.0+) returns one key tuple per region.
//! - Decoding `TIKV_REGION_STATUS` start keys (3.0+), which only works for
//!   integer row keys.

use log::debug;

use crate::conn::Connection;
use crate::error::{QuarryError, Result};
use crate::sql::{escape_string, is_integer_type, is_numeric_type, quote_ident, quote_table};
use crate::task::ColumnInfo;

/// The implicit row id column used when a table has no explicit primary key
pub const IMPLICIT_ROW_ID: &str = "_tidb_rowid";

/// Region boundaries of one table, ready to become chunk predicates
#[derive(Debug, Clone)]
pub enum RegionPlan {
    /// Predicates over the handle column, in key order
    Unpartitioned(Vec<String>),
    /// Per-partition predicates; chunk indices run across partitions
    Partitioned(Vec<(String, Vec<String>)>),
}

/// Primary key columns of a table, in index order. Empty means the table
/// uses the implicit row id.
pub async fn primary_key_columns(
    conn: &mut dyn Connection,
    database: &str,
    table: &str,
) -> Result<Vec<ColumnInfo>> {
    let sql = format!(
        "SELECT COLUMN_NAME, DATA_TYPE FROM information_schema.columns \
         WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}' AND COLUMN_KEY = 'PRI' \
         ORDER BY ORDINAL_POSITION",
        escape_string(database),
        escape_string(table)
    );
    let result = conn.query(&sql).await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| {
            let name = row.first()?.as_deref()?;
            let type_name = row.get(1)?.as_deref()?;
            Some(ColumnInfo::new(name, type_name))
        })
        .collect())
}

/// The handle column for region decoding: the single integer primary key
/// column, or the implicit row id. Composite and non-integer keys cannot be
/// recovered from decoded region keys.
pub fn region_handle_column(pk: &[ColumnInfo]) -> Result<ColumnInfo> {
    match pk {
        [] => Ok(ColumnInfo::new(IMPLICIT_ROW_ID, "bigint")),
        [single] if is_integer_type(&single.type_name) => Ok(single.clone()),
        [single] => Err(QuarryError::Chunk(format!(
            "region decoding needs an integer key, `{}` is {}",
            single.name, single.type_name
        ))),
        _ => Err(QuarryError::Chunk(
            "region decoding does not support composite primary keys".into(),
        )),
    }
}

/// Chunk via `TABLESAMPLE REGIONS()`: one sampled key tuple per region.
/// Returns the chunk predicates, or an empty vector for a table whose
/// sample comes back empty (single region, dump as one chunk).
pub async fn sample_plan(
    conn: &mut dyn Connection,
    database: &str,
    table: &str,
    pk: &[ColumnInfo],
) -> Result<Vec<String>> {
    let key_columns: Vec<ColumnInfo> = if pk.is_empty() {
        vec![ColumnInfo::new(IMPLICIT_ROW_ID, "bigint")]
    } else {
        pk.to_vec()
    };
    let field_list = key_columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT {fields} FROM {table} TABLESAMPLE REGIONS() ORDER BY {fields}",
        fields = field_list,
        table = quote_table(database, table)
    );
    let result = conn.query(&sql).await?;

    let handles: Vec<Vec<String>> = result
        .rows
        .iter()
        .filter_map(|row| {
            let tuple: Option<Vec<String>> = row
                .iter()
                .map(|v| v.as_ref().map(|s| s.to_string()))
                .collect();
            tuple
        })
        .collect();
    Ok(tuple_handle_wheres(&key_columns, &handles))
}

/// Predicates delimited by sorted handle tuples: `n` handles make `n + 1`
/// half-open chunks bounded below and above by the sentinels.
pub fn tuple_handle_wheres(columns: &[ColumnInfo], handles: &[Vec<String>]) -> Vec<String> {
    if handles.is_empty() {
        // One region: the whole key space is one chunk
        return Vec::new();
    }
    let key_expr = if columns.len() == 1 {
        quote_ident(&columns[0].name)
    } else {
        format!(
            "({})",
            columns
                .iter()
                .map(|c| quote_ident(&c.name))
                .collect::<Vec<_>>()
                .join(",")
        )
    };
    let render = |tuple: &[String]| -> String {
        let parts: Vec<String> = tuple
            .iter()
            .zip(columns)
            .map(|(v, c)| render_key_value(v, &c.type_name))
            .collect();
        if parts.len() == 1 {
            parts.into_iter().next().unwrap_or_default()
        } else {
            format!("({})", parts.join(","))
        }
    };

    let mut wheres = Vec::with_capacity(handles.len() + 1);
    for i in 0..=handles.len() {
        let clause = match (i.checked_sub(1).map(|p| &handles[p]), handles.get(i)) {
            (None, Some(first)) => format!("{} < {}", key_expr, render(first)),
            (Some(prev), Some(next)) => format!(
                "{k} >= {} AND {k} < {}",
                render(prev),
                render(next),
                k = key_expr
            ),
            (Some(last), None) => format!("{} >= {}", key_expr, render(last)),
            (None, None) => break,
        };
        wheres.push(clause);
    }
    wheres
}

fn render_key_value(value: &str, type_name: &str) -> String {
    if is_numeric_type(type_name) {
        value.to_string()
    } else {
        format!("'{}'", escape_string(value))
    }
}

/// Chunk by decoding region start keys. `overrides` carries handles
/// pre-computed by the orchestrator for server versions whose region
/// catalog is better read in one sweep.
pub async fn region_plan(
    conn: &mut dyn Connection,
    database: &str,
    table: &str,
    handle_column: &ColumnInfo,
    overrides: Option<&[String]>,
) -> Result<RegionPlan> {
    let partitions = partition_names(conn, database, table).await?;
    if partitions.is_empty() {
        let handles = match overrides {
            Some(handles) => handles.to_vec(),
            None => decode_region_handles(conn, database, table).await?,
        };
        return Ok(RegionPlan::Unpartitioned(single_handle_wheres(
            &handle_column.name,
            &handles,
        )));
    }

    let mut per_partition = Vec::with_capacity(partitions.len());
    for partition in partitions {
        let handles = partition_region_handles(conn, database, table, &partition).await?;
        let wheres = single_handle_wheres(&handle_column.name, &handles);
        per_partition.push((partition, wheres));
    }
    Ok(RegionPlan::Partitioned(per_partition))
}

/// Partition names of a table; empty for unpartitioned tables
pub async fn partition_names(
    conn: &mut dyn Connection,
    database: &str,
    table: &str,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT PARTITION_NAME FROM information_schema.partitions \
         WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}'",
        escape_string(database),
        escape_string(table)
    );
    let result = conn.query(&sql).await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| row.first()?.clone())
        .collect())
}

/// Region start handles of an unpartitioned table. The first region's start
/// key belongs to the neighboring table (or is the table's own left
/// sentinel), so it is dropped; every later start key decodes to one handle.
async fn decode_region_handles(
    conn: &mut dyn Connection,
    database: &str,
    table: &str,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT START_KEY, tidb_decode_key(START_KEY) FROM information_schema.tikv_region_status \
         WHERE db_name = '{}' AND table_name = '{}' AND is_index = 0 ORDER BY start_key",
        escape_string(database),
        escape_string(table)
    );
    let result = conn.query(&sql).await?;
    let mut handles = Vec::new();
    for row in result.rows.iter().skip(1) {
        let decoded = row.get(1).and_then(|v| v.as_deref()).unwrap_or_default();
        match extract_row_id(decoded) {
            Some(handle) => handles.push(handle.to_string()),
            None => debug!(
                "skipping undecodable region start key {:?} of `{}`.`{}`",
                decoded, database, table
            ),
        }
    }
    Ok(handles)
}

/// Region start handles of one partition from `SHOW TABLE ... REGIONS`
async fn partition_region_handles(
    conn: &mut dyn Connection,
    database: &str,
    table: &str,
    partition: &str,
) -> Result<Vec<String>> {
    let sql = format!(
        "SHOW TABLE {} PARTITION({}) REGIONS",
        quote_table(database, table),
        quote_ident(partition)
    );
    let result = conn.query(&sql).await?;
    let key_idx = result.column_index("START_KEY").ok_or_else(|| {
        QuarryError::Sql(format!(
            "SHOW TABLE REGIONS returned no START_KEY column for `{}`.`{}`",
            database, table
        ))
    })?;
    let mut handles = Vec::new();
    for row in result.rows.iter().skip(1) {
        let key = row.get(key_idx).and_then(|v| v.as_deref()).unwrap_or_default();
        match strip_row_key_prefix(key) {
            Some(handle) if !handle.is_empty() => handles.push(handle.to_string()),
            _ => debug!(
                "skipping non-row region start key {:?} of partition `{}`",
                key, partition
            ),
        }
    }
    Ok(handles)
}

/// The numeric row id inside a decoded region key, i.e. the digits after
/// the `_tidb_rowid=` marker.
pub fn extract_row_id(decoded: &str) -> Option<&str> {
    let marker = "_tidb_rowid=";
    let start = decoded.find(marker)? + marker.len();
    let rest = &decoded[start..];
    let end = rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '-')
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    if end == 0 {
        None
    } else {
        Some(&rest[..end])
    }
}

/// Strip the row-key prefix of a `SHOW TABLE REGIONS` start key
/// (`t_<id>_r_<handle>` or a bare `r_<handle>`), keeping the handle.
pub fn strip_row_key_prefix(key: &str) -> Option<&str> {
    if let Some(idx) = key.find("_r_") {
        Some(&key[idx + 3..])
    } else {
        key.strip_prefix("r_")
    }
}

/// Single-column predicates from sorted integer handles
pub fn single_handle_wheres(column: &str, handles: &[String]) -> Vec<String> {
    let columns = [ColumnInfo::new(column, "bigint")];
    let tuples: Vec<Vec<String>> = handles.iter().map(|h| vec![h.clone()]).collect();
    tuple_handle_wheres(&columns, &tuples)
}
