//! Numeric range chunking for MySQL/MariaDB (and TiDB without region help)
//!
//! Splits a table on a single integer primary/unique key column into
//! half-open ranges of roughly `rows` rows each. All range arithmetic uses
//! arbitrary-precision integers: an UNSIGNED BIGINT key can exceed the
//! signed 64-bit range, and `max - min` can overflow even when both ends
//! fit.

use log::debug;
use num_bigint::BigInt;
use num_traits::One;

use crate::config::Config;
use crate::conn::Connection;
use crate::error::Result;
use crate::sql::{escape_string, is_integer_type, quote_ident, quote_table};

/// Outcome of range planning for one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePlan {
    /// No usable split column or too few rows: dump as one chunk
    WholeTable,
    /// Table is empty under the filter: no chunks at all
    Empty,
    /// Chunk predicates over the split column, in range order
    Chunks { field: String, wheres: Vec<String> },
}

/// Find a single-column integer primary key, falling back to a
/// single-column integer unique key. Composite keys and non-integer
/// columns disable range chunking.
pub async fn pick_splittable_field(
    conn: &mut dyn Connection,
    database: &str,
    table: &str,
) -> Result<Option<String>> {
    let sql = format!(
        "SELECT COLUMN_NAME, DATA_TYPE, COLUMN_KEY FROM information_schema.columns \
         WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}' ORDER BY ORDINAL_POSITION",
        escape_string(database),
        escape_string(table)
    );
    let result = conn.query(&sql).await?;

    for wanted in ["PRI", "UNI"] {
        let mut matching: Vec<(&str, &str)> = Vec::new();
        for row in &result.rows {
            let name = row.first().and_then(|v| v.as_deref()).unwrap_or_default();
            let type_name = row.get(1).and_then(|v| v.as_deref()).unwrap_or_default();
            let key = row.get(2).and_then(|v| v.as_deref()).unwrap_or_default();
            if key.eq_ignore_ascii_case(wanted) {
                matching.push((name, type_name));
            }
        }
        if matching.len() == 1 && is_integer_type(matching[0].1) {
            return Ok(Some(matching[0].0.to_string()));
        }
        if !matching.is_empty() {
            // A composite or non-integer key: splitting on part of it would
            // not give disjoint ranges
            return Ok(None);
        }
    }
    Ok(None)
}

/// Plan range chunks for a table with target chunk size `rows`
pub async fn plan(
    conn: &mut dyn Connection,
    config: &Config,
    database: &str,
    table: &str,
    rows: u64,
) -> Result<RangePlan> {
    let field = match pick_splittable_field(conn, database, table).await? {
        Some(field) => field,
        None => {
            debug!(
                "no splittable column on `{}`.`{}`, dumping as one chunk",
                database, table
            );
            return Ok(RangePlan::WholeTable);
        }
    };

    let where_suffix = match &config.where_clause {
        Some(w) => format!(" WHERE {}", w),
        None => String::new(),
    };
    let minmax_sql = format!(
        "SELECT MIN({k}), MAX({k}) FROM {t}{w}",
        k = quote_ident(&field),
        t = quote_table(database, table),
        w = where_suffix
    );
    let minmax = conn.query(&minmax_sql).await?;
    let (min_text, max_text) = match minmax.rows.first() {
        Some(row) => match (row.first(), row.get(1)) {
            (Some(Some(min)), Some(Some(max))) => (min.clone(), max.clone()),
            _ => return Ok(RangePlan::Empty),
        },
        None => return Ok(RangePlan::Empty),
    };
    let (min_v, max_v) = match (min_text.parse::<BigInt>(), max_text.parse::<BigInt>()) {
        (Ok(min_v), Ok(max_v)) => (min_v, max_v),
        _ => {
            debug!(
                "non-numeric MIN/MAX on `{}`.`{}`, dumping as one chunk",
                database, table
            );
            return Ok(RangePlan::WholeTable);
        }
    };

    let estimated = estimate_row_count(conn, database, table, config.where_clause.as_deref()).await;
    if estimated < rows {
        debug!(
            "`{}`.`{}` has ~{} rows, below the {} row chunk size",
            database, table, estimated, rows
        );
        return Ok(RangePlan::WholeTable);
    }

    let wheres = build_chunk_wheres(
        &field,
        &min_v,
        &max_v,
        estimated / rows,
        config.where_clause.is_none(),
    );
    Ok(RangePlan::Chunks { field, wheres })
}

/// Chunk predicates from the key range. `include_null` adds the
/// `k IS NULL` disjunct on chunk 0 (only when no user WHERE narrows the
/// rows, otherwise NULL rows may not belong to the result at all).
pub fn build_chunk_wheres(
    field: &str,
    min_v: &BigInt,
    max_v: &BigInt,
    estimated_chunks: u64,
    include_null: bool,
) -> Vec<String> {
    let k = quote_ident(field);
    let estimated_chunks = estimated_chunks.max(1);
    let step = (max_v - min_v) / BigInt::from(estimated_chunks) + BigInt::one();

    let mut wheres = Vec::new();
    let mut cutoff = min_v.clone();
    while cutoff <= *max_v {
        let next = &cutoff + &step;
        let range = format!("{k} >= {cutoff} AND {k} < {next}", k = k);
        if wheres.is_empty() && include_null {
            wheres.push(format!("({} IS NULL) OR ({})", k, range));
        } else {
            wheres.push(range);
        }
        cutoff = next;
    }
    wheres
}

/// Estimated row count from the server's plan. A failed or unparsable
/// EXPLAIN degrades to 0, which routes the table to the single-chunk path.
async fn estimate_row_count(
    conn: &mut dyn Connection,
    database: &str,
    table: &str,
    where_clause: Option<&str>,
) -> u64 {
    let where_suffix = match where_clause {
        Some(w) => format!(" WHERE {}", w),
        None => String::new(),
    };
    let sql = format!(
        "EXPLAIN SELECT * FROM {}{}",
        quote_table(database, table),
        where_suffix
    );
    let result = match conn.query(&sql).await {
        Ok(result) => result,
        Err(e) => {
            debug!("row estimate failed for `{}`.`{}`: {}", database, table, e);
            return 0;
        }
    };
    // MySQL calls the column `rows`, the TiDB engine `estRows`
    for column in ["rows", "estRows"] {
        if let Some(text) = result.value(0, column) {
            if let Ok(n) = text.parse::<f64>() {
                return n as u64;
            }
        }
    }
    0
}
