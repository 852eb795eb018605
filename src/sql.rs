//! SQL string helpers
//!
//! Identifier quoting and SELECT assembly shared by the catalog enumerator,
//! the chunker and the writer. All identifiers that came from the server or
//! the user go through `quote_ident` before they are embedded in SQL.

/// Quote an identifier with backticks, doubling embedded backticks
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a `db`.`table` pair
pub fn quote_table(database: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(database), quote_ident(table))
}

/// Escape a text value for use inside a single-quoted SQL string literal
pub fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            _ => out.push(c),
        }
    }
    out
}

/// Combine the user WHERE clause and a chunk predicate into one clause.
/// Either part may be absent; both present means `(user) AND (chunk)`.
pub fn combine_where(user: Option<&str>, chunk: Option<&str>) -> Option<String> {
    match (user, chunk) {
        (Some(u), Some(c)) => Some(format!("({}) AND ({})", u, c)),
        (Some(u), None) => Some(u.to_string()),
        (None, Some(c)) => Some(c.to_string()),
        (None, None) => None,
    }
}

/// Build a data SELECT for one chunk of a table.
///
/// `fields` is the textual column list; empty means select all. `partition`
/// restricts the scan to one partition on servers that support the clause.
pub fn build_select_query(
    database: &str,
    table: &str,
    fields: &str,
    partition: Option<&str>,
    where_clause: Option<&str>,
    order_by: Option<&str>,
) -> String {
    let mut sql = String::with_capacity(64);
    sql.push_str("SELECT ");
    if fields.is_empty() {
        sql.push('*');
    } else {
        sql.push_str(fields);
    }
    sql.push_str(" FROM ");
    sql.push_str(&quote_table(database, table));
    if let Some(p) = partition {
        sql.push_str(" PARTITION(");
        sql.push_str(&quote_ident(p));
        sql.push(')');
    }
    if let Some(w) = where_clause {
        sql.push_str(" WHERE ");
        sql.push_str(w);
    }
    if let Some(o) = order_by {
        sql.push_str(" ORDER BY ");
        sql.push_str(o);
    }
    sql
}

/// Column types the chunker can do range arithmetic on
pub fn is_integer_type(type_name: &str) -> bool {
    matches!(
        type_name.to_ascii_lowercase().as_str(),
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint"
    )
}

/// Column types whose values are written unquoted in INSERT statements
pub fn is_numeric_type(type_name: &str) -> bool {
    is_integer_type(type_name)
        || matches!(
            type_name.to_ascii_lowercase().as_str(),
            "float" | "double" | "decimal" | "numeric" | "year" | "bit"
        )
}
