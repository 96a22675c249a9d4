//! The statements the engine issues against the target.
//!
//! Table and column names are validated against the store's [`Catalog`]
//! (or, for backup tables, against a strict identifier pattern) before they
//! are interpolated; values are always bound as parameters.
//!
//! [`Catalog`]: crate::Catalog

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::schema::TOMBSTONE_TABLE;
use crate::{SqlRow, SqlValue, TableDef, TargetError, TargetRow, TargetStore};

/// SQLite's default bound-parameter limit is far above this.
const DELETE_CHUNK: usize = 500;

/// Check a name that is not in the catalog (backup tables).
pub fn check_identifier(name: &str) -> Result<(), TargetError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .map_or(false, |c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TargetError::InvalidIdentifier(name.to_string()))
    }
}

fn table<'a, S: TargetStore + ?Sized>(store: &'a S, name: &str) -> Result<&'a TableDef, TargetError> {
    store.catalog().table(name)
}

fn decode_uuid(column: &str, value: &SqlValue) -> Result<Uuid, TargetError> {
    value.as_uuid().ok_or_else(|| TargetError::Decode {
        column: column.to_string(),
        value: value.to_string(),
    })
}

/// `SELECT id FROM <table> WHERE source_key = ?`
pub fn find_id_by_source_key<S: TargetStore + ?Sized>(
    store: &S,
    table_name: &str,
    source_key: &str,
) -> Result<Option<Uuid>, TargetError> {
    let table = table(store, table_name)?;
    let sql = format!("SELECT id FROM {} WHERE source_key = ?", table.name);
    match store.query_one(&sql, &[source_key.into()])? {
        Some(row) => {
            let id = row.get("id").cloned().unwrap_or(SqlValue::Null);
            decode_uuid("id", &id).map(Some)
        }
        None => Ok(None),
    }
}

/// `INSERT INTO <table> (id, source_key, ...) VALUES (...) RETURNING id`
pub fn insert_row<S: TargetStore + ?Sized>(
    store: &mut S,
    row: &TargetRow,
) -> Result<Uuid, TargetError> {
    let table = table(store, &row.table)?;
    let mut names = vec!["id", "source_key"];
    for column in &row.columns {
        names.push(table.require_column(&column.name)?.name.as_str());
    }

    let placeholders = vec!["?"; names.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING id",
        table.name,
        names.join(", "),
        placeholders
    );

    let mut params = Vec::with_capacity(names.len());
    params.push(SqlValue::Uuid(row.id));
    params.push(SqlValue::Text(row.source_key.clone()));
    params.extend(row.columns.iter().map(|c| c.value.clone()));

    let returned = store.insert_returning(&sql, &params)?;
    decode_uuid("id", &returned)
}

/// `UPDATE <table> SET <column> = ? WHERE id = ?`
pub fn update_column<S: TargetStore + ?Sized>(
    store: &mut S,
    table_name: &str,
    column: &str,
    id: Uuid,
    value: SqlValue,
) -> Result<usize, TargetError> {
    let table = table(store, table_name)?;
    let column = table.require_column(column)?;
    let sql = format!("UPDATE {} SET {} = ? WHERE id = ?", table.name, column.name);
    store.execute(&sql, &[value, id.into()])
}

/// Like [`update_column`], but only while the column is still `NULL`, so a
/// value written by someone else is never overwritten.
pub fn fill_null_column<S: TargetStore + ?Sized>(
    store: &mut S,
    table_name: &str,
    column: &str,
    id: Uuid,
    value: SqlValue,
) -> Result<usize, TargetError> {
    let table = table(store, table_name)?;
    let column = table.require_column(column)?;
    let sql = format!(
        "UPDATE {} SET {col} = ? WHERE id = ? AND {col} IS NULL",
        table.name,
        col = column.name
    );
    store.execute(&sql, &[value, id.into()])
}

/// `DELETE FROM <table> WHERE <column> IN (...)`, chunked.
pub fn delete_where_in<S: TargetStore + ?Sized>(
    store: &mut S,
    table_name: &str,
    column: &str,
    ids: &[Uuid],
) -> Result<usize, TargetError> {
    let table = table(store, table_name)?;
    let column = table.require_column(column)?.name.clone();
    let table_name = table.name.clone();

    let mut deleted = 0;
    for chunk in ids.chunks(DELETE_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("DELETE FROM {table_name} WHERE {column} IN ({placeholders})");
        let params: Vec<SqlValue> = chunk.iter().map(|id| SqlValue::Uuid(*id)).collect();
        deleted += store.execute(&sql, &params)?;
    }
    Ok(deleted)
}

/// `DELETE FROM <table> WHERE id IN (...)`
pub fn delete_ids<S: TargetStore + ?Sized>(
    store: &mut S,
    table_name: &str,
    ids: &[Uuid],
) -> Result<usize, TargetError> {
    delete_where_in(store, table_name, "id", ids)
}

/// Record that row `removed` of `table_name` was folded into `survivor`.
/// Its source key is read from the row itself, which must still exist.
pub fn insert_tombstone<S: TargetStore + ?Sized>(
    store: &mut S,
    table_name: &str,
    removed: Uuid,
    survivor: Uuid,
    removed_at: DateTime<Utc>,
) -> Result<usize, TargetError> {
    let table = table(store, table_name)?.name.clone();
    let sql = format!(
        "INSERT INTO {TOMBSTONE_TABLE} (id, source_key, table_name, survivor_id, removed_at) \
         SELECT id, source_key, ?, ?, ? FROM {table} WHERE id = ?"
    );
    store.execute(
        &sql,
        &[
            table.into(),
            survivor.into(),
            removed_at.into(),
            removed.into(),
        ],
    )
}

/// The surviving row for a source key removed by duplicate cleanup.
pub fn find_tombstone<S: TargetStore + ?Sized>(
    store: &S,
    table_name: &str,
    source_key: &str,
) -> Result<Option<Uuid>, TargetError> {
    let sql = format!("SELECT survivor_id FROM {TOMBSTONE_TABLE} WHERE table_name = ? AND source_key = ?");
    match store.query_one(&sql, &[table_name.into(), source_key.into()])? {
        Some(row) => {
            let id = row.get("survivor_id").cloned().unwrap_or(SqlValue::Null);
            decode_uuid("survivor_id", &id).map(Some)
        }
        None => Ok(None),
    }
}

/// `CREATE TABLE <backup> AS SELECT * FROM <table>`
pub fn create_backup<S: TargetStore + ?Sized>(
    store: &mut S,
    table_name: &str,
    backup_name: &str,
) -> Result<(), TargetError> {
    let table = table(store, table_name)?.name.clone();
    check_identifier(backup_name)?;
    let sql = format!("CREATE TABLE {backup_name} AS SELECT * FROM {table}");
    store.execute(&sql, &[])?;
    Ok(())
}

/// Row count of a catalog table, or of a backup table.
pub fn count_rows<S: TargetStore + ?Sized>(
    store: &S,
    table_name: &str,
) -> Result<usize, TargetError> {
    if store.catalog().table(table_name).is_err() {
        check_identifier(table_name)?;
    }
    let sql = format!("SELECT COUNT(*) AS n FROM {table_name}");
    let n = store
        .query_one(&sql, &[])?
        .and_then(|row| row.i64("n"))
        .unwrap_or(0);
    Ok(usize::try_from(n).unwrap_or(0))
}

/// `SELECT * FROM <table> WHERE source_key = ?`
pub fn fetch_by_source_key<S: TargetStore + ?Sized>(
    store: &S,
    table_name: &str,
    source_key: &str,
) -> Result<Option<SqlRow>, TargetError> {
    let table = table(store, table_name)?;
    let sql = format!("SELECT * FROM {} WHERE source_key = ?", table.name);
    store.query_one(&sql, &[source_key.into()])
}

/// Source keys of the rows of `table` whose `parent_column` is `parent_id`.
pub fn child_source_keys<S: TargetStore + ?Sized>(
    store: &S,
    table_name: &str,
    parent_column: &str,
    parent_id: Uuid,
) -> Result<BTreeSet<String>, TargetError> {
    let table = table(store, table_name)?;
    let column = table.require_column(parent_column)?;
    let sql = format!(
        "SELECT source_key FROM {} WHERE {} = ?",
        table.name, column.name
    );
    Ok(store
        .query(&sql, &[parent_id.into()])?
        .iter()
        .filter_map(|row| row.text("source_key").map(str::to_string))
        .collect())
}

/// Every `(id, source_key)` of a table.
pub fn source_keys<S: TargetStore + ?Sized>(
    store: &S,
    table_name: &str,
) -> Result<Vec<(Uuid, String)>, TargetError> {
    let table = table(store, table_name)?;
    let sql = format!("SELECT id, source_key FROM {} ORDER BY source_key", table.name);
    store
        .query(&sql, &[])?
        .iter()
        .map(|row| {
            let id = decode_uuid("id", row.get("id").unwrap_or(&SqlValue::Null))?;
            Ok((id, row.text("source_key").unwrap_or_default().to_string()))
        })
        .collect()
}

/// Rows whose foreign key is `NULL` while the companion source-id column
/// is set: `(row id, source id text)`.
pub fn null_references<S: TargetStore + ?Sized>(
    store: &S,
    table_name: &str,
    fk_column: &str,
    source_column: &str,
) -> Result<Vec<(Uuid, String)>, TargetError> {
    let table = table(store, table_name)?;
    let fk = table.require_column(fk_column)?;
    let src = table.require_column(source_column)?;
    let sql = format!(
        "SELECT id, {src} AS source_id FROM {t} WHERE {fk} IS NULL AND {src} IS NOT NULL ORDER BY {src}",
        t = table.name,
        fk = fk.name,
        src = src.name
    );
    store
        .query(&sql, &[])?
        .iter()
        .map(|row| {
            let id = decode_uuid("id", row.get("id").unwrap_or(&SqlValue::Null))?;
            Ok((id, row.text("source_id").unwrap_or_default().to_string()))
        })
        .collect()
}
