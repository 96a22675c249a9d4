//! Target store trait and its SQLite implementation.

use rusqlite::{params_from_iter, Connection};
use std::path::Path;

use crate::schema::{MIGRATIONS, SCHEMA_VERSION};
use crate::{Catalog, SqlRow, SqlValue, TargetError};

/// Parameterised, transactional access to the relational store.
///
/// Placeholders are positional (`?`). Transactions are explicit; the engine
/// opens one per source document.
pub trait TargetStore {
    fn catalog(&self) -> &Catalog;

    /// Run a statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize, TargetError>;

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, TargetError>;

    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>, TargetError> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Run an `INSERT ... RETURNING <col>` and return that column.
    fn insert_returning(&mut self, sql: &str, params: &[SqlValue])
        -> Result<SqlValue, TargetError>;

    fn begin(&mut self) -> Result<(), TargetError>;
    fn commit(&mut self) -> Result<(), TargetError>;
    fn rollback(&mut self) -> Result<(), TargetError>;
}

#[derive(Debug)]
pub struct SqliteTarget {
    conn: Connection,
    catalog: Catalog,
}

impl SqliteTarget {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TargetError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, TargetError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, TargetError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn,
            catalog: Catalog::builtin()?,
        })
    }

    pub fn schema_version(&self) -> Result<i64, TargetError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Apply the migrations the database has not seen yet. Returns whether
    /// anything was applied.
    pub fn ensure_schema(&mut self) -> Result<bool, TargetError> {
        let current = self.schema_version()?;
        if current >= SCHEMA_VERSION {
            return Ok(false);
        }
        for (version, ddl) in (1..).zip(MIGRATIONS.iter()) {
            if version <= current {
                continue;
            }
            self.conn.execute_batch(ddl)?;
            self.conn
                .execute_batch(&format!("PRAGMA user_version = {version};"))?;
            tracing::info!(version, "target schema migrated");
        }
        Ok(true)
    }
}

impl TargetStore for SqliteTarget {
    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize, TargetError> {
        Ok(self.conn.execute(sql, params_from_iter(params.iter()))?)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, TargetError> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let values = (0..columns.len())
                .map(|i| row.get_ref(i).map(SqlValue::from))
                .collect::<Result<Vec<_>, _>>()?;
            out.push(SqlRow::new(columns.clone(), values));
        }
        Ok(out)
    }

    fn insert_returning(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<SqlValue, TargetError> {
        Ok(self
            .conn
            .query_row(sql, params_from_iter(params.iter()), |row| {
                row.get_ref(0).map(SqlValue::from)
            })?)
    }

    fn begin(&mut self) -> Result<(), TargetError> {
        Ok(self.conn.execute_batch("BEGIN")?)
    }

    fn commit(&mut self) -> Result<(), TargetError> {
        Ok(self.conn.execute_batch("COMMIT")?)
    }

    fn rollback(&mut self) -> Result<(), TargetError> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        Ok(self.conn.execute_batch("ROLLBACK")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SqliteTarget {
        let mut t = SqliteTarget::open_in_memory().unwrap();
        assert!(t.ensure_schema().unwrap());
        t
    }

    fn insert_user(t: &mut SqliteTarget, id: &str, key: &str) -> Result<usize, TargetError> {
        t.execute(
            "INSERT INTO users (id, source_key, is_active) VALUES (?, ?, ?)",
            &[id.into(), key.into(), SqlValue::Bool(true)],
        )
    }

    #[test]
    fn test_ensure_schema_is_idempotent() {
        let mut t = target();
        assert!(!t.ensure_schema().unwrap());
        assert_eq!(t.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_older_database_gets_only_newer_migrations() {
        let mut t = SqliteTarget::open_in_memory().unwrap();
        t.conn.execute_batch(MIGRATIONS[0]).unwrap();
        t.conn.execute_batch("PRAGMA user_version = 1;").unwrap();
        insert_user(&mut t, "u1", "k1").unwrap();

        assert!(t.ensure_schema().unwrap());
        assert_eq!(t.schema_version().unwrap(), SCHEMA_VERSION);
        assert_eq!(t.query("SELECT id FROM users", &[]).unwrap().len(), 1);
        assert!(t.query("SELECT id FROM dedup_tombstones", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_source_key_is_a_record_level_error() {
        let mut t = target();
        insert_user(&mut t, "u1", "k1").unwrap();
        let err = insert_user(&mut t, "u2", "k1").unwrap_err();
        assert!(err.is_record_level(), "{err}");
    }

    #[test]
    fn test_foreign_keys_are_enforced() {
        let mut t = target();
        let err = t
            .execute(
                "INSERT INTO courses_sessions (id, source_key, course_id) VALUES (?, ?, ?)",
                &["s1".into(), "s1".into(), "no-such-course".into()],
            )
            .unwrap_err();
        assert!(matches!(err, TargetError::Constraint(_)));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let mut t = target();
        t.begin().unwrap();
        insert_user(&mut t, "u1", "k1").unwrap();
        t.rollback().unwrap();
        let rows = t.query("SELECT id FROM users", &[]).unwrap();
        assert!(rows.is_empty());
        // No open transaction: a second rollback is a no-op.
        t.rollback().unwrap();
    }

    #[test]
    fn test_insert_returning() {
        let mut t = target();
        let id = t
            .insert_returning(
                "INSERT INTO users (id, source_key, is_active) VALUES (?, ?, 1) RETURNING id",
                &["u1".into(), "k1".into()],
            )
            .unwrap();
        assert_eq!(id, SqlValue::Text("u1".into()));
        let row = t
            .query_one("SELECT is_active FROM users WHERE id = ?", &["u1".into()])
            .unwrap()
            .unwrap();
        assert_eq!(row.bool("is_active"), Some(true));
    }
}
