//! Duplicate Reconciler.
//!
//! ```text
//!   identify ──► Identified ──backup──► BackedUp ──delete──► Deleted
//!                                                              │
//!                   Verified ◄──verify── Reaggregated ◄──reaggregate
//! ```
//!
//! Each state is its own type and each step consumes the previous state, so
//! deletion is only reachable through a successful backup. A group is the
//! set of rows sharing `(owner, date, context)`; the most recently created
//! member survives and the rest are deleted by id. Each deleted row leaves
//! a tombstone naming its survivor, so a later re-run of the family does not
//! write it again.

use chrono::{DateTime, Utc};
use docbridge_target::statements::{
    count_rows, create_backup, delete_ids, delete_where_in, insert_tombstone,
};
use docbridge_target::{SqlValue, TargetError, TargetStore};
use serde::Serialize;
use uuid::Uuid;

// ============================================================================
// Dedup specs
// ============================================================================

/// Rows of `table` referencing a deleted row through `column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cascade {
    pub table: String,
    pub column: String,
}

/// A denormalised count: `table.count_column` = number of rows of the
/// deduplicated table whose owner is `table.id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    pub table: String,
    pub count_column: String,
    /// Set to the reconciliation time when the count is recomputed.
    pub touch_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupSpec {
    pub table: String,
    pub owner_column: String,
    pub date_column: String,
    pub context_column: String,
    pub created_column: String,
    pub cascade: Vec<Cascade>,
    pub aggregates: Vec<Aggregate>,
}

impl DedupSpec {
    /// The same absence recorded twice for one student on one day and
    /// session. `student_stats.absences_count` is recounted.
    pub fn student_absences() -> Self {
        Self {
            table: "student_stats_absences".into(),
            owner_column: "student_stats_id".into(),
            date_column: "date".into(),
            context_column: "course_session_id".into(),
            created_column: "created_at".into(),
            cascade: Vec::new(),
            aggregates: vec![Aggregate {
                table: "student_stats".into(),
                count_column: "absences_count".into(),
                touch_column: Some("last_update".into()),
            }],
        }
    }

    /// Grades entered twice for one session, date and grade type. Their
    /// records go with them. Grouped on the source session id, which is set
    /// even while `course_session_id` awaits resolution.
    pub fn grades() -> Self {
        Self {
            table: "grades".into(),
            owner_column: "mongo_session_id".into(),
            date_column: "date".into(),
            context_column: "type".into(),
            created_column: "created_at".into(),
            cascade: vec![Cascade {
                table: "grades_records".into(),
                column: "grade_id".into(),
            }],
            aggregates: Vec::new(),
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "student-absences" | "student_absences" | "absences" => Some(Self::student_absences()),
            "grades" => Some(Self::grades()),
            _ => None,
        }
    }

    /// Every table and column named must exist in the store's catalog.
    pub fn validate<S: TargetStore + ?Sized>(&self, store: &S) -> Result<(), TargetError> {
        let catalog = store.catalog();
        let table = catalog.table(&self.table)?;
        for column in [
            &self.owner_column,
            &self.date_column,
            &self.context_column,
            &self.created_column,
        ] {
            table.require_column(column)?;
        }
        for cascade in &self.cascade {
            catalog.table(&cascade.table)?.require_column(&cascade.column)?;
        }
        for aggregate in &self.aggregates {
            let agg = catalog.table(&aggregate.table)?;
            agg.require_column(&aggregate.count_column)?;
            if let Some(touch) = &aggregate.touch_column {
                agg.require_column(touch)?;
            }
        }
        Ok(())
    }

    /// Tables snapshotted before anything is deleted.
    fn affected_tables(&self) -> Vec<&str> {
        let mut tables = vec![self.table.as_str()];
        tables.extend(self.cascade.iter().map(|c| c.table.as_str()));
        tables.extend(self.aggregates.iter().map(|a| a.table.as_str()));
        tables
    }
}

// ============================================================================
// Results and errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub owner: SqlValue,
    pub date: SqlValue,
    pub context: SqlValue,
    pub keep: Uuid,
    pub remove: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupTable {
    pub table: String,
    pub backup: String,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupReport {
    pub table: String,
    pub dry_run: bool,
    pub groups: Vec<DuplicateGroup>,
    pub backups: Vec<BackupTable>,
    pub deleted: usize,
    pub cascaded: usize,
    pub recomputed: usize,
}

impl DedupReport {
    fn empty(spec: &DedupSpec, dry_run: bool) -> Self {
        Self {
            table: spec.table.clone(),
            dry_run,
            groups: Vec::new(),
            backups: Vec::new(),
            deleted: 0,
            cascaded: 0,
            recomputed: 0,
        }
    }

    pub fn duplicates(&self) -> usize {
        self.groups.iter().map(|g| g.remove.len()).sum()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("backup of `{table}` failed: {source}")]
    BackupFailed {
        table: String,
        #[source]
        source: TargetError,
    },
    #[error("backup `{backup}` holds {actual} rows, `{table}` holds {expected}")]
    BackupIncomplete {
        table: String,
        backup: String,
        expected: usize,
        actual: usize,
    },
    #[error("{groups} duplicate groups remain after cleanup")]
    DuplicatesRemain { groups: usize },
    #[error(transparent)]
    Target(#[from] TargetError),
}

// ============================================================================
// States
// ============================================================================

pub struct DuplicateReconciler;

impl DuplicateReconciler {
    pub fn identify<S: TargetStore + ?Sized>(store: &S, spec: DedupSpec) -> Result<Identified, DedupError> {
        spec.validate(store)?;
        let groups = find_groups(store, &spec)?;
        tracing::info!(table = %spec.table, groups = groups.len(), "duplicate groups identified");
        Ok(Identified { spec, groups })
    }

    /// All five steps. With `dry_run` only the groups are reported.
    pub fn run<S: TargetStore + ?Sized>(
        store: &mut S,
        spec: DedupSpec,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<DedupReport, DedupError> {
        let identified = Self::identify(&*store, spec)?;
        if dry_run {
            let mut report = DedupReport::empty(&identified.spec, true);
            report.groups = identified.groups;
            return Ok(report);
        }
        if identified.groups.is_empty() {
            return Ok(DedupReport::empty(&identified.spec, false));
        }
        let verified = identified
            .backup(store, now)?
            .delete(store)?
            .reaggregate(store, now)?
            .verify(&*store)?;
        Ok(verified.into_report())
    }
}

pub struct Identified {
    spec: DedupSpec,
    groups: Vec<DuplicateGroup>,
}

impl Identified {
    pub fn groups(&self) -> &[DuplicateGroup] {
        &self.groups
    }

    /// Snapshot every affected table to `<table>_backup_<YYYYmmdd_HHMMSS>`
    /// and check the snapshot's row count.
    pub fn backup<S: TargetStore + ?Sized>(self, store: &mut S, now: DateTime<Utc>) -> Result<BackedUp, DedupError> {
        let stamp = now.format("%Y%m%d_%H%M%S");
        let mut backups = Vec::new();
        for table in self.spec.affected_tables() {
            let backup = format!("{table}_backup_{stamp}");
            create_backup(store, table, &backup).map_err(|source| DedupError::BackupFailed {
                table: table.to_string(),
                source,
            })?;
            let expected = count_rows(&*store, table)?;
            let actual = count_rows(&*store, &backup)?;
            if expected != actual {
                return Err(DedupError::BackupIncomplete {
                    table: table.to_string(),
                    backup,
                    expected,
                    actual,
                });
            }
            tracing::info!(table, backup = %backup, rows = actual, "backup created");
            backups.push(BackupTable {
                table: table.to_string(),
                backup,
                rows: actual,
            });
        }
        Ok(BackedUp {
            spec: self.spec,
            groups: self.groups,
            backups,
            now,
        })
    }
}

pub struct BackedUp {
    spec: DedupSpec,
    groups: Vec<DuplicateGroup>,
    backups: Vec<BackupTable>,
    now: DateTime<Utc>,
}

impl BackedUp {
    pub fn backups(&self) -> &[BackupTable] {
        &self.backups
    }

    /// Tombstone and delete every non-surviving member by id, dependents
    /// first, in one transaction.
    pub fn delete<S: TargetStore + ?Sized>(self, store: &mut S) -> Result<Deleted, DedupError> {
        store.begin()?;
        let (deleted, cascaded) = match delete_members(store, &self.spec, &self.groups, self.now) {
            Ok(counts) => counts,
            Err(err) => {
                rollback(store);
                return Err(err.into());
            }
        };
        if let Err(err) = store.commit() {
            rollback(store);
            return Err(err.into());
        }

        tracing::info!(table = %self.spec.table, deleted, cascaded, "duplicates deleted");
        Ok(Deleted {
            spec: self.spec,
            groups: self.groups,
            backups: self.backups,
            deleted,
            cascaded,
        })
    }
}

fn rollback<S: TargetStore + ?Sized>(store: &mut S) {
    if let Err(err) = store.rollback() {
        tracing::error!(error = %err, "rollback failed");
    }
}

/// Returns `(deleted, cascaded)`.
fn delete_members<S: TargetStore + ?Sized>(
    store: &mut S,
    spec: &DedupSpec,
    groups: &[DuplicateGroup],
    now: DateTime<Utc>,
) -> Result<(usize, usize), TargetError> {
    let mut ids = Vec::new();
    for group in groups {
        for &removed in &group.remove {
            insert_tombstone(store, &spec.table, removed, group.keep, now)?;
            ids.push(removed);
        }
    }
    let mut cascaded = 0;
    for cascade in &spec.cascade {
        cascaded += delete_where_in(store, &cascade.table, &cascade.column, &ids)?;
    }
    let deleted = delete_ids(store, &spec.table, &ids)?;
    Ok((deleted, cascaded))
}

pub struct Deleted {
    spec: DedupSpec,
    groups: Vec<DuplicateGroup>,
    backups: Vec<BackupTable>,
    deleted: usize,
    cascaded: usize,
}

impl Deleted {
    /// Recount every aggregate for the owners of the deleted rows.
    pub fn reaggregate<S: TargetStore + ?Sized>(
        self,
        store: &mut S,
        now: DateTime<Utc>,
    ) -> Result<Reaggregated, DedupError> {
        let mut owners: Vec<&SqlValue> = self.groups.iter().map(|g| &g.owner).collect();
        owners.dedup();

        let mut recomputed = 0;
        for aggregate in &self.spec.aggregates {
            // Identifiers checked by DedupSpec::validate.
            let touch = match &aggregate.touch_column {
                Some(column) => format!(", {column} = ?"),
                None => String::new(),
            };
            let sql = format!(
                "UPDATE {agg} SET {count} = (SELECT COUNT(*) FROM {table} WHERE {owner} = {agg}.id){touch} WHERE id = ?",
                agg = aggregate.table,
                count = aggregate.count_column,
                table = self.spec.table,
                owner = self.spec.owner_column,
            );
            for owner in &owners {
                let mut params = Vec::new();
                if aggregate.touch_column.is_some() {
                    params.push(SqlValue::Timestamp(now));
                }
                params.push((*owner).clone());
                recomputed += store.execute(&sql, &params)?;
            }
        }
        tracing::info!(table = %self.spec.table, recomputed, "aggregates recomputed");

        Ok(Reaggregated {
            spec: self.spec,
            groups: self.groups,
            backups: self.backups,
            deleted: self.deleted,
            cascaded: self.cascaded,
            recomputed,
        })
    }
}

pub struct Reaggregated {
    spec: DedupSpec,
    groups: Vec<DuplicateGroup>,
    backups: Vec<BackupTable>,
    deleted: usize,
    cascaded: usize,
    recomputed: usize,
}

impl Reaggregated {
    /// Run the grouping again; any remaining group is a failure. The
    /// backups stay in place either way.
    pub fn verify<S: TargetStore + ?Sized>(self, store: &S) -> Result<Verified, DedupError> {
        let remaining = find_groups(store, &self.spec)?;
        if !remaining.is_empty() {
            tracing::error!(table = %self.spec.table, groups = remaining.len(), "duplicates remain");
            return Err(DedupError::DuplicatesRemain {
                groups: remaining.len(),
            });
        }
        Ok(Verified {
            report: DedupReport {
                table: self.spec.table,
                dry_run: false,
                groups: self.groups,
                backups: self.backups,
                deleted: self.deleted,
                cascaded: self.cascaded,
                recomputed: self.recomputed,
            },
        })
    }
}

pub struct Verified {
    report: DedupReport,
}

impl Verified {
    pub fn into_report(self) -> DedupReport {
        self.report
    }
}

// ============================================================================
// Grouping
// ============================================================================

fn find_groups<S: TargetStore + ?Sized>(store: &S, spec: &DedupSpec) -> Result<Vec<DuplicateGroup>, TargetError> {
    let sql = format!(
        "SELECT {owner} AS owner, {date} AS date, {context} AS context, COUNT(*) AS n \
         FROM {table} WHERE {owner} IS NOT NULL \
         GROUP BY {owner}, {date}, {context} HAVING COUNT(*) > 1 \
         ORDER BY {owner}, {date}",
        owner = spec.owner_column,
        date = spec.date_column,
        context = spec.context_column,
        table = spec.table,
    );
    let members_sql = format!(
        "SELECT id FROM {table} WHERE {owner} = ? AND {date} IS ? AND {context} IS ? \
         ORDER BY {created} DESC, id DESC",
        table = spec.table,
        owner = spec.owner_column,
        date = spec.date_column,
        context = spec.context_column,
        created = spec.created_column,
    );

    let mut groups = Vec::new();
    for row in store.query(&sql, &[])? {
        let owner = row.get("owner").cloned().unwrap_or(SqlValue::Null);
        let date = row.get("date").cloned().unwrap_or(SqlValue::Null);
        let context = row.get("context").cloned().unwrap_or(SqlValue::Null);
        let members: Vec<Uuid> = store
            .query(&members_sql, &[owner.clone(), date.clone(), context.clone()])?
            .iter()
            .filter_map(|m| m.uuid("id"))
            .collect();
        let Some((&keep, remove)) = members.split_first() else {
            continue;
        };
        groups.push(DuplicateGroup {
            owner,
            date,
            context,
            keep,
            remove: remove.to_vec(),
        });
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use docbridge_source::ObjectId;
    use crate::tests::CommitFails;
    use docbridge_target::statements::{fetch_by_source_key, find_tombstone, insert_row};
    use docbridge_target::{SqliteTarget, TargetRow};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    fn seeded() -> (SqliteTarget, TargetRow) {
        let mut store = SqliteTarget::open_in_memory().unwrap();
        store.ensure_schema().unwrap();
        let user = ObjectId::parse_str("5f1a2b3c4d5e6f7a8b9c0d1e").unwrap();
        let stats = TargetRow::new("student_stats", "stats-1")
            .reference("user_id", user, None)
            .data("mongo_user_id", user.to_string())
            .data("absences_count", 3i64);
        insert_row(&mut store, &stats).unwrap();
        for (key, created) in [("a", at(10, 8)), ("b", at(10, 9)), ("c", at(11, 8))] {
            let date = if key == "c" { "2024-01-17" } else { "2024-01-10" };
            let absence = TargetRow::new("student_stats_absences", key)
                .parent("student_stats_id", &stats)
                .data("date", date)
                .data("created_at", created);
            insert_row(&mut store, &absence).unwrap();
        }
        (store, stats)
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let (mut store, _) = seeded();
        let report =
            DuplicateReconciler::run(&mut store, DedupSpec::student_absences(), at(20, 0), true).unwrap();
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.duplicates(), 1);
        assert!(report.backups.is_empty());
        assert_eq!(count_rows(&store, "student_stats_absences").unwrap(), 3);
    }

    #[test]
    fn test_later_row_survives_and_count_is_recomputed() {
        let (mut store, stats) = seeded();
        let later = fetch_by_source_key(&store, "student_stats_absences", "b")
            .unwrap()
            .unwrap()
            .uuid("id")
            .unwrap();

        let report =
            DuplicateReconciler::run(&mut store, DedupSpec::student_absences(), at(20, 0), false).unwrap();
        assert_eq!(report.groups[0].keep, later);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.recomputed, 1);
        assert_eq!(report.backups.len(), 2);
        assert_eq!(report.backups[0].backup, "student_stats_absences_backup_20240120_000000");
        assert_eq!(count_rows(&store, &report.backups[0].backup).unwrap(), 3);

        assert!(fetch_by_source_key(&store, "student_stats_absences", "a").unwrap().is_none());
        assert_eq!(
            find_tombstone(&store, "student_stats_absences", "a").unwrap(),
            Some(later)
        );
        let row = fetch_by_source_key(&store, "student_stats", &stats.source_key)
            .unwrap()
            .unwrap();
        assert_eq!(row.i64("absences_count"), Some(2));
        assert_eq!(row.text("last_update"), Some("2024-01-20T00:00:00.000Z"));
    }

    #[test]
    fn test_backup_name_collision_stops_before_delete() {
        let (mut store, _) = seeded();
        create_backup(&mut store, "student_stats_absences", "student_stats_absences_backup_20240120_000000")
            .unwrap();
        let err = DuplicateReconciler::run(&mut store, DedupSpec::student_absences(), at(20, 0), false)
            .unwrap_err();
        assert!(matches!(err, DedupError::BackupFailed { .. }));
        assert_eq!(count_rows(&store, "student_stats_absences").unwrap(), 3);
    }

    #[test]
    fn test_duplicate_written_during_cleanup_fails_verification() {
        let (mut store, stats) = seeded();
        let backed_up = DuplicateReconciler::identify(&store, DedupSpec::student_absences())
            .unwrap()
            .backup(&mut store, at(20, 0))
            .unwrap();
        let backups = backed_up.backups().to_vec();
        let deleted = backed_up.delete(&mut store).unwrap();

        // The same absence recorded again before the counts are redone.
        let again = TargetRow::new("student_stats_absences", "d")
            .parent("student_stats_id", &stats)
            .data("date", "2024-01-10")
            .data("created_at", at(12, 8));
        insert_row(&mut store, &again).unwrap();

        let reaggregated = deleted.reaggregate(&mut store, at(20, 0)).unwrap();
        let Err(err) = reaggregated.verify(&store) else {
            panic!("remaining duplicates went unnoticed");
        };
        assert!(matches!(err, DedupError::DuplicatesRemain { groups: 1 }));

        // Backups stay and nothing is deleted a second time.
        for backup in &backups {
            assert_eq!(count_rows(&store, &backup.backup).unwrap(), backup.rows);
        }
        assert_eq!(count_rows(&store, "student_stats_absences").unwrap(), 3);
        assert_eq!(count_rows(&store, "dedup_tombstones").unwrap(), 1);
        assert!(fetch_by_source_key(&store, "student_stats_absences", "d").unwrap().is_some());
    }

    #[test]
    fn test_failed_commit_rolls_the_delete_back() {
        let (store, _) = seeded();
        let mut store = CommitFails(store);
        let backed_up = DuplicateReconciler::identify(&store, DedupSpec::student_absences())
            .unwrap()
            .backup(&mut store, at(20, 0))
            .unwrap();
        assert!(backed_up.delete(&mut store).is_err());

        let mut inner = store.0;
        assert_eq!(count_rows(&inner, "student_stats_absences").unwrap(), 3);
        assert_eq!(count_rows(&inner, "dedup_tombstones").unwrap(), 0);
        // No transaction left open.
        inner.begin().unwrap();
        inner.rollback().unwrap();
    }

    #[test]
    fn test_spec_is_checked_against_the_catalog() {
        let (store, _) = seeded();
        let mut spec = DedupSpec::grades();
        spec.context_column = "kind".into();
        assert!(matches!(
            DuplicateReconciler::identify(&store, spec),
            Err(DedupError::Target(TargetError::UnknownColumn { .. }))
        ));
        assert!(DedupSpec::preset("absences").is_some());
        assert!(DedupSpec::preset("users").is_none());
    }
}
