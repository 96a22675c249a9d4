//! Whole-engine scenarios: dumps on disk, families out of order,
//! duplicate cleanup followed by verification.

use chrono::{TimeZone, Utc};
use docbridge_core::dedup::{DedupSpec, DuplicateReconciler};
use docbridge_core::{
    collect_pending, Family, IdentifierTranslator, Migrator, TransformOptions, Verifier,
};
use docbridge_source::{MemorySource, ObjectId};
use docbridge_target::statements::{count_rows, fetch_by_source_key};
use docbridge_target::SqliteTarget;
use serde_json::{json, Value};
use std::fs;

const TEACHER: &str = "5f1a2b3c4d5e6f7a8b9c0e01";
const STUDENT_A: &str = "5f1a2b3c4d5e6f7a8b9c0e02";
const STUDENT_B: &str = "5f1a2b3c4d5e6f7a8b9c0e03";
const COURSE: &str = "6733728d9c906b85f3705e10";
const SESSION: &str = "6733728d9c906b85f3705e11";
const FIRST_GRADE: &str = "6733728d9c906b85f3705e30";
const SECOND_GRADE: &str = "6733728d9c906b85f3705e31";

fn options() -> TransformOptions {
    TransformOptions {
        now: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        nearest_date_fallback: true,
    }
}

fn users() -> Vec<Value> {
    vec![
        json!({"_id": TEACHER, "firstname": "Yusuf", "role": "teacher"}),
        json!({"_id": STUDENT_A, "firstname": "Amina", "role": "student"}),
        json!({"_id": STUDENT_B, "firstname": "Idris", "role": "student"}),
    ]
}

fn courses() -> Vec<Value> {
    vec![json!({
        "_id": COURSE,
        "academicYear": 2024,
        "createdAt": "2024-01-02T00:00:00Z",
        "teacher": [TEACHER],
        "sessions": [{"_id": SESSION, "subject": "arabic", "level": "3-4", "students": [STUDENT_A, STUDENT_B]}]
    })]
}

/// The same exam entered twice, an hour apart.
fn duplicated_grades() -> Vec<Value> {
    [(FIRST_GRADE, "2024-01-12T08:00:00Z", 12), (SECOND_GRADE, "2024-01-12T09:00:00Z", 14)]
        .into_iter()
        .map(|(id, created, value)| {
            json!({
                "_id": id,
                "sessionId": SESSION,
                "date": "2024-01-12",
                "type": "exam",
                "createdAt": created,
                "records": [
                    {"student": STUDENT_A, "value": value},
                    {"student": STUDENT_B, "value": value + 2}
                ]
            })
        })
        .collect()
}

fn target() -> SqliteTarget {
    let mut target = SqliteTarget::open_in_memory().unwrap();
    target.ensure_schema().unwrap();
    target
}

// ============================================================================
// Dumps
// ============================================================================

#[test]
fn test_migrates_from_dump_directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("users.json"), Value::Array(users()).to_string()).unwrap();
    let lines: Vec<String> = courses().iter().map(Value::to_string).collect();
    fs::write(dir.path().join("coursenews.jsonl"), lines.join("\n")).unwrap();
    fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let source = MemorySource::from_dump_dir(dir.path()).unwrap();
    let mut store = target();
    let mut translator = IdentifierTranslator::new();
    let reports = Migrator::new(&source, &mut store, &mut translator)
        .with_options(options())
        .run_all()
        .unwrap();

    let migrated: usize = reports.iter().map(|r| r.counters.migrated).sum();
    assert_eq!(migrated, 4);
    assert_eq!(count_rows(&store, "courses_teacher").unwrap(), 1);
    assert_eq!(count_rows(&store, "attendances").unwrap(), 0);
}

// ============================================================================
// Resolution
// ============================================================================

#[test]
fn test_reverse_order_run_resolves_completely() {
    let source = MemorySource::new()
        .with_json("users", users())
        .and_then(|s| s.with_json("coursenews", courses()))
        .and_then(|s| s.with_json("gradenews", duplicated_grades()[..1].to_vec()))
        .unwrap();
    let mut store = target();
    let mut translator = IdentifierTranslator::new();

    let mut migrator = Migrator::new(&source, &mut store, &mut translator).with_options(options());
    let mut order = Family::in_dependency_order();
    order.reverse();
    for family in order {
        migrator.run_family(family).unwrap();
    }
    for family in Family::ALL {
        migrator.resolve(family).unwrap();
    }

    for family in Family::ALL {
        assert!(collect_pending(&store, family).unwrap().is_empty(), "{family}");
        let report = Verifier::new(&source, &store, &translator)
            .with_options(options())
            .verify(family)
            .unwrap();
        assert!(report.is_clean(), "{family}: {:?}", report.discrepancies);
    }
}

// ============================================================================
// Duplicates
// ============================================================================

#[test]
fn test_grade_duplicates_keep_latest_and_take_records_along() {
    let source = MemorySource::new()
        .with_json("users", users())
        .and_then(|s| s.with_json("coursenews", courses()))
        .and_then(|s| s.with_json("gradenews", duplicated_grades()))
        .unwrap();
    let mut store = target();
    let mut translator = IdentifierTranslator::new();
    Migrator::new(&source, &mut store, &mut translator)
        .with_options(options())
        .run_all()
        .unwrap();
    assert_eq!(count_rows(&store, "grades").unwrap(), 2);
    assert_eq!(count_rows(&store, "grades_records").unwrap(), 4);

    let preview = DuplicateReconciler::run(
        &mut store,
        DedupSpec::grades(),
        Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        true,
    )
    .unwrap();
    assert!(preview.dry_run);
    assert_eq!(preview.duplicates(), 1);
    assert_eq!(count_rows(&store, "grades").unwrap(), 2);

    let report = DuplicateReconciler::run(
        &mut store,
        DedupSpec::grades(),
        Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        false,
    )
    .unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.cascaded, 2);
    let backed_up: Vec<_> = report.backups.iter().map(|b| (b.table.as_str(), b.rows)).collect();
    assert_eq!(backed_up, vec![("grades", 2), ("grades_records", 4)]);

    assert!(fetch_by_source_key(&store, "grades", FIRST_GRADE).unwrap().is_none());
    let kept = fetch_by_source_key(&store, "grades", SECOND_GRADE).unwrap().unwrap();
    assert_eq!(kept.f64("stats_average_grade"), Some(15.0));
    assert_eq!(count_rows(&store, "grades_records").unwrap(), 2);

    // Verification against the unchanged source reports the removed copy.
    let report = Verifier::new(&source, &store, &translator)
        .with_options(options())
        .verify(Family::Grades)
        .unwrap();
    let missing: Vec<_> = report
        .discrepancies
        .iter()
        .filter(|d| d.field == "row")
        .map(|d| d.source_identifier.as_str())
        .collect();
    assert_eq!(missing, vec![FIRST_GRADE]);
    assert_eq!(
        translator.source_of(kept.uuid("id").unwrap()),
        ObjectId::parse_str(SECOND_GRADE).ok()
    );
}

#[test]
fn test_rerun_after_dedup_does_not_restore_duplicates() {
    let source = MemorySource::new()
        .with_json("users", users())
        .and_then(|s| s.with_json("coursenews", courses()))
        .and_then(|s| s.with_json("gradenews", duplicated_grades()))
        .unwrap();
    let mut store = target();
    let mut translator = IdentifierTranslator::new();
    Migrator::new(&source, &mut store, &mut translator)
        .with_options(options())
        .run_all()
        .unwrap();
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
    DuplicateReconciler::run(&mut store, DedupSpec::grades(), now, false).unwrap();

    // Same mapping, as on the next scheduled run.
    let rerun = Migrator::new(&source, &mut store, &mut translator)
        .with_options(options())
        .run_family(Family::Grades)
        .unwrap();
    assert_eq!(rerun.counters.migrated, 0);
    assert_eq!(rerun.counters.already_present, 2);
    assert_eq!(rerun.counters.failed, 0);

    // Mapping lost: the removed grade is still not written back.
    let mut fresh = IdentifierTranslator::new();
    let rerun = Migrator::new(&source, &mut store, &mut fresh)
        .with_options(options())
        .run_family(Family::Grades)
        .unwrap();
    assert_eq!(rerun.counters.migrated, 0);
    assert_eq!(rerun.counters.already_present, 2);
    assert_eq!(count_rows(&store, "grades").unwrap(), 1);
    assert_eq!(count_rows(&store, "grades_records").unwrap(), 2);

    let check = DuplicateReconciler::run(&mut store, DedupSpec::grades(), now, true).unwrap();
    assert!(check.groups.is_empty());
}

#[test]
fn test_duplicates_found_before_their_session_is_resolved() {
    // No courses: every grade's session reference is still pending.
    let source = MemorySource::new()
        .with_json("users", users())
        .and_then(|s| s.with_json("gradenews", duplicated_grades()))
        .unwrap();
    let mut store = target();
    let mut translator = IdentifierTranslator::new();
    let mut migrator = Migrator::new(&source, &mut store, &mut translator).with_options(options());
    migrator.run_family(Family::Users).unwrap();
    let grades = migrator.run_family(Family::Grades).unwrap();
    assert_eq!(grades.counters.migrated, 2);
    assert_eq!(
        grades.resolution.still_missing,
        vec![ObjectId::parse_str(SESSION).unwrap()]
    );

    let report = DuplicateReconciler::run(
        &mut store,
        DedupSpec::grades(),
        Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        false,
    )
    .unwrap();
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].owner.to_string(), SESSION);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.cascaded, 2);
    assert!(fetch_by_source_key(&store, "grades", SECOND_GRADE).unwrap().is_some());
}
