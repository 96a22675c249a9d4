use docbridge_target::statements::{find_id_by_source_key, insert_row};
use docbridge_target::{SqlValue, SqliteTarget, TargetRow, TargetStore};

#[test]
fn test_rows_survive_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target.db");

    let course = TargetRow::new("courses", "6733728d9c906b85f3705d5e")
        .data("academic_year", 2024i64)
        .data("is_active", true);
    {
        let mut target = SqliteTarget::open(&path).unwrap();
        target.ensure_schema().unwrap();
        target.begin().unwrap();
        insert_row(&mut target, &course).unwrap();
        let session = TargetRow::new("courses_sessions", "6733728d9c906b85f3705d5f")
            .parent("course_id", &course)
            .data("subject", "arabic")
            .data("level", 3i64)
            .data("stats_average_grade", 14.25);
        insert_row(&mut target, &session).unwrap();
        target.commit().unwrap();
    }

    let mut target = SqliteTarget::open(&path).unwrap();
    assert!(!target.ensure_schema().unwrap());
    assert_eq!(
        find_id_by_source_key(&target, "courses", "6733728d9c906b85f3705d5e").unwrap(),
        Some(course.id)
    );

    let row = target
        .query_one(
            "SELECT level, stats_average_grade FROM courses_sessions WHERE course_id = ?",
            &[course.id.into()],
        )
        .unwrap()
        .unwrap();
    assert_eq!(row.i64("level"), Some(3));
    approx::assert_abs_diff_eq!(row.f64("stats_average_grade").unwrap(), 14.25, epsilon = 1e-9);
    assert_eq!(row.get("missing"), None::<&SqlValue>);
}

#[test]
fn test_failed_child_rolls_back_parent() {
    let mut target = SqliteTarget::open_in_memory().unwrap();
    target.ensure_schema().unwrap();

    let course = TargetRow::new("courses", "c").data("academic_year", 2024i64).data("is_active", true);
    // academic_year is NOT NULL
    let broken = TargetRow::new("courses", "c2").data("is_active", true);

    target.begin().unwrap();
    insert_row(&mut target, &course).unwrap();
    let err = insert_row(&mut target, &broken).unwrap_err();
    assert!(err.is_record_level());
    target.rollback().unwrap();

    assert_eq!(find_id_by_source_key(&target, "courses", "c").unwrap(), None);
}
