//! Entity families, their dependency levels and deferred columns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A group of collections migrated together as one dependency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Users,
    Courses,
    Attendances,
    Grades,
    Behaviors,
    Statistics,
}

/// Kind of a registered entity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Snapshots without a kind predate the other families and only held users.
    #[default]
    User,
    Course,
    Session,
    Attendance,
    Grade,
    Behavior,
    StudentStats,
}

/// A foreign key that may be written `NULL` and filled in later, together
/// with the column holding the source identifier it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredColumn {
    pub table: &'static str,
    pub column: &'static str,
    pub source_column: &'static str,
    pub kind: EntityKind,
}

const fn deferred(
    table: &'static str,
    column: &'static str,
    source_column: &'static str,
    kind: EntityKind,
) -> DeferredColumn {
    DeferredColumn {
        table,
        column,
        source_column,
        kind,
    }
}

/// A table whose rows belong to one parent row of the same document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRelation {
    pub table: &'static str,
    pub parent_table: &'static str,
    pub parent_column: &'static str,
}

const fn child(
    table: &'static str,
    parent_table: &'static str,
    parent_column: &'static str,
) -> ChildRelation {
    ChildRelation {
        table,
        parent_table,
        parent_column,
    }
}

const COURSES_CHILDREN: &[ChildRelation] = &[
    child("courses_teacher", "courses", "course_id"),
    child("courses_sessions", "courses", "course_id"),
    child("courses_sessions_timeslot", "courses_sessions", "course_sessions_id"),
    child("courses_sessions_students", "courses_sessions", "course_sessions_id"),
];
const ATTENDANCES_CHILDREN: &[ChildRelation] =
    &[child("attendance_records", "attendances", "attendance_id")];
const GRADES_CHILDREN: &[ChildRelation] = &[child("grades_records", "grades", "grade_id")];
const BEHAVIORS_CHILDREN: &[ChildRelation] =
    &[child("behavior_records", "behaviors", "behavior_id")];
const STATISTICS_CHILDREN: &[ChildRelation] =
    &[child("student_stats_absences", "student_stats", "student_stats_id")];

const COURSES_DEFERRED: &[DeferredColumn] = &[
    deferred("courses_teacher", "teacher_id", "mongo_teacher_id", EntityKind::User),
    deferred("courses_sessions_students", "student_id", "mongo_student_id", EntityKind::User),
];
const ATTENDANCES_DEFERRED: &[DeferredColumn] = &[
    deferred("attendances", "course_session_id", "mongo_session_id", EntityKind::Session),
    deferred("attendance_records", "student_id", "mongo_student_id", EntityKind::User),
];
const GRADES_DEFERRED: &[DeferredColumn] = &[
    deferred("grades", "course_session_id", "mongo_session_id", EntityKind::Session),
    deferred("grades_records", "student_id", "mongo_student_id", EntityKind::User),
];
const BEHAVIORS_DEFERRED: &[DeferredColumn] = &[
    deferred("behaviors", "course_session_id", "mongo_session_id", EntityKind::Session),
    deferred("behavior_records", "student_id", "mongo_student_id", EntityKind::User),
];
const STATISTICS_DEFERRED: &[DeferredColumn] = &[
    deferred("student_stats", "user_id", "mongo_user_id", EntityKind::User),
    deferred("student_stats_absences", "course_session_id", "mongo_session_id", EntityKind::Session),
];

impl Family {
    pub const ALL: [Family; 6] = [
        Family::Users,
        Family::Courses,
        Family::Attendances,
        Family::Grades,
        Family::Behaviors,
        Family::Statistics,
    ];

    /// All families, lower levels first.
    pub fn in_dependency_order() -> Vec<Family> {
        let mut families = Self::ALL.to_vec();
        families.sort_by_key(|f| f.level());
        families
    }

    pub fn level(self) -> u8 {
        match self {
            Family::Users => 0,
            Family::Courses => 1,
            Family::Attendances | Family::Grades | Family::Behaviors => 2,
            Family::Statistics => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::Users => "users",
            Family::Courses => "courses",
            Family::Attendances => "attendances",
            Family::Grades => "grades",
            Family::Behaviors => "behaviors",
            Family::Statistics => "statistics",
        }
    }

    /// Source collection read by this family.
    pub fn collection(self) -> &'static str {
        match self {
            Family::Users => "users",
            Family::Courses => "coursenews",
            Family::Attendances => "attendancenews",
            Family::Grades => "gradenews",
            Family::Behaviors => "behaviornews",
            Family::Statistics => "studentstats",
        }
    }

    /// Table holding one row per source document.
    pub fn primary_table(self) -> &'static str {
        match self {
            Family::Users => "users",
            Family::Courses => "courses",
            Family::Attendances => "attendances",
            Family::Grades => "grades",
            Family::Behaviors => "behaviors",
            Family::Statistics => "student_stats",
        }
    }

    pub fn deferred_columns(self) -> &'static [DeferredColumn] {
        match self {
            Family::Users => &[],
            Family::Courses => COURSES_DEFERRED,
            Family::Attendances => ATTENDANCES_DEFERRED,
            Family::Grades => GRADES_DEFERRED,
            Family::Behaviors => BEHAVIORS_DEFERRED,
            Family::Statistics => STATISTICS_DEFERRED,
        }
    }

    /// Parent/child table pairs written from one document, parents first.
    pub fn child_relations(self) -> &'static [ChildRelation] {
        match self {
            Family::Users => &[],
            Family::Courses => COURSES_CHILDREN,
            Family::Attendances => ATTENDANCES_CHILDREN,
            Family::Grades => GRADES_CHILDREN,
            Family::Behaviors => BEHAVIORS_CHILDREN,
            Family::Statistics => STATISTICS_CHILDREN,
        }
    }

    /// Every table this family writes.
    pub fn tables(self) -> Vec<&'static str> {
        let mut tables = vec![self.primary_table()];
        tables.extend(self.child_relations().iter().map(|c| c.table));
        tables
    }

    /// The family owning a deferred column, if any.
    pub fn deferred_for(table: &str, column: &str) -> Option<&'static DeferredColumn> {
        Family::ALL
            .into_iter()
            .find_map(|f| f.deferred_column(table, column))
    }

    pub fn deferred_column(self, table: &str, column: &str) -> Option<&'static DeferredColumn> {
        self.deferred_columns()
            .iter()
            .find(|d| d.table == table && d.column == column)
    }

    /// Whether rows of this family may hold a key of `kind`.
    pub fn may_reference(self, kind: EntityKind) -> bool {
        kind.family().level() < self.level()
    }
}

impl EntityKind {
    pub fn family(self) -> Family {
        match self {
            EntityKind::User => Family::Users,
            EntityKind::Course | EntityKind::Session => Family::Courses,
            EntityKind::Attendance => Family::Attendances,
            EntityKind::Grade => Family::Grades,
            EntityKind::Behavior => Family::Behaviors,
            EntityKind::StudentStats => Family::Statistics,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Course => "course",
            EntityKind::Session => "session",
            EntityKind::Attendance => "attendance",
            EntityKind::Grade => "grade",
            EntityKind::Behavior => "behavior",
            EntityKind::StudentStats => "student_stats",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity family `{0}`")]
pub struct UnknownFamily(pub String);

impl FromStr for Family {
    type Err = UnknownFamily;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Family::ALL
            .into_iter()
            .find(|f| f.name() == lowered || f.collection() == lowered)
            .or(match lowered.as_str() {
                "stats" | "student_stats" => Some(Family::Statistics),
                _ => None,
            })
            .ok_or_else(|| UnknownFamily(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_order() {
        let order = Family::in_dependency_order();
        assert_eq!(order.first(), Some(&Family::Users));
        assert_eq!(order.last(), Some(&Family::Statistics));
        for pair in order.windows(2) {
            assert!(pair[0].level() <= pair[1].level());
        }
    }

    #[test]
    fn test_deferred_columns_only_point_backwards() {
        for family in Family::ALL {
            for d in family.deferred_columns() {
                assert!(
                    family.may_reference(d.kind),
                    "{family}: {}.{} references {}",
                    d.table,
                    d.column,
                    d.kind
                );
            }
        }
        assert!(!Family::Courses.may_reference(EntityKind::Session));
        assert!(!Family::Attendances.may_reference(EntityKind::Grade));
    }

    #[test]
    fn test_relations_match_the_schema() {
        let catalog = docbridge_target::Catalog::builtin().unwrap();
        for family in Family::ALL {
            for rel in family.child_relations() {
                assert!(
                    catalog
                        .foreign_keys_from(rel.table)
                        .any(|fk| fk.from_columns == [rel.parent_column] && fk.to_table == rel.parent_table),
                    "{}.{} is not a foreign key to {}",
                    rel.table,
                    rel.parent_column,
                    rel.parent_table
                );
            }
            for d in family.deferred_columns() {
                let table = catalog.table(d.table).unwrap();
                assert!(table.column(d.column).is_some());
                assert!(table.column(d.source_column).is_some());
            }
        }
    }

    #[test]
    fn test_parse_family() {
        assert_eq!("grades".parse::<Family>().unwrap(), Family::Grades);
        assert_eq!("coursenews".parse::<Family>().unwrap(), Family::Courses);
        assert_eq!("stats".parse::<Family>().unwrap(), Family::Statistics);
        assert!("teachers".parse::<Family>().is_err());
    }
}
