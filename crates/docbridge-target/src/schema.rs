//! Relational schema and its parsed catalog.
//!
//! The DDL is parsed once with `sqlparser`; the resulting [`Catalog`] is the
//! allow-list for every table and column name interpolated into SQL:
//! - tables  -> [`TableDef`] (columns, nullability, primary key)
//! - `FOREIGN KEY` constraints -> [`ForeignKey`]
//! - `UNIQUE` constraints -> [`UniqueKey`]

use sqlparser::ast::*;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use crate::TargetError;

/// Migrations applied in order by [`crate::SqliteTarget::ensure_schema`].
/// Migration `n` (1-based) brings the database to `user_version = n`.
pub const MIGRATIONS: &[&str] = &[
    include_str!("../sql/0001_schema.sql"),
    include_str!("../sql/0002_tombstones.sql"),
];
pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

/// Cleanup bookkeeping; not a migrated entity table.
pub const TOMBSTONE_TABLE: &str = "dedup_tombstones";

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub tables: Vec<TableDef>,
    pub foreign_keys: Vec<ForeignKey>,
    pub unique_keys: Vec<UniqueKey>,
}

#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub from_table: String,
    pub from_columns: Vec<String>,
    pub to_table: String,
    pub to_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UniqueKey {
    pub table: String,
    pub columns: Vec<String>,
}

impl Catalog {
    /// Catalog of every migration in [`MIGRATIONS`].
    pub fn builtin() -> Result<Self, TargetError> {
        Self::parse(&MIGRATIONS.concat())
    }

    /// Tables holding migrated entities, i.e. all but the tombstones.
    pub fn entity_tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.iter().filter(|t| t.name != TOMBSTONE_TABLE)
    }

    pub fn parse(sql: &str) -> Result<Self, TargetError> {
        let statements = Parser::parse_sql(&SQLiteDialect {}, sql)
            .map_err(|e| TargetError::Schema(e.to_string()))?;

        let mut catalog = Catalog::default();

        for stmt in statements {
            if let Statement::CreateTable {
                name,
                columns: sql_columns,
                constraints: sql_constraints,
                ..
            } = stmt
            {
                let table_name = name.to_string();
                let mut primary_key = Vec::new();

                let columns = sql_columns
                    .iter()
                    .map(|col| ColumnDef {
                        name: col.name.to_string(),
                        data_type: col.data_type.to_string(),
                        nullable: !col
                            .options
                            .iter()
                            .any(|opt| matches!(opt.option, ColumnOption::NotNull)),
                    })
                    .collect();

                for constraint in &sql_constraints {
                    match constraint {
                        TableConstraint::ForeignKey {
                            columns: fk_cols,
                            foreign_table,
                            referred_columns,
                            ..
                        } => {
                            catalog.foreign_keys.push(ForeignKey {
                                from_table: table_name.clone(),
                                from_columns: fk_cols.iter().map(|c| c.to_string()).collect(),
                                to_table: foreign_table.to_string(),
                                to_columns: referred_columns
                                    .iter()
                                    .map(|c| c.to_string())
                                    .collect(),
                            });
                        }
                        TableConstraint::Unique {
                            columns: uq_cols,
                            is_primary,
                            ..
                        } => {
                            let cols = uq_cols.iter().map(|c| c.to_string()).collect();
                            if *is_primary {
                                primary_key = cols;
                            } else {
                                catalog.unique_keys.push(UniqueKey {
                                    table: table_name.clone(),
                                    columns: cols,
                                });
                            }
                        }
                        _ => {}
                    }
                }

                catalog.tables.push(TableDef {
                    name: table_name,
                    columns,
                    primary_key,
                });
            }
        }

        Ok(catalog)
    }

    pub fn table(&self, name: &str) -> Result<&TableDef, TargetError> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| TargetError::UnknownTable(name.to_string()))
    }

    /// Foreign keys declared on `table`.
    pub fn foreign_keys_from<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.foreign_keys.iter().filter(move |fk| fk.from_table == table)
    }

    /// Foreign keys of other tables pointing at `table`.
    pub fn referencing<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.foreign_keys.iter().filter(move |fk| fk.to_table == table)
    }

    pub fn is_unique(&self, table: &str, column: &str) -> bool {
        self.unique_keys
            .iter()
            .any(|u| u.table == table && u.columns.len() == 1 && u.columns[0] == column)
    }
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn require_column(&self, name: &str) -> Result<&ColumnDef, TargetError> {
        self.column(name).ok_or_else(|| TargetError::UnknownColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = Catalog::builtin().unwrap();
        assert_eq!(catalog.tables.len(), 15);
        assert_eq!(catalog.entity_tables().count(), 14);

        for table in catalog.entity_tables() {
            assert_eq!(table.primary_key, vec!["id".to_string()], "{}", table.name);
            assert!(
                catalog.is_unique(&table.name, "source_key"),
                "{} lacks a unique source key",
                table.name
            );
        }

        let courses = catalog.table("courses").unwrap();
        assert!(!courses.require_column("academic_year").unwrap().nullable);
        assert!(courses.require_column("nope").is_err());
        assert!(catalog.table("nope").is_err());

        let tombstones = catalog.table(TOMBSTONE_TABLE).unwrap();
        assert_eq!(tombstones.primary_key, vec!["id".to_string()]);
        assert!(catalog
            .unique_keys
            .iter()
            .any(|u| u.table == TOMBSTONE_TABLE && u.columns == ["table_name", "source_key"]));
    }

    #[test]
    fn test_foreign_keys() {
        let catalog = Catalog::builtin().unwrap();
        let grade_fks: Vec<_> = catalog
            .foreign_keys_from("grades_records")
            .map(|fk| (fk.from_columns[0].as_str(), fk.to_table.as_str()))
            .collect();
        assert!(grade_fks.contains(&("grade_id", "grades")));
        assert!(grade_fks.contains(&("student_id", "users")));

        let into_grades: Vec<_> = catalog
            .referencing("grades")
            .map(|fk| fk.from_table.as_str())
            .collect();
        assert_eq!(into_grades, vec!["grades_records"]);
    }
}
