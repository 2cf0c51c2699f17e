//! Hand-authored backfill plan.
//!
//! Phases encode foreign-key dependency order and run strictly one after
//! another; tables inside a phase have no dependencies on each other and may
//! run concurrently up to the phase's worker limit.

/// One table to copy from the legacy store into the target.
#[derive(Clone, Debug)]
pub struct TableMigration {
    pub name: String,
    /// Ordered full-table read; `LIMIT`/`OFFSET` are appended per batch.
    pub source_query: String,
    /// Positional insert against the target, one row per execution.
    pub insert_template: String,
    /// Overrides the run-wide batch size for unusually wide or hot tables.
    pub batch_size: Option<usize>,
    pub priority: u8,
}

impl TableMigration {
    /// Straight positional copy: `SELECT *` paired with an all-columns
    /// `INSERT ... VALUES ($1..$n)`.
    pub fn positional(name: &str, column_count: usize, priority: u8) -> Self {
        Self {
            name: name.to_string(),
            source_query: format!("SELECT * FROM {name} ORDER BY 1"),
            insert_template: insert_values_template(name, column_count),
            batch_size: None,
            priority,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// A dependency stratum of the plan.
#[derive(Clone, Debug)]
pub struct MigrationPhase {
    pub name: String,
    pub tables: Vec<TableMigration>,
    /// Upper bound on concurrently migrating tables within this phase.
    pub worker_limit: usize,
}

impl MigrationPhase {
    pub fn new(name: &str, worker_limit: usize, tables: Vec<TableMigration>) -> Self {
        Self {
            name: name.to_string(),
            tables,
            worker_limit,
        }
    }
}

/// `INSERT INTO {table} VALUES ($1, ..., $n)` for a positional copy.
pub fn insert_values_template(table: &str, column_count: usize) -> String {
    let params: Vec<String> = (1..=column_count).map(|i| format!("${i}")).collect();
    format!("INSERT INTO {table} VALUES ({})", params.join(", "))
}

/// The production plan, in dependency order. Batch-size overrides mark the
/// two highest-volume tables.
pub fn default_phases() -> Vec<MigrationPhase> {
    vec![
        MigrationPhase::new(
            "reference",
            4,
            vec![
                TableMigration::positional("departments", 5, 1),
                TableMigration::positional("roles", 5, 1),
                TableMigration::positional("permissions", 5, 1),
            ],
        ),
        MigrationPhase::new(
            "identity",
            6,
            vec![
                TableMigration::positional("users", 11, 2),
                TableMigration::positional("user_roles", 5, 2),
                TableMigration::positional("profiles", 20, 2),
            ],
        ),
        MigrationPhase::new(
            "transactional",
            8,
            vec![
                TableMigration::positional("clients", 7, 3),
                TableMigration::positional("projects", 12, 3),
                TableMigration::positional("weekly_reports", 22, 3).with_batch_size(5000),
                TableMigration::positional("daily_records", 15, 3).with_batch_size(10000),
            ],
        ),
        MigrationPhase::new(
            "auxiliary",
            4,
            vec![
                TableMigration::positional("notifications", 9, 4),
                TableMigration::positional("audit_logs", 11, 4),
                TableMigration::positional("sessions", 6, 4),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_template_enumerates_placeholders() {
        assert_eq!(
            insert_values_template("roles", 3),
            "INSERT INTO roles VALUES ($1, $2, $3)"
        );
    }

    #[test]
    fn default_plan_is_dependency_ordered() {
        let phases = default_phases();
        assert_eq!(phases.len(), 4);

        let names: Vec<&str> = phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["reference", "identity", "transactional", "auxiliary"]
        );

        // Priorities never decrease across phases.
        let mut last = 0;
        for phase in &phases {
            assert!(!phase.tables.is_empty());
            assert!(phase.worker_limit > 0);
            for table in &phase.tables {
                assert!(table.priority >= last);
            }
            last = phase.tables[0].priority;
        }
    }

    #[test]
    fn volume_tables_carry_batch_overrides() {
        let phases = default_phases();
        let transactional = &phases[2];
        let weekly = transactional
            .tables
            .iter()
            .find(|t| t.name == "weekly_reports")
            .expect("weekly_reports in plan");
        assert_eq!(weekly.batch_size, Some(5000));
        assert_eq!(weekly.insert_template.matches('$').count(), 22);
    }
}
