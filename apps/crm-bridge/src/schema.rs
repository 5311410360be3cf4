//! Relational schema metadata for the contact cache and write queue.

/// Table metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub description: &'static str,
}

/// Index metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub table: &'static str,
    pub columns: &'static [&'static str],
    pub unique: bool,
}

pub const CORE_TABLES: &[TableSpec] = &[
    TableSpec {
        name: "crm_contacts_cache",
        description: "Canonical contacts keyed by remote or temporary contact id.",
    },
    TableSpec {
        name: "crm_write_queue",
        description: "Durable outbox of contact mutations awaiting the remote directory.",
    },
];

/// Indexes backing search ordering, staleness ranking, and ordered dequeue.
pub const CORE_INDEXES: &[IndexSpec] = &[
    IndexSpec {
        name: "ix_crm_contacts_cache_last_synced",
        table: "crm_contacts_cache",
        columns: &["last_synced_at"],
        unique: false,
    },
    IndexSpec {
        name: "ix_crm_contacts_cache_display_name",
        table: "crm_contacts_cache",
        columns: &["display_name"],
        unique: false,
    },
    IndexSpec {
        name: "ix_crm_contacts_cache_company_name",
        table: "crm_contacts_cache",
        columns: &["company_name"],
        unique: false,
    },
    IndexSpec {
        name: "ix_crm_contacts_cache_sync_status",
        table: "crm_contacts_cache",
        columns: &["sync_status"],
        unique: false,
    },
    IndexSpec {
        name: "ix_crm_write_queue_status_created",
        table: "crm_write_queue",
        columns: &["status", "created_at"],
        unique: false,
    },
    IndexSpec {
        name: "ux_crm_write_queue_open_contact",
        table: "crm_write_queue",
        columns: &["contact_id"],
        unique: true,
    },
];

#[must_use]
pub fn core_schema_sql() -> &'static str {
    include_str!("../schema/core.sql")
}

#[cfg(test)]
mod tests {
    use super::{CORE_INDEXES, CORE_TABLES, core_schema_sql};

    #[test]
    fn schema_declares_every_table_and_index() {
        let sql = core_schema_sql();
        for table in CORE_TABLES {
            assert!(
                sql.contains(format!("CREATE TABLE IF NOT EXISTS {}", table.name).as_str()),
                "missing table {}",
                table.name
            );
        }
        for index in CORE_INDEXES {
            let statement = if index.unique {
                format!("CREATE UNIQUE INDEX IF NOT EXISTS {}", index.name)
            } else {
                format!("CREATE INDEX IF NOT EXISTS {}", index.name)
            };
            assert!(sql.contains(statement.as_str()), "missing index {}", index.name);
            let on_clause = format!("ON {} (", index.table);
            let tail = sql
                .split(statement.as_str())
                .nth(1)
                .unwrap_or_default();
            assert!(tail.trim_start().starts_with(on_clause.as_str()));
            for column in index.columns {
                assert!(tail.split(';').next().unwrap_or_default().contains(column));
            }
        }
    }

    #[test]
    fn queue_enforces_attempt_ceiling() {
        assert!(core_schema_sql().contains("CHECK (attempts <= max_attempts)"));
    }
}
