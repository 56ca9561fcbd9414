use rusqlite::Connection;

struct Migration {
    version: u32,
    up_sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: r#"
            CREATE TABLE IF NOT EXISTS usage_periods (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                tokens_limit INTEGER NOT NULL CHECK (tokens_limit >= 0),
                tokens_used INTEGER NOT NULL DEFAULT 0 CHECK (tokens_used >= 0),
                reports_count INTEGER NOT NULL DEFAULT 0 CHECK (reports_count >= 0),
                chat_tokens_used INTEGER NOT NULL DEFAULT 0 CHECK (chat_tokens_used >= 0),
                status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'completed')),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (period_end > period_start)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_usage_periods_one_active
                ON usage_periods(account_id) WHERE status = 'active';
            CREATE INDEX IF NOT EXISTS idx_usage_periods_account
                ON usage_periods(account_id, period_start);

            CREATE TABLE IF NOT EXISTS report_jobs (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN
                    ('pending', 'processing', 'clarifying', 'complete', 'failed', 'cancelled')),
                tokens_reserved INTEGER NOT NULL DEFAULT 0 CHECK (tokens_reserved >= 0),
                error_message TEXT,
                failure_detail TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_report_jobs_account_status
                ON report_jobs(account_id, status);

            CREATE TABLE IF NOT EXISTS report_job_steps (
                job_id TEXT NOT NULL REFERENCES report_jobs(id) ON DELETE CASCADE,
                step TEXT NOT NULL,
                tokens INTEGER NOT NULL CHECK (tokens >= 0),
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (job_id, step)
            );
        "#,
}];

pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);")?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!("Running migration v{}", migration.version);
            conn.execute_batch(migration.up_sql)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [migration.version],
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn creates_expected_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let tables = table_names(&conn);
        for expected in ["report_job_steps", "report_jobs", "schema_version", "usage_periods"] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn rerunning_is_a_no_op() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn second_active_period_violates_unique_index() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let insert = "INSERT INTO usage_periods
            (account_id, period_start, period_end, tokens_limit, status, created_at, updated_at)
            VALUES ('acct', '2026-10-01', '2026-11-01', 100, ?1, 'now', 'now')";
        conn.execute(insert, ["active"]).unwrap();
        assert!(conn.execute(insert, ["active"]).is_err());
        // Completed history rows are unconstrained.
        conn.execute(insert, ["completed"]).unwrap();
        conn.execute(insert, ["completed"]).unwrap();
    }

    #[test]
    fn inverted_period_bounds_are_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO usage_periods
             (account_id, period_start, period_end, tokens_limit, created_at, updated_at)
             VALUES ('acct', '2026-11-01', '2026-10-01', 100, 'now', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
