use anyhow::{Context, Result};
use log::info;
use sqlx::{Executor, PgPool};

/// Embedded migrations, applied in order. Every script is idempotent.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_analysis_jobs.sql",
        include_str!("sql/001_analysis_jobs.sql"),
    ),
    (
        "002_analysis_results.sql",
        include_str!("sql/002_analysis_results.sql"),
    ),
    (
        "003_realtime_events.sql",
        include_str!("sql/003_realtime_events.sql"),
    ),
];

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for (name, sql) in MIGRATIONS {
        // No bind arguments, so this goes through the simple query protocol and may hold
        // several statements
        pool.execute(*sql)
            .await
            .with_context(|| format!("Migration {} failed", name))?;
        info!("Applied migration: {}", name);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_by_prefix() {
        let names: Vec<&str> = MIGRATIONS.iter().map(|(name, _)| *name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn job_table_enforces_one_job_per_segment() {
        let (_, sql) = MIGRATIONS[0];
        assert!(sql.contains("CREATE UNIQUE INDEX IF NOT EXISTS analysis_jobs_segment_idx"));
        assert!(sql.contains("(camera_id, segment_start)"));
    }
}
