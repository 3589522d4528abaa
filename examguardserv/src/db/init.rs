// Database initialization and connection management
use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use std::sync::{Arc, Mutex};

use examguard::settings::{
    DEFAULT_ENABLE_AUTO_SUSPEND, DEFAULT_MAX_INCIDENTS, SETTING_ENABLE_AUTO_SUSPEND,
    SETTING_MAX_INCIDENTS,
};

pub type DbPool = Arc<Mutex<SqliteConnection>>;

/// Open the SQLite database at `database_url`, creating the file if needed.
/// `:memory:` gives a private in-memory database.
pub fn init_db(database_url: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    Ok(Arc::new(Mutex::new(SqliteConnection::establish(database_url)?)))
}

fn lock(db: &DbPool) -> Result<std::sync::MutexGuard<'_, SqliteConnection>, Box<dyn std::error::Error>> {
    db.lock().map_err(|_| "database connection mutex poisoned".into())
}

/// Create tables and indexes. Safe to run on every start.
pub fn run_migrations(db: &DbPool) -> Result<(), Box<dyn std::error::Error>> {
    use diesel::sql_query;
    use diesel::RunQueryDsl;

    let mut conn = lock(db)?;

    let tables = vec![
        "CREATE TABLE IF NOT EXISTS students (
            id TEXT PRIMARY KEY NOT NULL,
            batch_id TEXT,
            created_at INTEGER NOT NULL
        )",

        "CREATE TABLE IF NOT EXISTS batches (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            max_attempts INTEGER,
            max_security_incidents INTEGER,
            enable_auto_suspend BOOLEAN,
            additional_security_incidents_after_removal INTEGER,
            additional_attempts_after_payment INTEGER,
            created_at INTEGER NOT NULL
        )",

        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",

        "CREATE TABLE IF NOT EXISTS security_incidents (
            id TEXT PRIMARY KEY NOT NULL,
            student_id TEXT NOT NULL,
            exam_id TEXT NOT NULL,
            incident_type TEXT NOT NULL,
            details TEXT NOT NULL DEFAULT '{}',
            reported_at INTEGER NOT NULL,
            user_agent TEXT,
            ip_address TEXT,
            caused_suspension BOOLEAN NOT NULL DEFAULT 0,
            handled_by_payment BOOLEAN NOT NULL DEFAULT 0,
            handled_at INTEGER,
            suspension_removal_payment_ref TEXT
        )",

        "CREATE TABLE IF NOT EXISTS exam_suspensions (
            id TEXT PRIMARY KEY NOT NULL,
            student_id TEXT NOT NULL,
            exam_id TEXT NOT NULL,
            incidents TEXT NOT NULL DEFAULT '[]',
            reason TEXT NOT NULL,
            suspension_time INTEGER NOT NULL,
            reviewed_by_admin BOOLEAN NOT NULL DEFAULT 0,
            admin_notes TEXT,
            reviewed_at INTEGER,
            reviewed_by TEXT,
            removed BOOLEAN NOT NULL DEFAULT 0,
            removed_at INTEGER
        )",

        "CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY NOT NULL,
            student_id TEXT NOT NULL,
            exam_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'created',
            payment_type TEXT NOT NULL,
            gateway_order_id TEXT NOT NULL,
            gateway_payment_id TEXT,
            additional_attempts INTEGER,
            additional_attempts_granted BOOLEAN NOT NULL DEFAULT 0,
            additional_attempts_granted_at INTEGER,
            reinstated_at INTEGER,
            created_at INTEGER NOT NULL
        )",

        "CREATE TABLE IF NOT EXISTS exam_results (
            id TEXT PRIMARY KEY NOT NULL,
            student_id TEXT NOT NULL,
            exam_id TEXT NOT NULL,
            score REAL NOT NULL,
            passed BOOLEAN NOT NULL,
            from_previous_payment_cycle BOOLEAN NOT NULL DEFAULT 0,
            submitted_at INTEGER NOT NULL
        )",
    ];

    for table_sql in tables {
        sql_query(table_sql).execute(&mut *conn)?;
    }
    tracing::debug!("Tables created/verified");

    // The partial unique index is what guarantees one active suspension per
    // (student, exam) across every server process sharing the database.
    let indexes = vec![
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_exam_suspensions_active
            ON exam_suspensions(student_id, exam_id) WHERE removed = 0",
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_payments_gateway_order ON payments(gateway_order_id)",
        "CREATE INDEX IF NOT EXISTS idx_security_incidents_pair ON security_incidents(student_id, exam_id)",
        "CREATE INDEX IF NOT EXISTS idx_exam_suspensions_pair ON exam_suspensions(student_id, exam_id)",
        "CREATE INDEX IF NOT EXISTS idx_payments_pair ON payments(student_id, exam_id)",
        "CREATE INDEX IF NOT EXISTS idx_exam_results_pair ON exam_results(student_id, exam_id)",
        "CREATE INDEX IF NOT EXISTS idx_students_batch ON students(batch_id)",
    ];

    for index_sql in indexes {
        sql_query(index_sql).execute(&mut *conn)?;
    }
    tracing::debug!("Indexes created/verified");

    Ok(())
}

/// Seed the global security settings unless an operator already set them.
pub fn seed_settings(db: &DbPool) -> Result<(), Box<dyn std::error::Error>> {
    use diesel::sql_query;
    use diesel::RunQueryDsl;

    let mut conn = lock(db)?;
    let now = chrono::Utc::now().timestamp();

    let defaults = [
        (SETTING_MAX_INCIDENTS, DEFAULT_MAX_INCIDENTS.to_string()),
        (SETTING_ENABLE_AUTO_SUSPEND, DEFAULT_ENABLE_AUTO_SUSPEND.to_string()),
    ];

    for (key, value) in defaults {
        let inserted = sql_query("INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?, ?, ?)")
            .bind::<diesel::sql_types::Text, _>(key)
            .bind::<diesel::sql_types::Text, _>(&value)
            .bind::<diesel::sql_types::BigInt, _>(now)
            .execute(&mut *conn)?;
        if inserted > 0 {
            tracing::info!("Seeded setting {} = {}", key, value);
        }
    }
    Ok(())
}
