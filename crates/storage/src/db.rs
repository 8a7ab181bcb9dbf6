use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    connect(&format!("sqlite:{}?mode=rwc", path.display())).await
}

/// In-memory database, used by tests.
pub async fn create_db_in_memory() -> Result<DbPool, sqlx::Error> {
    connect("sqlite::memory:").await
}

async fn connect(url: &str) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(url)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bank_transactions (
            reference TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            profile_id INTEGER NOT NULL,
            direction TEXT NOT NULL,
            kind TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            amount TEXT NOT NULL,
            currency TEXT NOT NULL,
            description TEXT,
            payment_reference TEXT,
            counterparty_name TEXT,
            counterparty_account TEXT,
            from_amount TEXT,
            from_currency TEXT,
            exchange_rate TEXT,
            fees TEXT,
            merchant_name TEXT,
            merchant_category TEXT,
            card_last4 TEXT,
            card_holder TEXT,
            running_balance TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            status_reason TEXT,
            last_attempt_at TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            best_confidence TEXT,
            suggestion_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tx_entity_date ON bank_transactions (entity, occurred_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tx_status ON bank_transactions (status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tx_profile_date ON bank_transactions (profile_id, occurred_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tx_suggestion ON bank_transactions (suggestion_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_cursors (
            profile_id INTEGER NOT NULL,
            currency TEXT NOT NULL,
            entity TEXT NOT NULL,
            balance_id INTEGER,
            last_synced_at TEXT,
            last_end_date TEXT,
            status TEXT NOT NULL DEFAULT 'idle',
            error TEXT,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (profile_id, currency)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tx_leases (
            reference TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS patterns (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            value TEXT NOT NULL,
            regex TEXT,
            target_kind TEXT NOT NULL,
            target_id TEXT NOT NULL,
            target_name TEXT NOT NULL,
            auto_approve INTEGER NOT NULL DEFAULT 0,
            boost TEXT NOT NULL,
            times_used INTEGER NOT NULL DEFAULT 0,
            times_approved INTEGER NOT NULL DEFAULT 0,
            times_rejected INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            vector BLOB,
            UNIQUE (kind, value, target_kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_reviews (
            suggestion_id TEXT NOT NULL,
            reviewed_at TEXT NOT NULL,
            PRIMARY KEY (suggestion_id, reviewed_at)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS learning_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_polled_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
