use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            id               TEXT PRIMARY KEY,
            email            TEXT NOT NULL UNIQUE,
            first_name       TEXT NOT NULL,
            last_name        TEXT NOT NULL,
            password         TEXT NOT NULL,
            role             TEXT NOT NULL DEFAULT 'seeker'
                             CHECK (role IN ('seeker', 'owner', 'manager', 'admin')),
            is_active        INTEGER NOT NULL DEFAULT 0,
            is_staff         INTEGER NOT NULL DEFAULT 0,
            is_otp_verified  INTEGER NOT NULL DEFAULT 0,
            date_joined      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- One device per account; the secret stays empty until first use.
        CREATE TABLE IF NOT EXISTS otp_devices (
            id                  TEXT PRIMARY KEY,
            user_id             TEXT NOT NULL UNIQUE REFERENCES accounts(id) ON DELETE CASCADE,
            name                TEXT NOT NULL DEFAULT 'default',
            secret              TEXT NOT NULL DEFAULT '',
            confirmed           INTEGER NOT NULL DEFAULT 1,
            last_challenge_at   INTEGER,
            last_verified_step  INTEGER,
            failure_count       INTEGER NOT NULL DEFAULT 0,
            last_failure_at     INTEGER,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
