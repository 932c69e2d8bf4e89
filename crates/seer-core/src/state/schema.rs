use rusqlite::Connection;

use crate::error::Result;

const SCHEMA_SQL: &str = r"
    PRAGMA journal_mode = WAL;
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS accounts (
        account_id TEXT PRIMARY KEY,
        nickname TEXT,
        companion TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS turns (
        account_id TEXT NOT NULL,
        persona TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        role TEXT NOT NULL,
        text TEXT NOT NULL,
        content_digest TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (account_id, persona, ordinal)
    );

    CREATE INDEX IF NOT EXISTS idx_turns_digest
    ON turns(account_id, persona, content_digest);

    CREATE TABLE IF NOT EXISTS dialogue_states (
        account_id TEXT NOT NULL,
        persona TEXT NOT NULL,
        ritual_state TEXT NOT NULL DEFAULT 'not_started',
        context_floor INTEGER,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (account_id, persona)
    );

    CREATE TABLE IF NOT EXISTS migration_records (
        guest_id TEXT NOT NULL,
        account_id TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (guest_id, account_id)
    );

    -- At most one pending migration per guest, enforced by the store.
    CREATE UNIQUE INDEX IF NOT EXISTS idx_migration_pending_guest
    ON migration_records(guest_id) WHERE status = 'pending';
";

pub(super) fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
