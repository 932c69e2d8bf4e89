//! Durable persistence: accounts, per-(account, persona) turn logs, ritual
//! state rows, and migration records, all behind one sqlite connection.
//!
//! Read-then-write sequences that must be atomic (companion assignment,
//! migration status flips) run inside `with_tx`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, SeerError};
use crate::models::{
    AccountId, AccountProfile, GuestId, MigrationRecord, MigrationStatus, RitualState, Turn,
    TurnRole,
};
use crate::persona::Persona;
use crate::turn_log::TurnLog;

mod schema;

#[cfg(test)]
mod tests;

#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore").finish_non_exhaustive()
    }
}

impl SqliteStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.with_conn(schema::migrate)?;
        Ok(store)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| SeerError::mutex_poisoned("sqlite"))?;
        f(&conn)
    }

    fn with_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| SeerError::mutex_poisoned("sqlite"))?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        drop(conn);
        Ok(value)
    }

    // --- accounts ---

    /// Creates the account row if absent; returns the profile either way.
    pub fn upsert_account(&self, account_id: &AccountId) -> Result<AccountProfile> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO accounts(account_id, created_at) VALUES (?1, ?2)",
                params![account_id.as_str(), Utc::now().to_rfc3339()],
            )?;
            read_profile(tx, account_id)?
                .ok_or_else(|| SeerError::Internal("account row vanished after insert".into()))
        })
    }

    pub fn account_profile(&self, account_id: &AccountId) -> Result<Option<AccountProfile>> {
        self.with_conn(|conn| read_profile(conn, account_id))
    }

    pub fn set_nickname(&self, account_id: &AccountId, nickname: &str) -> Result<()> {
        let updated = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE accounts SET nickname = ?2 WHERE account_id = ?1",
                params![account_id.as_str(), nickname],
            )?)
        })?;
        if updated == 0 {
            return Err(SeerError::NotFound(format!(
                "account {}",
                account_id.as_str()
            )));
        }
        Ok(())
    }

    /// Atomic read-then-write for the companion field. An existing non-empty
    /// assignment always wins; the returned name is the durable truth.
    pub fn assign_companion_if_empty(
        &self,
        account_id: &AccountId,
        companion: &str,
    ) -> Result<String> {
        self.with_tx(|tx| {
            let existing: Option<Option<String>> = tx
                .query_row(
                    "SELECT companion FROM accounts WHERE account_id = ?1",
                    params![account_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                None => Err(SeerError::NotFound(format!(
                    "account {}",
                    account_id.as_str()
                ))),
                Some(Some(current)) if !current.is_empty() => Ok(current),
                Some(_) => {
                    tx.execute(
                        "UPDATE accounts SET companion = ?2 WHERE account_id = ?1",
                        params![account_id.as_str(), companion],
                    )?;
                    Ok(companion.to_string())
                }
            }
        })
    }

    // --- durable turn log ---

    /// Appends one turn, pruning the oldest rows first when the log is at
    /// the retention cap. Surviving ordinals are never rewritten.
    pub fn append_turn(
        &self,
        account_id: &AccountId,
        persona: Persona,
        role: TurnRole,
        text: &str,
        cap: usize,
    ) -> Result<u64> {
        self.with_tx(|tx| {
            let count: u64 = tx.query_row(
                "SELECT COUNT(*) FROM turns WHERE account_id = ?1 AND persona = ?2",
                params![account_id.as_str(), persona.id()],
                |row| row.get(0),
            )?;
            if count as usize >= cap {
                let overflow = count as usize - cap + 1;
                tx.execute(
                    "DELETE FROM turns WHERE account_id = ?1 AND persona = ?2 AND ordinal IN (
                         SELECT ordinal FROM turns WHERE account_id = ?1 AND persona = ?2
                         ORDER BY ordinal ASC LIMIT ?3
                     )",
                    params![account_id.as_str(), persona.id(), overflow as i64],
                )?;
            }
            let next: u64 = tx.query_row(
                "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM turns
                 WHERE account_id = ?1 AND persona = ?2",
                params![account_id.as_str(), persona.id()],
                |row| row.get(0),
            )?;
            let turn = Turn {
                role,
                text: text.to_string(),
                ordinal: next,
                created_at: Utc::now(),
            };
            tx.execute(
                "INSERT INTO turns(account_id, persona, ordinal, role, text, content_digest, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    account_id.as_str(),
                    persona.id(),
                    next,
                    role.as_str(),
                    turn.text,
                    turn.content_digest(),
                    turn.created_at.to_rfc3339(),
                ],
            )?;
            Ok(next)
        })
    }

    pub fn turns(&self, account_id: &AccountId, persona: Persona) -> Result<Vec<Turn>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT role, text, ordinal, created_at FROM turns
                 WHERE account_id = ?1 AND persona = ?2 ORDER BY ordinal ASC",
            )?;
            let rows = stmt.query_map(params![account_id.as_str(), persona.id()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            let mut turns = Vec::new();
            for row in rows {
                let (role, text, ordinal, created_at) = row?;
                turns.push(Turn {
                    role: TurnRole::parse(&role)?,
                    text,
                    ordinal,
                    created_at: parse_timestamp(&created_at)?,
                });
            }
            Ok(turns)
        })
    }

    pub fn reset_turns(&self, account_id: &AccountId, persona: Persona) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM turns WHERE account_id = ?1 AND persona = ?2",
                params![account_id.as_str(), persona.id()],
            )?;
            Ok(())
        })
    }

    pub fn count_user_turns(&self, account_id: &AccountId, persona: Persona) -> Result<u64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM turns
                 WHERE account_id = ?1 AND persona = ?2 AND role = 'user'",
                params![account_id.as_str(), persona.id()],
                |row| row.get(0),
            )?)
        })
    }

    /// Content digests of the last `limit` turns, oldest first. Used by the
    /// migration coordinator to detect an already-appended prefix.
    pub fn tail_digests(
        &self,
        account_id: &AccountId,
        persona: Persona,
        limit: usize,
    ) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT content_digest FROM (
                     SELECT content_digest, ordinal FROM turns
                     WHERE account_id = ?1 AND persona = ?2
                     ORDER BY ordinal DESC LIMIT ?3
                 ) ORDER BY ordinal ASC",
            )?;
            let rows = stmt.query_map(
                params![account_id.as_str(), persona.id(), limit as i64],
                |row| row.get::<_, String>(0),
            )?;
            let mut digests = Vec::new();
            for row in rows {
                digests.push(row?);
            }
            Ok(digests)
        })
    }

    /// Earliest user-authored turn text, for the ritual closing message.
    pub fn first_user_question(
        &self,
        account_id: &AccountId,
        persona: Persona,
    ) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT text FROM turns
                     WHERE account_id = ?1 AND persona = ?2 AND role = 'user'
                     ORDER BY ordinal ASC LIMIT 1",
                    params![account_id.as_str(), persona.id()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    // --- dialogue state (ritual + presentation floor) ---

    /// Current ritual state. A non-empty durable companion assignment
    /// overrides whatever the state row says: the assignment field is the
    /// single source of truth for completion.
    pub fn ritual_state(&self, account_id: &AccountId, persona: Persona) -> Result<RitualState> {
        self.with_conn(|conn| {
            let companion: Option<Option<String>> = conn
                .query_row(
                    "SELECT companion FROM accounts WHERE account_id = ?1",
                    params![account_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if matches!(&companion, Some(Some(name)) if !name.is_empty()) {
                return Ok(RitualState::Completed);
            }
            let raw: Option<String> = conn
                .query_row(
                    "SELECT ritual_state FROM dialogue_states
                     WHERE account_id = ?1 AND persona = ?2",
                    params![account_id.as_str(), persona.id()],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map_or(Ok(RitualState::NotStarted), |raw| RitualState::parse(&raw))
        })
    }

    pub fn set_ritual_state(
        &self,
        account_id: &AccountId,
        persona: Persona,
        state: RitualState,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO dialogue_states(account_id, persona, ritual_state, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id, persona) DO UPDATE SET
                   ritual_state = excluded.ritual_state,
                   updated_at = excluded.updated_at",
                params![
                    account_id.as_str(),
                    persona.id(),
                    state.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Presentation floor: turns at or below this ordinal are excluded from
    /// the recent window handed to the provider. The durable log keeps them.
    pub fn context_floor(&self, account_id: &AccountId, persona: Persona) -> Result<Option<u64>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT context_floor FROM dialogue_states
                     WHERE account_id = ?1 AND persona = ?2",
                    params![account_id.as_str(), persona.id()],
                    |row| row.get(0),
                )
                .optional()?
                .flatten())
        })
    }

    pub fn set_context_floor(
        &self,
        account_id: &AccountId,
        persona: Persona,
        floor: u64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO dialogue_states(account_id, persona, context_floor, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id, persona) DO UPDATE SET
                   context_floor = excluded.context_floor,
                   updated_at = excluded.updated_at",
                params![
                    account_id.as_str(),
                    persona.id(),
                    floor,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    // --- migration records ---

    pub fn migration_record(
        &self,
        guest_id: &GuestId,
        account_id: &AccountId,
    ) -> Result<Option<MigrationRecord>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT status, created_at, updated_at FROM migration_records
                     WHERE guest_id = ?1 AND account_id = ?2",
                    params![guest_id.as_str(), account_id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(status, created_at, updated_at)| {
                Ok(MigrationRecord {
                    guest_id: guest_id.clone(),
                    account_id: account_id.clone(),
                    status: MigrationStatus::parse(&status)?,
                    created_at: parse_timestamp(&created_at)?,
                    updated_at: parse_timestamp(&updated_at)?,
                })
            })
            .transpose()
        })
    }

    /// Creates a pending record, tolerating a retry that finds one already
    /// there. A pending record for the same guest but a different account is
    /// a conflict; the unique index backs this up.
    pub fn insert_migration_pending(
        &self,
        guest_id: &GuestId,
        account_id: &AccountId,
    ) -> Result<MigrationRecord> {
        self.with_tx(|tx| {
            let other_pending: Option<String> = tx
                .query_row(
                    "SELECT account_id FROM migration_records
                     WHERE guest_id = ?1 AND status = 'pending'",
                    params![guest_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(other) = other_pending
                && other != account_id.as_str()
            {
                return Err(SeerError::Conflict(format!(
                    "guest {} already has a pending migration to another account",
                    guest_id.as_str()
                )));
            }
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT OR IGNORE INTO migration_records
                     (guest_id, account_id, status, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?3)",
                params![guest_id.as_str(), account_id.as_str(), now],
            )?;
            Ok(())
        })?;
        self.migration_record(guest_id, account_id)?
            .ok_or_else(|| SeerError::Internal("migration record vanished after insert".into()))
    }

    /// Guest side of the pending migration targeting `account_id`, if any.
    pub fn pending_migration_guest(&self, account_id: &AccountId) -> Result<Option<GuestId>> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT guest_id FROM migration_records
                     WHERE account_id = ?1 AND status = 'pending'",
                    params![account_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(GuestId::new).transpose()
        })
    }

    /// Flips a record to done. Already-done records are left untouched.
    pub fn mark_migration_done(
        &self,
        guest_id: &GuestId,
        account_id: &AccountId,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE migration_records SET status = 'done', updated_at = ?3
                 WHERE guest_id = ?1 AND account_id = ?2 AND status = 'pending'",
                params![
                    guest_id.as_str(),
                    account_id.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Handle on the durable turn log for one (account, persona).
    #[must_use]
    pub fn durable_log(&self, account_id: AccountId, persona: Persona, cap: usize) -> DurableLog {
        DurableLog {
            store: self.clone(),
            account_id,
            persona,
            cap,
        }
    }
}

/// [`TurnLog`] view over the sqlite turns table for one (account, persona).
#[derive(Debug, Clone)]
pub struct DurableLog {
    store: SqliteStateStore,
    account_id: AccountId,
    persona: Persona,
    cap: usize,
}

impl TurnLog for DurableLog {
    fn append(&self, role: TurnRole, text: &str) -> Result<u64> {
        self.store
            .append_turn(&self.account_id, self.persona, role, text, self.cap)
    }

    fn turns(&self) -> Result<Vec<Turn>> {
        self.store.turns(&self.account_id, self.persona)
    }

    fn reset(&self) -> Result<()> {
        self.store.reset_turns(&self.account_id, self.persona)
    }

    fn recount(&self) -> Result<u64> {
        self.store.count_user_turns(&self.account_id, self.persona)
    }
}

fn read_profile(conn: &Connection, account_id: &AccountId) -> Result<Option<AccountProfile>> {
    let row = conn
        .query_row(
            "SELECT nickname, companion, created_at FROM accounts WHERE account_id = ?1",
            params![account_id.as_str()],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    row.map(|(nickname, companion, created_at)| {
        Ok(AccountProfile {
            account_id: account_id.clone(),
            nickname,
            companion,
            created_at: parse_timestamp(&created_at)?,
        })
    })
    .transpose()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| SeerError::Internal(format!("bad stored timestamp {raw:?}: {err}")))
}
