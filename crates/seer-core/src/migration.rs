//! One-time transfer of a guest's ephemeral history into the durable log.
//!
//! Idempotent under retries at every step: a done record is a no-op, and a
//! pending record whose turns already landed (wholly or partly) resumes by
//! digest comparison instead of re-appending.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::client_store::{ClientScope, ClientStore, EphemeralLog};
use crate::error::{Result, SeerError};
use crate::models::{AccountId, GuestId, MigrationRecord, MigrationStatus, Turn};
use crate::persona::Persona;
use crate::state::SqliteStateStore;
use crate::turn_log::TurnLog;

/// Drives the guest-to-account history migration. One record governs the
/// whole (guest, account) pair; every persona scope moves under it.
#[derive(Clone)]
pub struct MigrationCoordinator {
    store: SqliteStateStore,
    client: Arc<dyn ClientStore>,
    durable_log_cap: usize,
    // Commit runs single-writer per (guest, account) pair. Callers lock
    // their own subject key, which differs between the registration path
    // (guest) and the account-turn path (account), so the pair lock lives
    // here where both paths converge.
    pair_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl std::fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationCoordinator")
            .field("durable_log_cap", &self.durable_log_cap)
            .finish_non_exhaustive()
    }
}

impl MigrationCoordinator {
    #[must_use]
    pub fn new(
        store: SqliteStateStore,
        client: Arc<dyn ClientStore>,
        durable_log_cap: usize,
    ) -> Self {
        Self {
            store,
            client,
            durable_log_cap,
            pair_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn pair_lock(&self, guest_id: &GuestId, account_id: &AccountId) -> Result<Arc<Mutex<()>>> {
        let key = format!("{}\x1f{}", guest_id.as_str(), account_id.as_str());
        let mut locks = self
            .pair_locks
            .lock()
            .map_err(|_| SeerError::mutex_poisoned("migration lock registry"))?;
        Ok(locks.entry(key).or_default().clone())
    }

    /// Creates (or re-reads) the migration record for this pair. Called on
    /// registration when ephemeral history exists; duplicate calls return
    /// the existing record.
    pub fn begin(&self, guest_id: &GuestId, account_id: &AccountId) -> Result<MigrationRecord> {
        self.store.insert_migration_pending(guest_id, account_id)
    }

    /// Appends every ephemeral turn to the durable log in ordinal order,
    /// flips the record to done, then clears the ephemeral side. Safe to
    /// call again after any partial failure.
    pub fn commit(&self, guest_id: &GuestId, account_id: &AccountId) -> Result<MigrationRecord> {
        let lock = self.pair_lock(guest_id, account_id)?;
        let _guard: MutexGuard<'_, ()> = lock
            .lock()
            .map_err(|_| SeerError::mutex_poisoned("migration pair"))?;
        let record = match self.store.migration_record(guest_id, account_id)? {
            Some(record) => record,
            None => self.begin(guest_id, account_id)?,
        };
        if record.status == MigrationStatus::Done {
            debug!(
                guest = guest_id.as_str(),
                account = account_id.as_str(),
                "migration already done; commit absorbed"
            );
            return Ok(record);
        }

        let mut migrated = 0usize;
        for persona in Persona::ALL {
            migrated += self.migrate_scope(guest_id, account_id, persona)?;
        }
        self.store.mark_migration_done(guest_id, account_id)?;
        for persona in Persona::ALL {
            self.ephemeral(guest_id, persona).reset()?;
        }
        info!(
            guest = guest_id.as_str(),
            account = account_id.as_str(),
            migrated,
            "guest history migrated"
        );
        self.store
            .migration_record(guest_id, account_id)?
            .ok_or_else(|| SeerError::Internal("migration record vanished after commit".into()))
    }

    /// Whether any persona scope still holds ephemeral history for `guest`.
    pub fn has_ephemeral_history(&self, guest_id: &GuestId) -> Result<bool> {
        for persona in Persona::ALL {
            if !self.ephemeral(guest_id, persona).turns()?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn ephemeral(&self, guest_id: &GuestId, persona: Persona) -> EphemeralLog {
        EphemeralLog::new(
            self.client.clone(),
            ClientScope::new(guest_id.clone(), persona),
        )
    }

    fn migrate_scope(
        &self,
        guest_id: &GuestId,
        account_id: &AccountId,
        persona: Persona,
    ) -> Result<usize> {
        let turns = self.ephemeral(guest_id, persona).turns()?;
        if turns.is_empty() {
            return Ok(0);
        }
        let tail = self
            .store
            .tail_digests(account_id, persona, turns.len())?;
        let skip = already_appended_prefix(&tail, &turns);
        if skip > 0 {
            debug!(
                persona = persona.id(),
                skip, "resuming migration past already-appended prefix"
            );
        }
        let durable = self
            .store
            .durable_log(account_id.clone(), persona, self.durable_log_cap);
        for turn in &turns[skip..] {
            durable.append(turn.role, &turn.text)?;
        }
        Ok(turns.len() - skip)
    }
}

/// Length of the ephemeral prefix already present at the durable tail, by
/// content digest. A crashed commit leaves the durable log ending with some
/// prefix of the ephemeral turns; everything after it still needs appending.
fn already_appended_prefix(tail_digests: &[String], turns: &[Turn]) -> usize {
    let digests: Vec<String> = turns.iter().map(Turn::content_digest).collect();
    let max = tail_digests.len().min(digests.len());
    for k in (1..=max).rev() {
        if tail_digests[tail_digests.len() - k..] == digests[..k] {
            return k;
        }
    }
    0
}
