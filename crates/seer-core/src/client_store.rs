//! Client-local storage for a guest's ephemeral turn log and its cached
//! counter, scoped per (guest, persona) with no cross-persona sharing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::warn;

use crate::error::{Result, SeerError};
use crate::models::{GuestId, Turn, TurnRole};
use crate::persona::Persona;
use crate::turn_log::{TurnLog, count_user_turns};

/// Storage scope for one guest's conversation with one persona.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientScope {
    pub guest_id: GuestId,
    pub persona: Persona,
}

impl ClientScope {
    #[must_use]
    pub fn new(guest_id: GuestId, persona: Persona) -> Self {
        Self { guest_id, persona }
    }

    #[must_use]
    fn storage_key(&self) -> String {
        format!("{}_{}", self.guest_id.as_str(), self.persona.id())
    }
}

/// Raw get/set/clear access to device storage. Values are opaque to the
/// store; the log format belongs to [`EphemeralLog`].
pub trait ClientStore: Send + Sync {
    fn read_raw(&self, scope: &ClientScope) -> Result<Option<String>>;
    fn write_raw(&self, scope: &ClientScope, raw: &str) -> Result<()>;
    fn read_counter(&self, scope: &ClientScope) -> Result<Option<u64>>;
    fn write_counter(&self, scope: &ClientScope, value: u64) -> Result<()>;
    /// Removes both the log and its counter cache.
    fn clear(&self, scope: &ClientScope) -> Result<()>;
}

/// The guest-side turn log: JSONL in client storage, parsed tolerantly. A
/// corrupt line is skipped and a fully unreadable log is treated as empty,
/// never fatal; the session continues as a fresh guest.
#[derive(Clone)]
pub struct EphemeralLog {
    store: Arc<dyn ClientStore>,
    scope: ClientScope,
}

impl std::fmt::Debug for EphemeralLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralLog")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl EphemeralLog {
    #[must_use]
    pub fn new(store: Arc<dyn ClientStore>, scope: ClientScope) -> Self {
        Self { store, scope }
    }

    #[must_use]
    pub fn scope(&self) -> &ClientScope {
        &self.scope
    }

    /// Recounts from the log and overwrites the cached counter with the
    /// result. The cache never influences the outcome.
    pub fn reconcile(&self) -> Result<u64> {
        let cached = self.store.read_counter(&self.scope).unwrap_or_else(|err| {
            warn!(error = %err, "counter cache unreadable; treating as absent");
            None
        });
        let counted = crate::turn_log::reconcile(self, cached)?;
        self.store.write_counter(&self.scope, counted)?;
        Ok(counted)
    }

    fn load_turns(&self) -> Vec<Turn> {
        let raw = match self.store.read_raw(&self.scope) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(error = %err, "ephemeral log unreadable; treating as empty");
                return Vec::new();
            }
        };
        let (turns, skipped) = parse_turn_lines(&raw);
        if skipped > 0 {
            warn!(
                skipped,
                kept = turns.len(),
                "ephemeral log contained unparseable lines"
            );
        }
        turns
    }

    fn store_turns(&self, turns: &[Turn]) -> Result<()> {
        let mut raw = String::new();
        for turn in turns {
            raw.push_str(&serde_json::to_string(turn)?);
            raw.push('\n');
        }
        self.store.write_raw(&self.scope, &raw)
    }
}

impl TurnLog for EphemeralLog {
    fn append(&self, role: TurnRole, text: &str) -> Result<u64> {
        let mut turns = self.load_turns();
        let ordinal = turns.last().map_or(1, |turn| turn.ordinal + 1);
        turns.push(Turn {
            role,
            text: text.to_string(),
            ordinal,
            created_at: Utc::now(),
        });
        self.store_turns(&turns)?;
        Ok(ordinal)
    }

    fn turns(&self) -> Result<Vec<Turn>> {
        Ok(self.load_turns())
    }

    fn reset(&self) -> Result<()> {
        self.store.clear(&self.scope)
    }

    fn recount(&self) -> Result<u64> {
        Ok(count_user_turns(&self.load_turns()))
    }
}

fn parse_turn_lines(raw: &str) -> (Vec<Turn>, usize) {
    let mut turns = Vec::new();
    let mut skipped = 0usize;
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Turn>(line) {
            Ok(turn) => turns.push(turn),
            Err(_) => skipped += 1,
        }
    }
    (turns, skipped)
}

#[derive(Debug, Default, Clone)]
struct MemoryEntry {
    raw: Option<String>,
    counter: Option<u64>,
}

/// In-memory client store for tests and ephemeral CLI sessions.
#[derive(Default)]
pub struct MemoryClientStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryClientStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        scope: &ClientScope,
        f: impl FnOnce(&mut MemoryEntry) -> T,
    ) -> Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SeerError::mutex_poisoned("client store"))?;
        Ok(f(entries.entry(scope.storage_key()).or_default()))
    }
}

impl ClientStore for MemoryClientStore {
    fn read_raw(&self, scope: &ClientScope) -> Result<Option<String>> {
        self.with_entry(scope, |entry| entry.raw.clone())
    }

    fn write_raw(&self, scope: &ClientScope, raw: &str) -> Result<()> {
        self.with_entry(scope, |entry| entry.raw = Some(raw.to_string()))
    }

    fn read_counter(&self, scope: &ClientScope) -> Result<Option<u64>> {
        self.with_entry(scope, |entry| entry.counter)
    }

    fn write_counter(&self, scope: &ClientScope, value: u64) -> Result<()> {
        self.with_entry(scope, |entry| entry.counter = Some(value))
    }

    fn clear(&self, scope: &ClientScope) -> Result<()> {
        self.with_entry(scope, |entry| *entry = MemoryEntry::default())
    }
}

/// File-backed client store: one JSONL file plus one counter file per scope
/// under a root directory. Stands in for device storage when running the
/// session loop locally.
#[derive(Debug, Clone)]
pub struct FileClientStore {
    root: PathBuf,
}

impl FileClientStore {
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn log_path(&self, scope: &ClientScope) -> PathBuf {
        self.root.join(format!("{}.jsonl", scope.storage_key()))
    }

    fn counter_path(&self, scope: &ClientScope) -> PathBuf {
        self.root.join(format!("{}.count", scope.storage_key()))
    }

    fn read_file(path: &Path) -> Result<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_file(&self, path: &Path, raw: &str) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    fn remove_file(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl ClientStore for FileClientStore {
    fn read_raw(&self, scope: &ClientScope) -> Result<Option<String>> {
        Self::read_file(&self.log_path(scope))
    }

    fn write_raw(&self, scope: &ClientScope, raw: &str) -> Result<()> {
        self.write_file(&self.log_path(scope), raw)
    }

    fn read_counter(&self, scope: &ClientScope) -> Result<Option<u64>> {
        let raw = Self::read_file(&self.counter_path(scope))?;
        Ok(raw.and_then(|value| value.trim().parse::<u64>().ok()))
    }

    fn write_counter(&self, scope: &ClientScope, value: u64) -> Result<()> {
        self.write_file(&self.counter_path(scope), &value.to_string())
    }

    fn clear(&self, scope: &ClientScope) -> Result<()> {
        Self::remove_file(&self.log_path(scope))?;
        Self::remove_file(&self.counter_path(scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ClientScope {
        ClientScope::new(GuestId::new("g-1").expect("guest id"), Persona::Sable)
    }

    fn ephemeral(store: Arc<dyn ClientStore>) -> EphemeralLog {
        EphemeralLog::new(store, scope())
    }

    #[test]
    fn append_assigns_sequential_ordinals() {
        let log = ephemeral(Arc::new(MemoryClientStore::new()));
        assert_eq!(log.append(TurnRole::User, "q1").expect("append"), 1);
        assert_eq!(log.append(TurnRole::Agent, "a1").expect("append"), 2);
        assert_eq!(log.append(TurnRole::User, "q2").expect("append"), 3);
        assert_eq!(log.recount().expect("recount"), 2);
    }

    #[test]
    fn corrupt_log_lines_are_skipped_not_fatal() {
        let store = Arc::new(MemoryClientStore::new());
        let log = ephemeral(store.clone());
        log.append(TurnRole::User, "q1").expect("append");

        let mut raw = store.read_raw(&scope()).expect("read").expect("some");
        raw.push_str("{not json}\n");
        store.write_raw(&scope(), &raw).expect("write");

        assert_eq!(log.recount().expect("recount"), 1);
        // Appending after corruption keeps the surviving tail and continues.
        log.append(TurnRole::User, "q2").expect("append");
        assert_eq!(log.recount().expect("recount"), 2);
    }

    #[test]
    fn fully_corrupt_log_is_treated_as_empty() {
        let store = Arc::new(MemoryClientStore::new());
        store
            .write_raw(&scope(), "garbage\nmore garbage\n")
            .expect("write");
        let log = ephemeral(store);
        assert_eq!(log.recount().expect("recount"), 0);
        assert!(log.turns().expect("turns").is_empty());
    }

    #[test]
    fn reconcile_overwrites_stale_counter_cache() {
        let store = Arc::new(MemoryClientStore::new());
        let log = ephemeral(store.clone());
        log.append(TurnRole::User, "q1").expect("append");
        store.write_counter(&scope(), 9).expect("seed stale cache");

        assert_eq!(log.reconcile().expect("reconcile"), 1);
        assert_eq!(store.read_counter(&scope()).expect("read"), Some(1));
    }

    #[test]
    fn empty_log_reconcile_zeroes_nonzero_cache() {
        let store = Arc::new(MemoryClientStore::new());
        store.write_counter(&scope(), 4).expect("seed cache");
        let log = ephemeral(store.clone());

        assert_eq!(log.reconcile().expect("reconcile"), 0);
        assert_eq!(store.read_counter(&scope()).expect("read"), Some(0));
    }

    #[test]
    fn reset_clears_log_and_counter_together() {
        let store = Arc::new(MemoryClientStore::new());
        let log = ephemeral(store.clone());
        log.append(TurnRole::User, "q1").expect("append");
        log.reconcile().expect("reconcile");

        log.reset().expect("reset");
        assert!(log.turns().expect("turns").is_empty());
        assert_eq!(store.read_counter(&scope()).expect("read"), None);
    }

    #[test]
    fn file_store_round_trips_log_and_counter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileClientStore::new(temp.path()));
        let log = ephemeral(store.clone());

        log.append(TurnRole::User, "q1").expect("append");
        log.append(TurnRole::Agent, "a1").expect("append");
        assert_eq!(log.reconcile().expect("reconcile"), 1);

        let reopened = ephemeral(store);
        let turns = reopened.turns().expect("turns");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "q1");
    }

    #[test]
    fn scopes_do_not_share_state_across_personas() {
        let store: Arc<dyn ClientStore> = Arc::new(MemoryClientStore::new());
        let sable = EphemeralLog::new(
            store.clone(),
            ClientScope::new(GuestId::new("g-1").expect("id"), Persona::Sable),
        );
        let vesper = EphemeralLog::new(
            store,
            ClientScope::new(GuestId::new("g-1").expect("id"), Persona::Vesper),
        );

        sable.append(TurnRole::User, "q1").expect("append");
        assert_eq!(vesper.recount().expect("recount"), 0);
    }
}
