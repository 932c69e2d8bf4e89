//! The shared turn-log contract and the counter reconciler.
//!
//! A cached turn counter is a derived value; the log is ground truth. The
//! reconciler therefore always returns the recount and treats any cached
//! value, higher or lower, as drift to be overwritten.

use tracing::debug;

use crate::error::Result;
use crate::models::{Turn, TurnRole};

/// Ordered, append-only sequence of turns for one (subject, persona) pair.
/// Implemented by both the client-local ephemeral log and the server-side
/// durable log.
pub trait TurnLog {
    /// Appends a turn and returns its ordinal.
    fn append(&self, role: TurnRole, text: &str) -> Result<u64>;

    /// All turns in ordinal order.
    fn turns(&self) -> Result<Vec<Turn>>;

    /// Whole-log reset. Distinct from normal flow; normal flow never edits
    /// or removes turns.
    fn reset(&self) -> Result<()>;

    /// Scans the log and counts user-role turns.
    fn recount(&self) -> Result<u64> {
        Ok(count_user_turns(&self.turns()?))
    }
}

#[must_use]
pub fn count_user_turns(turns: &[Turn]) -> u64 {
    turns
        .iter()
        .filter(|turn| turn.role == TurnRole::User)
        .count() as u64
}

/// Returns the authoritative user-turn count for `log`. A cached value is
/// only consulted to report drift; it never influences the result, so an
/// empty log reconciles to 0 over any stale cache in either direction.
pub fn reconcile(log: &dyn TurnLog, cached: Option<u64>) -> Result<u64> {
    let counted = log.recount()?;
    if let Some(cached) = cached
        && cached != counted
    {
        debug!(cached, counted, "turn counter drift corrected from recount");
    }
    Ok(counted)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;

    #[derive(Default)]
    struct VecLog {
        turns: Mutex<Vec<Turn>>,
    }

    impl TurnLog for VecLog {
        fn append(&self, role: TurnRole, text: &str) -> Result<u64> {
            let mut turns = self.turns.lock().expect("lock");
            let ordinal = turns.last().map_or(1, |turn| turn.ordinal + 1);
            turns.push(Turn {
                role,
                text: text.to_string(),
                ordinal,
                created_at: Utc::now(),
            });
            Ok(ordinal)
        }

        fn turns(&self) -> Result<Vec<Turn>> {
            Ok(self.turns.lock().expect("lock").clone())
        }

        fn reset(&self) -> Result<()> {
            self.turns.lock().expect("lock").clear();
            Ok(())
        }
    }

    #[test]
    fn recount_counts_only_user_turns() {
        let log = VecLog::default();
        log.append(TurnRole::User, "q1").expect("append");
        log.append(TurnRole::Agent, "a1").expect("append");
        log.append(TurnRole::User, "q2").expect("append");
        assert_eq!(log.recount().expect("recount"), 2);
    }

    #[test]
    fn reconcile_corrects_stale_cache_in_both_directions() {
        let log = VecLog::default();
        log.append(TurnRole::User, "q1").expect("append");

        assert_eq!(reconcile(&log, Some(0)).expect("low cache"), 1);
        assert_eq!(reconcile(&log, Some(7)).expect("high cache"), 1);
        assert_eq!(reconcile(&log, None).expect("no cache"), 1);
    }

    #[test]
    fn empty_log_reconciles_to_zero_over_stale_nonzero_cache() {
        let log = VecLog::default();
        assert_eq!(reconcile(&log, Some(5)).expect("reconcile"), 0);
    }

    #[test]
    fn reset_clears_the_log() {
        let log = VecLog::default();
        let first = log.append(TurnRole::User, "q1").expect("append");
        let second = log.append(TurnRole::Agent, "a1").expect("append");
        assert!(second > first);
        log.reset().expect("reset");
        assert_eq!(log.recount().expect("recount"), 0);
    }
}
