//! The companion-assignment ritual: a monotonic state machine with one
//! permitted backward edge (decline from `Proposed`) and a permanent
//! terminal state.
//!
//! The assignment itself is a pure function of the account id, so an
//! interrupted ritual recomputes the identical companion on resume.

use tracing::debug;

use crate::error::{Result, SeerError};
use crate::models::{AccountId, RitualState};

/// Closed table of assignable companions. Order matters: the deterministic
/// pick indexes into it, so entries are append-only.
pub const COMPANIONS: [&str; 24] = [
    "Drifting Petal of First Spring",
    "Moonlit Veil of Quiet Dreams",
    "Starfall Over the Night Meadow",
    "Morning Dew of New Hope",
    "Gentle Glow of the Evening Sky",
    "Bridge of the Seven-Colored Arc",
    "Blossom Swaying in the Spring Wind",
    "Stillness of the First Snowfall",
    "Cool Chime of the Summer Bell",
    "Chorus of the High-Summer Cicadas",
    "Path of the Falling Crimson Leaves",
    "Gift of the Season's First Snow",
    "Field of Golden Rapeseed",
    "Fireflies of the Twilight Hour",
    "Dream Afloat on the Sea of Clouds",
    "Lullaby of the Breaking Waves",
    "Quench of the Morning Mist",
    "Carpet of the Fallen Leaves",
    "Shimmer of the Spring Haze",
    "Song of the Waking Birds",
    "Murmur of the Mountain Brook",
    "Pinwheel of the Open Meadow",
    "Wisteria in Pale Bloom",
    "Golden Ears of Autumn Grain",
];

/// Deterministic companion for an account. Hashing the id and indexing the
/// fixed table means retries and resumed rituals always agree.
#[must_use]
pub fn assign_companion(account_id: &AccountId) -> &'static str {
    let digest = blake3::hash(account_id.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    let index = (u64::from_le_bytes(prefix) % COMPANIONS.len() as u64) as usize;
    COMPANIONS[index]
}

/// An externally observed ritual event, as reported by the client or
/// inferred from the dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RitualEvent {
    Propose,
    Accept,
    Decline,
    Begin,
    Complete,
}

impl RitualEvent {
    fn target(self) -> RitualState {
        match self {
            Self::Propose => RitualState::Proposed,
            Self::Accept => RitualState::Accepted,
            Self::Decline => RitualState::NotStarted,
            Self::Begin => RitualState::InProgress,
            Self::Complete => RitualState::Completed,
        }
    }
}

/// Result of applying an event to the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RitualTransition {
    /// The state advanced (or, for decline, reset to `NotStarted`).
    Applied(RitualState),
    /// The event targets a state already reached or left behind. Absorbed
    /// without side effects.
    Duplicate,
}

impl RitualTransition {
    #[must_use]
    pub fn state_after(self, current: RitualState) -> RitualState {
        match self {
            Self::Applied(next) => next,
            Self::Duplicate => current,
        }
    }
}

fn successor(state: RitualState) -> Option<RitualState> {
    match state {
        RitualState::NotStarted => Some(RitualState::Proposed),
        RitualState::Proposed => Some(RitualState::Accepted),
        RitualState::Accepted => Some(RitualState::InProgress),
        RitualState::InProgress => Some(RitualState::Completed),
        RitualState::Completed => None,
    }
}

/// Applies `event` to `current`. Duplicate and stale events are absorbed;
/// forward skips and invalid declines are rejected so a buggy client can
/// never push the machine into an unreachable state.
pub fn apply(current: RitualState, event: RitualEvent) -> Result<RitualTransition> {
    if current.is_terminal() {
        debug!(?event, "ritual event after completion absorbed");
        return Ok(RitualTransition::Duplicate);
    }
    if event == RitualEvent::Decline {
        return match current {
            RitualState::Proposed => Ok(RitualTransition::Applied(RitualState::NotStarted)),
            RitualState::NotStarted => {
                debug!("decline without an open proposal absorbed");
                Ok(RitualTransition::Duplicate)
            }
            other => Err(SeerError::InvariantViolation(format!(
                "cannot decline ritual from {}",
                other.as_str()
            ))),
        };
    }
    let target = event.target();
    if target <= current {
        debug!(
            current = current.as_str(),
            target = target.as_str(),
            "stale ritual event absorbed"
        );
        return Ok(RitualTransition::Duplicate);
    }
    if successor(current) == Some(target) {
        return Ok(RitualTransition::Applied(target));
    }
    Err(SeerError::InvariantViolation(format!(
        "ritual cannot move from {} to {}",
        current.as_str(),
        target.as_str()
    )))
}
