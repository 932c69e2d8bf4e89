//! The phase gate: a pure, total function from `(turn_count, tier,
//! ritual_state)` to what the agent is allowed to do next. No wall-clock,
//! no randomness, no hidden state.

use crate::config::{
    PHASE_DEEPENING_FLOOR, PHASE_FOLLOW_UP_TURN, PHASE_ORIENTATION_TURN, PHASE_SYNTHESIS_TURN,
};
use crate::models::{Phase, RitualState};

/// Outcome of evaluating the gate for one inbound user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The guest has exhausted the free-turn ceiling. The orchestrator must
    /// not call the provider or append the turn.
    RegistrationRequired,
    /// Proceed in the given phase.
    Proceed(Phase),
}

/// Dialogue phase for the user turn numbered `turn_number` (1-based, the
/// incoming turn included). Same inputs always yield the same phase.
#[must_use]
pub fn phase_of(turn_number: u64, ritual: RitualState) -> Phase {
    match turn_number {
        0 | PHASE_ORIENTATION_TURN => Phase::Orientation,
        PHASE_FOLLOW_UP_TURN => Phase::FollowUp,
        PHASE_SYNTHESIS_TURN => Phase::Synthesis,
        n if n >= PHASE_DEEPENING_FLOOR && ritual.is_terminal() => Phase::Ongoing,
        _ => Phase::Deepening,
    }
}

/// Evaluates the registration ceiling before any phase logic.
/// `prior_turn_count` is the reconciled user-turn count before the incoming
/// turn; a guest at or past the ceiling is blocked regardless of phase or
/// ritual state.
#[must_use]
pub fn evaluate_gate(
    prior_turn_count: u64,
    is_account: bool,
    ritual: RitualState,
    guest_turn_ceiling: u64,
) -> GateDecision {
    if !is_account && prior_turn_count >= guest_turn_ceiling {
        return GateDecision::RegistrationRequired;
    }
    GateDecision::Proceed(phase_of(prior_turn_count + 1, ritual))
}

/// Whether the ritual may move from `NotStarted` to `Proposed` on this turn.
/// Only accounts in the deepening phase are eligible.
#[must_use]
pub fn may_propose_ritual(phase: Phase, is_account: bool, ritual: RitualState) -> bool {
    is_account && phase == Phase::Deepening && ritual == RitualState::NotStarted
}
