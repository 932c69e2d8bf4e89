//! Central configuration. The guest ceiling and phase boundaries live here
//! and nowhere else; every call site reads the named values instead of
//! carrying its own copy.

const GUEST_TURN_CEILING_ENV: &str = "SEER_GUEST_TURN_CEILING";
const RECENT_CONTEXT_LIMIT_ENV: &str = "SEER_RECENT_CONTEXT_LIMIT";
const DURABLE_LOG_CAP_ENV: &str = "SEER_DURABLE_LOG_CAP";
const PROVIDER_MAX_RETRIES_ENV: &str = "SEER_PROVIDER_MAX_RETRIES";
const PROVIDER_BACKOFF_MS_ENV: &str = "SEER_PROVIDER_BACKOFF_MS";
const PROVIDER_TIMEOUT_MS_ENV: &str = "SEER_PROVIDER_TIMEOUT_MS";
const PROVIDER_FAILURE_THRESHOLD_ENV: &str = "SEER_PROVIDER_FAILURE_THRESHOLD";
const PROVIDER_COOLDOWN_MS_ENV: &str = "SEER_PROVIDER_COOLDOWN_MS";

const DEFAULT_GUEST_TURN_CEILING: u64 = 10;
const DEFAULT_RECENT_CONTEXT_LIMIT: usize = 12;
const DEFAULT_DURABLE_LOG_CAP: usize = 100;
const DEFAULT_PROVIDER_MAX_RETRIES: u32 = 3;
const DEFAULT_PROVIDER_BACKOFF_MS: u64 = 300;
const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PROVIDER_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_PROVIDER_COOLDOWN_MS: u64 = 300_000;

/// Phase boundaries (user-turn counts). These are part of the dialogue
/// contract, not tuning knobs, so they are compile-time constants.
pub(crate) const PHASE_ORIENTATION_TURN: u64 = 1;
pub(crate) const PHASE_FOLLOW_UP_TURN: u64 = 2;
pub(crate) const PHASE_SYNTHESIS_TURN: u64 = 3;
pub(crate) const PHASE_DEEPENING_FLOOR: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// User-turn count at which a guest must register before any further
    /// reply is produced.
    pub guest_turn_ceiling: u64,
    /// Maximum turns handed to the completion provider as recent context.
    pub recent_context_limit: usize,
    /// Maximum turns kept per (account, persona) in the durable log.
    pub durable_log_cap: usize,
    pub provider_max_retries: u32,
    pub provider_backoff_ms: u64,
    pub provider_timeout_ms: u64,
    /// Consecutive primary-provider failures before the cooldown opens.
    pub provider_failure_threshold: u32,
    pub provider_cooldown_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            guest_turn_ceiling: DEFAULT_GUEST_TURN_CEILING,
            recent_context_limit: DEFAULT_RECENT_CONTEXT_LIMIT,
            durable_log_cap: DEFAULT_DURABLE_LOG_CAP,
            provider_max_retries: DEFAULT_PROVIDER_MAX_RETRIES,
            provider_backoff_ms: DEFAULT_PROVIDER_BACKOFF_MS,
            provider_timeout_ms: DEFAULT_PROVIDER_TIMEOUT_MS,
            provider_failure_threshold: DEFAULT_PROVIDER_FAILURE_THRESHOLD,
            provider_cooldown_ms: DEFAULT_PROVIDER_COOLDOWN_MS,
        }
    }
}

impl ChatConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            guest_turn_ceiling: read_env_u64(
                GUEST_TURN_CEILING_ENV,
                DEFAULT_GUEST_TURN_CEILING,
                1,
            ),
            recent_context_limit: read_env_usize(
                RECENT_CONTEXT_LIMIT_ENV,
                DEFAULT_RECENT_CONTEXT_LIMIT,
                1,
            ),
            durable_log_cap: read_env_usize(DURABLE_LOG_CAP_ENV, DEFAULT_DURABLE_LOG_CAP, 2),
            provider_max_retries: read_env_u32(
                PROVIDER_MAX_RETRIES_ENV,
                DEFAULT_PROVIDER_MAX_RETRIES,
                1,
            ),
            provider_backoff_ms: read_env_u64(
                PROVIDER_BACKOFF_MS_ENV,
                DEFAULT_PROVIDER_BACKOFF_MS,
                0,
            ),
            provider_timeout_ms: read_env_u64(
                PROVIDER_TIMEOUT_MS_ENV,
                DEFAULT_PROVIDER_TIMEOUT_MS,
                1,
            ),
            provider_failure_threshold: read_env_u32(
                PROVIDER_FAILURE_THRESHOLD_ENV,
                DEFAULT_PROVIDER_FAILURE_THRESHOLD,
                1,
            ),
            provider_cooldown_ms: read_env_u64(
                PROVIDER_COOLDOWN_MS_ENV,
                DEFAULT_PROVIDER_COOLDOWN_MS,
                0,
            ),
        }
    }
}

#[must_use]
fn read_env_u64(name: &str, default_value: u64, min_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value >= min_value)
        .unwrap_or(default_value)
}

#[must_use]
fn read_env_u32(name: &str, default_value: u32, min_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|value| *value >= min_value)
        .unwrap_or(default_value)
}

#[must_use]
fn read_env_usize(name: &str, default_value: usize, min_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value >= min_value)
        .unwrap_or(default_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = ChatConfig::default();
        assert!(config.guest_turn_ceiling >= PHASE_DEEPENING_FLOOR);
        assert!(config.durable_log_cap >= config.recent_context_limit);
    }
}
