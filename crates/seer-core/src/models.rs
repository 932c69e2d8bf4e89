use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeerError};

/// Author of a single conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Agent,
}

impl TurnRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            other => Err(SeerError::Validation(format!("unknown turn role: {other}"))),
        }
    }
}

/// One message in a turn log. Ordinals are assigned by append order within a
/// single log and are never reused or reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub ordinal: u64,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Content digest used for migration de-duplication: role plus text,
    /// independent of ordinal and timestamp.
    #[must_use]
    pub fn content_digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.role.as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.text.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Opaque device-local identifier for an unregistered visitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuestId(String);

impl GuestId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_subject_id("guest id", &id)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Server-issued identifier for a registered account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_subject_id("account id", &id)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_subject_id(label: &str, raw: &str) -> Result<()> {
    if raw.trim().is_empty() {
        return Err(SeerError::Validation(format!("{label} must not be empty")));
    }
    if raw.len() > 128 {
        return Err(SeerError::Validation(format!(
            "{label} must be <= 128 chars"
        )));
    }
    if !raw.is_ascii() {
        return Err(SeerError::Validation(format!("{label} must be ASCII")));
    }
    Ok(())
}

/// The entity having a conversation. A subject transitions at most once from
/// `Guest` to `Account` and never back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subject {
    Guest(GuestId),
    Account(AccountId),
}

impl Subject {
    #[must_use]
    pub fn is_account(&self) -> bool {
        matches!(self, Self::Account(_))
    }

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Guest(id) => id.as_str(),
            Self::Account(id) => id.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Done,
}

impl MigrationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            other => Err(SeerError::Validation(format!(
                "unknown migration status: {other}"
            ))),
        }
    }
}

/// Durable marker for the one-time ephemeral-to-durable history transfer.
/// At most one record is pending per guest; `Done` is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub guest_id: GuestId,
    pub account_id: AccountId,
    pub status: MigrationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of the one irreversible per-account companion assignment.
/// Transitions only move forward except `decline`, which resets `Proposed`
/// back to `NotStarted`. `Completed` is permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RitualState {
    NotStarted,
    Proposed,
    Accepted,
    InProgress,
    Completed,
}

impl RitualState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Proposed => "proposed",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "not_started" => Ok(Self::NotStarted),
            "proposed" => Ok(Self::Proposed),
            "accepted" => Ok(Self::Accepted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(SeerError::Validation(format!(
                "unknown ritual state: {other}"
            ))),
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Completed
    }
}

/// Dialogue stage, always recomputed from `(turn_count, is_account,
/// ritual_state)` and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// First user turn: one broad, closed-choice orientation question.
    Orientation,
    /// Second user turn: one follow-up, never repeating the orientation.
    FollowUp,
    /// Third user turn: short characterization plus a yes/no confirmation.
    Synthesis,
    /// Fourth turn onward while the ritual is still open.
    Deepening,
    /// Fourth turn onward once the ritual has completed.
    Ongoing,
}

impl Phase {
    /// Numeric stage as presented to template providers. `Ongoing` shares
    /// stage 4 with `Deepening`; the distinction is ritual eligibility, not
    /// depth.
    #[must_use]
    pub fn number(self) -> u8 {
        match self {
            Self::Orientation => 1,
            Self::FollowUp => 2,
            Self::Synthesis => 3,
            Self::Deepening | Self::Ongoing => 4,
        }
    }
}

/// Durable per-account profile row read by the ritual flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub account_id: AccountId,
    pub nickname: Option<String>,
    pub companion: Option<String>,
    pub created_at: DateTime<Utc>,
}
