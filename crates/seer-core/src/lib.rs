// Public fallible APIs in this crate share one concrete error contract (`SeerError`).
// Repeating per-function `# Errors` boilerplate obscures behavior more than it clarifies.
#![allow(
    clippy::missing_errors_doc,
    reason = "crate-wide fallible API uses one explicit error type; per-item boilerplate would duplicate contract"
)]

pub mod client_store;
pub(crate) mod config;
pub mod error;
pub mod migration;
pub mod models;
pub mod persona;
pub mod phase;
pub mod provider;
pub mod ritual;
pub mod session;
pub mod state;
pub mod turn_log;

pub use config::ChatConfig;
pub use error::{Result, SeerError};
pub use models::{AccountId, GuestId, Phase, RitualState, Subject, Turn, TurnRole};
pub use persona::{Persona, StaticTemplates, TemplateSource};
pub use provider::{CompletionProvider, FailoverProvider, HttpCompletionProvider, ProviderHealth};
pub use ritual::RitualEvent;
pub use session::{RitualOutcome, Session, SessionHub, TurnOutcome};
pub use state::SqliteStateStore;
