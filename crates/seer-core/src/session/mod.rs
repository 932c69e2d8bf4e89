//! The session orchestrator: resolves the subject, reconciles counters,
//! finishes pending migrations, evaluates the phase gate, and only then
//! talks to the completion provider.
//!
//! All mutating steps for one subject run under that subject's lock, so a
//! retried request can never interleave with itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::client_store::{ClientScope, ClientStore, EphemeralLog};
use crate::config::ChatConfig;
use crate::error::{Result, SeerError};
use crate::migration::MigrationCoordinator;
use crate::models::{AccountId, GuestId, Phase, RitualState, Subject, Turn, TurnRole};
use crate::persona::{Persona, TemplateSource};
use crate::phase::{self, GateDecision};
use crate::provider::{CompletionProvider, CompletionRequest};
use crate::ritual::{self, RitualEvent, RitualTransition};
use crate::state::{DurableLog, SqliteStateStore};
use crate::turn_log::{self, TurnLog};


/// What one inbound user turn produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Reply {
        text: String,
        phase: Phase,
        /// Reconciled user-turn count including this turn.
        turn_count: u64,
        ritual: RitualState,
    },
    /// The guest hit the ceiling. The user turn was not appended and the
    /// provider was not called.
    RegistrationRequired { text: String, turn_count: u64 },
}

/// What a ritual event produced. `message` is set when the event has a
/// user-facing reply (the proposal or the closing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RitualOutcome {
    pub state: RitualState,
    pub message: Option<String>,
}

/// Shared services behind every session: the durable store, the client
/// store, the provider stack, templates, and the per-subject lock registry.
pub struct SessionHub {
    store: SqliteStateStore,
    client: Arc<dyn ClientStore>,
    provider: Arc<dyn CompletionProvider>,
    templates: Arc<dyn TemplateSource>,
    config: ChatConfig,
    migration: MigrationCoordinator,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionHub {
    #[must_use]
    pub fn new(
        store: SqliteStateStore,
        client: Arc<dyn ClientStore>,
        provider: Arc<dyn CompletionProvider>,
        templates: Arc<dyn TemplateSource>,
        config: ChatConfig,
    ) -> Self {
        let migration =
            MigrationCoordinator::new(store.clone(), client.clone(), config.durable_log_cap);
        Self {
            store,
            client,
            provider,
            templates,
            config,
            migration,
            locks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn session(self: &Arc<Self>, subject: Subject, persona: Persona) -> Session {
        Session {
            hub: self.clone(),
            subject,
            persona,
        }
    }

    /// The "registration completed" event. Creates the account row and runs
    /// the history migration when ephemeral history exists. Duplicate calls
    /// are absorbed.
    pub fn on_registration(&self, guest_id: &GuestId, account_id: &AccountId) -> Result<()> {
        let lock = self.subject_lock(guest_id.as_str())?;
        let _guard = hold(&lock)?;
        self.store.upsert_account(account_id)?;
        let record_exists = self
            .store
            .migration_record(guest_id, account_id)?
            .is_some();
        if record_exists || self.migration.has_ephemeral_history(guest_id)? {
            self.migration.begin(guest_id, account_id)?;
            self.migration.commit(guest_id, account_id)?;
        }
        info!(
            guest = guest_id.as_str(),
            account = account_id.as_str(),
            "registration processed"
        );
        Ok(())
    }

    fn subject_lock(&self, key: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| SeerError::mutex_poisoned("lock registry"))?;
        Ok(locks.entry(key.to_string()).or_default().clone())
    }
}

fn hold(lock: &Arc<Mutex<()>>) -> Result<MutexGuard<'_, ()>> {
    lock.lock().map_err(|_| SeerError::mutex_poisoned("subject"))
}

/// One subject talking to one persona.
#[derive(Debug, Clone)]
pub struct Session {
    hub: Arc<SessionHub>,
    subject: Subject,
    persona: Persona,
}

impl Session {
    #[must_use]
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    #[must_use]
    pub fn persona(&self) -> Persona {
        self.persona
    }

    /// Reconciled user-turn count for this session's log.
    pub fn turn_count(&self) -> Result<u64> {
        match &self.subject {
            Subject::Guest(guest_id) => self.ephemeral(guest_id).reconcile(),
            Subject::Account(account_id) => {
                let durable = self.durable(account_id);
                turn_log::reconcile(&durable, None)
            }
        }
    }

    /// Handles one inbound user turn end to end.
    pub fn handle_turn(&self, user_text: &str) -> Result<TurnOutcome> {
        let text = user_text.trim();
        if text.is_empty() {
            return Err(SeerError::Validation("user turn must not be empty".into()));
        }
        let lock = self.hub.subject_lock(self.subject.key())?;
        let _guard = hold(&lock)?;
        match self.subject.clone() {
            Subject::Guest(guest_id) => self.handle_guest_turn(&guest_id, text),
            Subject::Account(account_id) => self.handle_account_turn(&account_id, text),
        }
    }

    /// Applies an externally observed ritual event. Accounts only, and only
    /// with a ritual-capable persona.
    pub fn apply_ritual_event(&self, event: RitualEvent) -> Result<RitualOutcome> {
        let Subject::Account(account_id) = self.subject.clone() else {
            return Err(SeerError::Validation(
                "the ritual is only open to accounts".into(),
            ));
        };
        if !self.persona.ritual_capable() {
            return Err(SeerError::Validation(format!(
                "persona {} does not carry the ritual",
                self.persona.id()
            )));
        }
        let lock = self.hub.subject_lock(self.subject.key())?;
        let _guard = hold(&lock)?;

        let current = self.hub.store.ritual_state(&account_id, self.persona)?;
        let transition = match ritual::apply(current, event) {
            Ok(transition) => transition,
            Err(err) => {
                error!(
                    account = account_id.as_str(),
                    current = current.as_str(),
                    ?event,
                    "ritual event rejected"
                );
                return Err(err);
            }
        };
        match transition {
            RitualTransition::Applied(RitualState::Proposed) => {
                self.hub
                    .store
                    .set_ritual_state(&account_id, self.persona, RitualState::Proposed)?;
                Ok(RitualOutcome {
                    state: RitualState::Proposed,
                    message: Some(self.hub.templates.ritual_proposal(self.persona)),
                })
            }
            RitualTransition::Applied(next @ (RitualState::NotStarted | RitualState::Accepted)) => {
                self.hub
                    .store
                    .set_ritual_state(&account_id, self.persona, next)?;
                Ok(RitualOutcome {
                    state: next,
                    message: None,
                })
            }
            RitualTransition::Applied(RitualState::InProgress | RitualState::Completed) => {
                self.hub
                    .store
                    .set_ritual_state(&account_id, self.persona, RitualState::InProgress)?;
                let closing = self.run_assignment_ceremony(&account_id)?;
                Ok(RitualOutcome {
                    state: RitualState::Completed,
                    message: Some(closing),
                })
            }
            RitualTransition::Duplicate if current >= RitualState::InProgress => {
                // Idempotent reply: the ceremony recomputes the identical
                // closing without re-running side effects.
                let closing = self.run_assignment_ceremony(&account_id)?;
                Ok(RitualOutcome {
                    state: RitualState::Completed,
                    message: Some(closing),
                })
            }
            RitualTransition::Duplicate => Ok(RitualOutcome {
                state: current,
                message: None,
            }),
        }
    }

    fn handle_guest_turn(&self, guest_id: &GuestId, text: &str) -> Result<TurnOutcome> {
        let ephemeral = self.ephemeral(guest_id);
        let prior = ephemeral.reconcile()?;
        let gate = phase::evaluate_gate(
            prior,
            false,
            RitualState::NotStarted,
            self.hub.config.guest_turn_ceiling,
        );
        let phase = match gate {
            GateDecision::RegistrationRequired => {
                info!(guest = guest_id.as_str(), turns = prior, "guest hit ceiling");
                return Ok(TurnOutcome::RegistrationRequired {
                    text: self.hub.templates.registration_prompt(self.persona),
                    turn_count: prior,
                });
            }
            GateDecision::Proceed(phase) => phase,
        };
        ephemeral.append(TurnRole::User, text)?;
        let recent = recent_window(
            ephemeral.turns()?,
            None,
            self.hub.config.recent_context_limit,
        );
        let reply = self.complete_or_apologize(phase, recent, |reply| {
            ephemeral.append(TurnRole::Agent, reply)?;
            Ok(())
        })?;
        ephemeral.reconcile()?;
        Ok(TurnOutcome::Reply {
            text: reply,
            phase,
            turn_count: prior + 1,
            ritual: RitualState::NotStarted,
        })
    }

    fn handle_account_turn(&self, account_id: &AccountId, text: &str) -> Result<TurnOutcome> {
        self.hub.store.upsert_account(account_id)?;
        // A registration that crashed mid-migration finishes here, before
        // any counting, so the recount already includes migrated history.
        if let Some(guest_id) = self.hub.store.pending_migration_guest(account_id)? {
            self.hub.migration.commit(&guest_id, account_id)?;
        }
        let durable = self.durable(account_id);
        let prior = turn_log::reconcile(&durable, None)?;
        let ritual = self.hub.store.ritual_state(account_id, self.persona)?;
        let phase = match phase::evaluate_gate(
            prior,
            true,
            ritual,
            self.hub.config.guest_turn_ceiling,
        ) {
            GateDecision::Proceed(phase) => phase,
            GateDecision::RegistrationRequired => {
                return Err(SeerError::Internal(
                    "gate blocked a registered account".into(),
                ));
            }
        };
        durable.append(TurnRole::User, text)?;

        if matches!(
            ritual,
            RitualState::Proposed | RitualState::Accepted | RitualState::InProgress
        ) {
            return self.handle_ritual_turn(account_id, &durable, ritual, phase, prior);
        }

        if phase::may_propose_ritual(phase, true, ritual) && self.persona.ritual_capable() {
            let proposal = self.hub.templates.ritual_proposal(self.persona);
            self.hub
                .store
                .set_ritual_state(account_id, self.persona, RitualState::Proposed)?;
            durable.append(TurnRole::Agent, &proposal)?;
            return Ok(TurnOutcome::Reply {
                text: proposal,
                phase,
                turn_count: prior + 1,
                ritual: RitualState::Proposed,
            });
        }

        let floor = self.hub.store.context_floor(account_id, self.persona)?;
        let recent = recent_window(
            durable.turns()?,
            floor,
            self.hub.config.recent_context_limit,
        );
        let reply = self.complete_or_apologize(phase, recent, |reply| {
            durable.append(TurnRole::Agent, reply)?;
            Ok(())
        })?;
        Ok(TurnOutcome::Reply {
            text: reply,
            phase,
            turn_count: prior + 1,
            ritual,
        })
    }

    /// A plain user turn while the ritual is open. A pending proposal is
    /// restated; an accepted or in-progress ritual runs the ceremony.
    fn handle_ritual_turn(
        &self,
        account_id: &AccountId,
        durable: &DurableLog,
        ritual: RitualState,
        phase: Phase,
        prior: u64,
    ) -> Result<TurnOutcome> {
        if ritual == RitualState::Proposed {
            let proposal = self.hub.templates.ritual_proposal(self.persona);
            durable.append(TurnRole::Agent, &proposal)?;
            return Ok(TurnOutcome::Reply {
                text: proposal,
                phase,
                turn_count: prior + 1,
                ritual,
            });
        }
        self.hub
            .store
            .set_ritual_state(account_id, self.persona, RitualState::InProgress)?;
        let closing = self.run_assignment_ceremony(account_id)?;
        Ok(TurnOutcome::Reply {
            text: closing,
            phase,
            turn_count: prior + 1,
            ritual: RitualState::Completed,
        })
    }

    /// The companion assignment ceremony. Every step is idempotent, so a
    /// request that failed midway resumes here and lands on the identical
    /// outcome: same companion, same closing, no duplicated turns.
    fn run_assignment_ceremony(&self, account_id: &AccountId) -> Result<String> {
        if let Some(guest_id) = self.hub.store.pending_migration_guest(account_id)? {
            self.hub.migration.commit(&guest_id, account_id)?;
        }
        let companion = self
            .hub
            .store
            .assign_companion_if_empty(account_id, ritual::assign_companion(account_id))?;
        let first_question = self
            .hub
            .store
            .first_user_question(account_id, self.persona)?;
        let closing =
            self.hub
                .templates
                .ritual_closing(self.persona, &companion, first_question.as_deref());

        if self
            .hub
            .store
            .context_floor(account_id, self.persona)?
            .is_none()
        {
            let durable = self.durable(account_id);
            let closing_digest = Turn {
                role: TurnRole::Agent,
                text: closing.clone(),
                ordinal: 0,
                created_at: chrono::Utc::now(),
            }
            .content_digest();
            let tail = self.hub.store.tail_digests(account_id, self.persona, 1)?;
            let ordinal = if tail.last() == Some(&closing_digest) {
                durable.turns()?.last().map_or(0, |turn| turn.ordinal)
            } else {
                durable.append(TurnRole::Agent, &closing)?
            };
            self.hub
                .store
                .set_context_floor(account_id, self.persona, ordinal)?;
        }
        self.hub
            .store
            .set_ritual_state(account_id, self.persona, RitualState::Completed)?;
        info!(
            account = account_id.as_str(),
            companion, "companion assignment completed"
        );
        Ok(closing)
    }

    /// Calls the provider and appends the reply via `on_success`. A provider
    /// failure (already retried and failed over below this layer) degrades
    /// to the deterministic apology, which is returned but never logged.
    fn complete_or_apologize(
        &self,
        phase: Phase,
        recent: Vec<Turn>,
        on_success: impl FnOnce(&str) -> Result<()>,
    ) -> Result<String> {
        let request = CompletionRequest {
            persona: self.persona,
            phase,
            system_prompt: self.hub.templates.system_prompt(self.persona, phase),
            recent,
        };
        match self.hub.provider.complete(&request) {
            Ok(reply) => {
                on_success(&reply)?;
                Ok(reply)
            }
            Err(err @ SeerError::Provider { .. }) => {
                warn!(error = %err, "provider unavailable; sending apology");
                Ok(self.hub.templates.apology(self.persona))
            }
            Err(err) => Err(err),
        }
    }

    fn ephemeral(&self, guest_id: &GuestId) -> EphemeralLog {
        EphemeralLog::new(
            self.hub.client.clone(),
            ClientScope::new(guest_id.clone(), self.persona),
        )
    }

    fn durable(&self, account_id: &AccountId) -> DurableLog {
        self.hub.store.durable_log(
            account_id.clone(),
            self.persona,
            self.hub.config.durable_log_cap,
        )
    }
}

/// Last `limit` turns above the presentation floor, oldest first.
fn recent_window(turns: Vec<Turn>, floor: Option<u64>, limit: usize) -> Vec<Turn> {
    let mut window: Vec<Turn> = turns
        .into_iter()
        .filter(|turn| floor.is_none_or(|floor| turn.ordinal > floor))
        .collect();
    if window.len() > limit {
        window.drain(..window.len() - limit);
    }
    window
}
