//! Personas and their prompt scaffolding. Personas form a closed enum with
//! one capability surface; prompt wording lives behind [`TemplateSource`] so
//! the orchestrator never hard-codes copy.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeerError};
use crate::models::Phase;

/// The selectable dialogue personas. Selected once per request and used for
/// storage scoping, so ids are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    Sable,
    Vesper,
    Iris,
    Rowan,
}

impl Persona {
    pub const ALL: [Self; 4] = [Self::Sable, Self::Vesper, Self::Iris, Self::Rowan];

    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Sable => "sable",
            Self::Vesper => "vesper",
            Self::Iris => "iris",
            Self::Rowan => "rowan",
        }
    }

    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Sable => "Sable",
            Self::Vesper => "Vesper",
            Self::Iris => "Iris",
            Self::Rowan => "Rowan",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|persona| persona.id() == raw)
            .ok_or_else(|| SeerError::Validation(format!("unknown persona: {raw}")))
    }

    /// Only ritual-capable personas may carry an account through the
    /// companion assignment.
    #[must_use]
    pub fn ritual_capable(self) -> bool {
        matches!(self, Self::Sable)
    }
}

/// Produces the prompt scaffolds and fixed replies for a persona. The
/// orchestrator asks for copy here; it never formats user-facing wording
/// itself.
pub trait TemplateSource: Send + Sync {
    /// System prompt handed to the completion provider for one turn.
    fn system_prompt(&self, persona: Persona, phase: Phase) -> String;

    /// Invitation that moves the ritual from not-started to proposed.
    fn ritual_proposal(&self, persona: Persona) -> String;

    /// Closing message after the companion assignment. `first_question` is
    /// the user's earliest migrated question, when one exists.
    fn ritual_closing(
        &self,
        persona: Persona,
        companion: &str,
        first_question: Option<&str>,
    ) -> String;

    /// Deterministic reply when the provider is unavailable.
    fn apology(&self, persona: Persona) -> String;

    /// Reply sent instead of a completion when a guest hits the ceiling.
    fn registration_prompt(&self, persona: Persona) -> String;
}

/// Default templates for tests and the local CLI loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticTemplates;

impl TemplateSource for StaticTemplates {
    fn system_prompt(&self, persona: Persona, phase: Phase) -> String {
        let guidance = match phase {
            Phase::Orientation => {
                "Ask exactly one broad, closed-choice orientation question. \
                 Do not ask for the visitor's name or open-ended strengths."
            }
            Phase::FollowUp => {
                "Ask exactly one follow-up question that builds on the first \
                 answer. Never repeat the orientation question."
            }
            Phase::Synthesis => {
                "Offer a short characterization of the visitor, then ask a \
                 single yes/no question about whether to continue deeper."
            }
            Phase::Deepening => "Guide the conversation deeper, one step at a time.",
            Phase::Ongoing => "Continue the ongoing conversation naturally.",
        };
        format!(
            "You are {name}, stage {stage}. {guidance}",
            name = persona.display_name(),
            stage = phase.number()
        )
    }

    fn ritual_proposal(&self, persona: Persona) -> String {
        format!(
            "{name} pauses. \"We have come far enough that I may offer you a \
             companion spirit. Shall we begin the naming?\"",
            name = persona.display_name()
        )
    }

    fn ritual_closing(
        &self,
        persona: Persona,
        companion: &str,
        first_question: Option<&str>,
    ) -> String {
        match first_question {
            Some(question) => format!(
                "{name} smiles. \"From the moment you asked '{question}', this \
                 spirit was already beside you. Its name is {companion}.\"",
                name = persona.display_name()
            ),
            None => format!(
                "{name} smiles. \"The naming is complete. Your companion \
                 spirit is {companion}.\"",
                name = persona.display_name()
            ),
        }
    }

    fn apology(&self, persona: Persona) -> String {
        format!(
            "{name} closes their eyes. \"The threads are tangled just now. \
             Give me a moment and ask again.\"",
            name = persona.display_name()
        )
    }

    fn registration_prompt(&self, persona: Persona) -> String {
        format!(
            "{name} holds up a hand. \"To go further together, I must know \
             you will return. Create your account and we will continue \
             exactly where we left off.\"",
            name = persona.display_name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_ids_round_trip() {
        for persona in Persona::ALL {
            assert_eq!(Persona::parse(persona.id()).expect("parse"), persona);
        }
        assert!(Persona::parse("nobody").is_err());
    }

    #[test]
    fn only_sable_is_ritual_capable() {
        assert!(Persona::Sable.ritual_capable());
        assert!(!Persona::Vesper.ritual_capable());
        assert!(!Persona::Iris.ritual_capable());
        assert!(!Persona::Rowan.ritual_capable());
    }

    #[test]
    fn closing_embeds_the_first_question_when_present() {
        let templates = StaticTemplates;
        let with = templates.ritual_closing(Persona::Sable, "Wisteria in Pale Bloom", Some("why?"));
        assert!(with.contains("why?"));
        assert!(with.contains("Wisteria in Pale Bloom"));
        let without = templates.ritual_closing(Persona::Sable, "Wisteria in Pale Bloom", None);
        assert!(without.contains("Wisteria in Pale Bloom"));
    }

    #[test]
    fn system_prompt_varies_by_phase() {
        let templates = StaticTemplates;
        let orientation = templates.system_prompt(Persona::Sable, Phase::Orientation);
        let synthesis = templates.system_prompt(Persona::Sable, Phase::Synthesis);
        assert_ne!(orientation, synthesis);
        assert!(orientation.contains("stage 1"));
        assert!(synthesis.contains("stage 3"));
    }
}
