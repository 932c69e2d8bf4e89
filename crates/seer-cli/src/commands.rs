use std::io::{BufRead, Write as _};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use seer_core::client_store::{ClientStore, FileClientStore};
use seer_core::provider::{CompletionRequest, SystemClock};
use seer_core::{
    AccountId, ChatConfig, CompletionProvider, FailoverProvider, GuestId, HttpCompletionProvider,
    Persona, ProviderHealth, RitualEvent, SeerError, Session, SessionHub, SqliteStateStore,
    StaticTemplates, Subject, TurnOutcome,
};

use crate::cli::{ChatArgs, Commands, RegisterArgs, SubjectArgs};

pub fn run(root: &Path, command: Commands) -> Result<()> {
    match command {
        Commands::Chat(args) => chat(root, &args),
        Commands::Register(args) => register(root, &args),
        Commands::Status(args) => status(root, &args),
    }
}

/// Stand-in provider for subcommands that never produce a reply.
struct OfflineProvider;

impl CompletionProvider for OfflineProvider {
    fn complete(&self, _request: &CompletionRequest) -> seer_core::Result<String> {
        Err(SeerError::Validation(
            "this command does not call the completion provider".into(),
        ))
    }
}

fn open_store(root: &Path) -> Result<SqliteStateStore> {
    SqliteStateStore::open(root.join("seer.db")).context("open durable store")
}

fn client_store(root: &Path) -> Arc<dyn ClientStore> {
    Arc::new(FileClientStore::new(root.join("client")))
}

fn subject_of(args: &SubjectArgs) -> Result<(Subject, Persona)> {
    let persona = Persona::parse(&args.persona)?;
    let subject = match (&args.guest, &args.account) {
        (Some(guest), None) => Subject::Guest(GuestId::new(guest.clone())?),
        (None, Some(account)) => Subject::Account(AccountId::new(account.clone())?),
        _ => bail!("pass exactly one of --guest or --account"),
    };
    Ok((subject, persona))
}

fn chat(root: &Path, args: &ChatArgs) -> Result<()> {
    let persona = Persona::parse(&args.subject.persona)?;
    let subject = match (&args.subject.guest, &args.subject.account) {
        (Some(guest), None) => Subject::Guest(GuestId::new(guest.clone())?),
        (None, Some(account)) => Subject::Account(AccountId::new(account.clone())?),
        (None, None) => {
            // A fresh device mints its own guest identity.
            let id = format!("guest-{}", uuid::Uuid::new_v4().simple());
            println!("new guest session: {id}");
            Subject::Guest(GuestId::new(id)?)
        }
        (Some(_), Some(_)) => bail!("pass at most one of --guest or --account"),
    };
    let config = ChatConfig::from_env();

    let primary: Arc<dyn CompletionProvider> = Arc::new(HttpCompletionProvider::new(
        &args.endpoint,
        args.model.clone(),
        &config,
    )?);
    let fallback: Option<Arc<dyn CompletionProvider>> = args
        .fallback_endpoint
        .as_deref()
        .map(|endpoint| {
            HttpCompletionProvider::new(endpoint, args.model.clone(), &config)
                .map(|provider| Arc::new(provider) as Arc<dyn CompletionProvider>)
        })
        .transpose()?;
    let health = Arc::new(ProviderHealth::from_config(&config, Arc::new(SystemClock)));
    let provider = Arc::new(FailoverProvider::new(primary, fallback, health, &config));

    let hub = Arc::new(SessionHub::new(
        open_store(root)?,
        client_store(root),
        provider,
        Arc::new(StaticTemplates),
        config,
    ));
    let session = hub.session(subject, persona);

    println!(
        "Talking to {} — type a message, /accept, /decline, /begin, or exit.",
        persona.display_name()
    );
    let stdin = std::io::stdin();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => break,
            "/accept" => ritual_event(&session, persona, RitualEvent::Accept)?,
            "/decline" => ritual_event(&session, persona, RitualEvent::Decline)?,
            "/begin" => ritual_event(&session, persona, RitualEvent::Begin)?,
            text => match session.handle_turn(text)? {
                TurnOutcome::Reply { text, .. } => {
                    println!("{}> {text}", persona.display_name());
                }
                TurnOutcome::RegistrationRequired { text, .. } => {
                    println!("{}> {text}", persona.display_name());
                    println!("(run `seer register` to continue past this point)");
                }
            },
        }
    }
    Ok(())
}

/// Feeds one ritual event into the session. Rejections (no open proposal,
/// guest subject, wrong persona) are printed and swallowed so the chat loop
/// keeps prompting; only infrastructure errors abort.
fn ritual_event(session: &Session, persona: Persona, event: RitualEvent) -> Result<()> {
    match session.apply_ritual_event(event) {
        Ok(outcome) => match outcome.message {
            Some(message) => println!("{}> {message}", persona.display_name()),
            None => println!("(ritual state: {})", outcome.state.as_str()),
        },
        Err(err @ (SeerError::InvariantViolation(_) | SeerError::Validation(_))) => {
            println!("(that is not possible right now: {err})");
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

fn register(root: &Path, args: &RegisterArgs) -> Result<()> {
    let guest_id = GuestId::new(args.guest.clone())?;
    let account_id = AccountId::new(args.account.clone())?;
    let hub = SessionHub::new(
        open_store(root)?,
        client_store(root),
        Arc::new(OfflineProvider),
        Arc::new(StaticTemplates),
        ChatConfig::from_env(),
    );
    hub.on_registration(&guest_id, &account_id)?;
    println!(
        "registered {} as {}; history migrated",
        args.guest, args.account
    );
    Ok(())
}

fn status(root: &Path, args: &SubjectArgs) -> Result<()> {
    let (subject, persona) = subject_of(args)?;
    let store = open_store(root)?;
    let config = ChatConfig::from_env();
    let hub = Arc::new(SessionHub::new(
        store.clone(),
        client_store(root),
        Arc::new(OfflineProvider),
        Arc::new(StaticTemplates),
        config.clone(),
    ));
    let session = hub.session(subject.clone(), persona);
    let turns = session.turn_count()?;

    println!("persona:    {}", persona.id());
    println!("turns:      {turns}");
    match &subject {
        Subject::Guest(guest_id) => {
            let remaining = config.guest_turn_ceiling.saturating_sub(turns);
            println!("tier:       guest ({})", guest_id.as_str());
            println!("remaining:  {remaining} before registration is required");
        }
        Subject::Account(account_id) => {
            let ritual = store.ritual_state(account_id, persona)?;
            println!("tier:       account ({})", account_id.as_str());
            println!("ritual:     {}", ritual.as_str());
            if let Some(profile) = store.account_profile(account_id)?
                && let Some(companion) = profile.companion
            {
                println!("companion:  {companion}");
            }
        }
    }
    let next = seer_core::phase::phase_of(
        turns + 1,
        match &subject {
            Subject::Account(account_id) => store.ritual_state(account_id, persona)?,
            Subject::Guest(_) => seer_core::RitualState::NotStarted,
        },
    );
    println!("next phase: {}", next.number());
    Ok(())
}
