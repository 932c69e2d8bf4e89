use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "seer")]
#[command(about = "Local session loop for the Seer persona dialogue runtime", version)]
pub struct Cli {
    /// Data directory holding the durable store and client-side logs.
    #[arg(long, default_value = ".seer")]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Interactive chat loop for a guest or account.
    Chat(ChatArgs),
    /// Convert a guest into an account, migrating any stored history.
    Register(RegisterArgs),
    /// Show turn count, phase, and ritual state for a subject.
    Status(SubjectArgs),
}

#[derive(Debug, Args)]
pub struct SubjectArgs {
    /// Guest identifier (mutually exclusive with --account).
    #[arg(long, conflicts_with = "account")]
    pub guest: Option<String>,

    /// Account identifier.
    #[arg(long)]
    pub account: Option<String>,

    #[arg(long, default_value = "sable")]
    pub persona: String,
}

#[derive(Debug, Args)]
pub struct ChatArgs {
    #[command(flatten)]
    pub subject: SubjectArgs,

    /// Chat-completions endpoint for the primary provider.
    #[arg(long, default_value = "http://127.0.0.1:11434/v1/chat/completions")]
    pub endpoint: String,

    /// Optional second endpoint used when the primary is failing.
    #[arg(long)]
    pub fallback_endpoint: Option<String>,

    #[arg(long, default_value = "llama3.1")]
    pub model: String,
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    #[arg(long)]
    pub guest: String,

    #[arg(long)]
    pub account: String,
}
