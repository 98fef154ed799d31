//! Spellwright Engine - Main entry point.
//!
//! ```text
//! spellwright-engine <word> <category> [clue-number] [wrong-guess...]
//! spellwright-engine --chat <message>
//! ```

use anyhow::{bail, Context};
use futures_util::StreamExt;
use std::io::Write;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spellwright_domain::{NpcArchetype, NpcIdentity, PromptContext};
use spellwright_engine::infrastructure::app_settings::AppSettings;
use spellwright_engine::App;

const RIDDLEMASTER_PERSONALITY: &str = "You are an ancient keeper of riddles. \
     You speak in metaphor and never give a straight answer about {category}, \
     but each hint you give is a little kinder than the last.";

const CHAT_SYSTEM_PROMPT: &str =
    "You are a friendly character in a magical word-guessing game. Keep replies short.";

enum Command {
    Clue(PromptContext),
    Chat(String),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv_from_repo_root();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spellwright_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let command = parse_args(std::env::args().skip(1).collect())?;

    tracing::info!("Starting Spellwright Engine");
    let settings = AppSettings::from_env().context("invalid configuration")?;
    let app = App::build(&settings).await;

    match command {
        Command::Clue(context) => {
            let clue = app.clues.generate_clue(&context).await;
            println!("{}", clue.clue_text);
            tracing::info!(
                mood = %clue.mood,
                used_fallback = clue.used_fallback,
                generation_time_ms = clue.generation_time_ms,
                "Clue delivered"
            );
        }
        Command::Chat(message) => {
            let mut stream = app.clues.stream_chat(CHAT_SYSTEM_PROMPT, &message);
            let mut stdout = std::io::stdout();
            while let Some(token) = stream.next().await {
                write!(stdout, "{}", token)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
    }

    app.shutdown().await;
    Ok(())
}

fn parse_args(args: Vec<String>) -> anyhow::Result<Command> {
    match args.first().map(String::as_str) {
        Some("--chat") => {
            let message = args[1..].join(" ");
            if message.trim().is_empty() {
                bail!("usage: spellwright-engine --chat <message>");
            }
            Ok(Command::Chat(message))
        }
        Some(_) if args.len() >= 2 => {
            let clue_index = match args.get(2) {
                Some(raw) => raw
                    .parse::<u32>()
                    .with_context(|| format!("clue number must be a positive integer, got {raw:?}"))?,
                None => 1,
            };
            let npc = NpcIdentity::new("The Riddlemaster", NpcArchetype::Riddlemaster)
                .with_personality(RIDDLEMASTER_PERSONALITY);
            let context = PromptContext::new(npc, &args[0], &args[1], clue_index)
                .with_previous_guesses(args.iter().skip(3).cloned());
            context.validate()?;
            Ok(Command::Clue(context))
        }
        _ => bail!(
            "usage: spellwright-engine <word> <category> [clue-number] [wrong-guess...]\n       \
             spellwright-engine --chat <message>"
        ),
    }
}

fn load_dotenv_from_repo_root() {
    let repo_root = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..");

    // Prefer local overrides.
    for filename in [".env.local", ".env"] {
        let path = repo_root.join(filename);
        if path.exists() {
            let _ = dotenvy::from_path(path);
        }
    }
}
