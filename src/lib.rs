// Declare the modules
pub mod api;
pub mod commands;
pub mod config;
pub mod models;
pub mod speech;
pub mod state;
pub mod storage;
pub mod voice;

use crate::api::{ChatBackend, OllamaClient};
use crate::commands::{execute, parse_command, CommandContext, CommandOutcome};
use crate::config::AppConfig;
use crate::models::Role;
use crate::speech::{spawn_voice_controller, ConsoleRecognizer, ConsoleSynthesizer, VoiceHandle};
use crate::state::{AppSnapshot, AppState};
use crate::voice::VoiceProfile;
use anyhow::Context;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Runs the terminal front end until `/quit` or end of input.
pub async fn run() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let config = AppConfig::from_env()?;
    let language = config.language.clone();

    // Create the API provider instance
    let api_provider: Arc<dyn ChatBackend> = Arc::new(OllamaClient::new()?);
    let state = AppState::open(config, api_provider)
        .await
        .context("Failed to open application data")?;

    let recognizer = Arc::new(ConsoleRecognizer::new());
    let (voice, transcripts) = spawn_voice_controller(
        recognizer.clone(),
        Arc::new(ConsoleSynthesizer),
        VoiceProfile::new(language, state.snapshot().voice_gender),
    );

    tokio::spawn(render_replies(state.subscribe()));
    tokio::spawn(answer_transcripts(state.clone(), voice.clone(), transcripts));

    println!("Connecting to {} ...", state.snapshot().server_url);
    if state.check_connection().await {
        let snapshot = state.snapshot();
        println!("Connected. Model: {}", snapshot.current_model);
    } else {
        println!("Server not reachable. Use /server <url> or /connect.");
    }
    println!("Type /help for commands.");

    let ctx = CommandContext { state, voice, recognizer };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        match execute(&ctx, command).await {
            Ok(CommandOutcome::Continue(Some(message))) => println!("{}", message),
            Ok(CommandOutcome::Continue(None)) => {}
            Ok(CommandOutcome::Quit) => break,
            Err(e) => eprintln!("{}", e),
        }
    }

    ctx.voice.stop();
    log::info!("Exiting");
    Ok(())
}

// Sends every recognized utterance to the model and hands the reply back to the voice loop
async fn answer_transcripts(
    state: AppState,
    voice: VoiceHandle,
    mut transcripts: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = transcripts.recv().await {
        println!("> {}", text);
        match state.send_message(&text).await {
            Some(reply) => voice.reply_ready(reply),
            None => voice.reply_failed(),
        }
    }
}

// Prints assistant turns as they grow
async fn render_replies(mut snapshots: watch::Receiver<AppSnapshot>) {
    let mut printed: HashMap<Uuid, (String, bool)> = HashMap::new();

    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.messages.is_empty() {
            printed.clear();
        }

        let mut out = std::io::stdout().lock();
        for entry in snapshot.messages.iter().filter(|m| m.role == Role::Assistant) {
            let (shown, done) = printed.entry(entry.id).or_default();
            if *done {
                continue;
            }
            if let Some(delta) = entry.content.strip_prefix(shown.as_str()) {
                let _ = write!(out, "{}", delta);
            } else {
                // Content was replaced, e.g. by an error message
                let _ = write!(out, "\n{}", entry.content);
            }
            shown.clone_from(&entry.content);
            if !entry.is_streaming {
                let _ = writeln!(out);
                *done = true;
            }
        }
        let _ = out.flush();
    }
}
