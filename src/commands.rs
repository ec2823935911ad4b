use crate::models::{ActiveAvatar, AvatarStyle, InputMode};
use crate::speech::{ConsoleRecognizer, VoiceHandle};
use crate::state::AppState;
use crate::voice::VoiceGender;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub const HELP: &str = "\
Type a message to chat. Commands:
  /help                   show this help
  /state                  print the application state as JSON
  /connect                re-check the server and refresh models
  /models                 list available models
  /model <name>           select a model
  /server <url>           change and save the server address
  /mode <chat|voice>      speak replies in voice mode
  /avatar <style>         use a built-in avatar
  /skins                  list imported skins
  /import <path> [name]   import a GLB file as a skin
  /skin <id>              use an imported skin
  /delete <id>            delete an imported skin
  /gender <female|male>   voice used for replies
  /voice                  start or stop continuous listening
  /stop                   stop the reply being generated
  /clear                  start a new conversation
  /quit                   exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    State,
    Connect,
    Models,
    Model(String),
    Server(String),
    Mode(InputMode),
    Avatar(AvatarStyle),
    Skins,
    Import { path: PathBuf, name: Option<String> },
    Skin(Uuid),
    Delete(Uuid),
    Gender(VoiceGender),
    Voice,
    Stop,
    Clear,
    Quit,
    Say(String),
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let require = |what: &str| require_arg(name, arg, what);
    let parse_id = |raw: &str| -> Result<Uuid, String> {
        Uuid::parse_str(raw).map_err(|_| format!("Invalid skin ID format: {}", raw))
    };

    let command = match name {
        "help" | "h" => Command::Help,
        "state" => Command::State,
        "connect" => Command::Connect,
        "models" => Command::Models,
        "model" => Command::Model(require("a model name")?.to_string()),
        "server" => Command::Server(require("a URL")?.to_string()),
        "mode" => match require("chat or voice")?.to_lowercase().as_str() {
            "chat" => Command::Mode(InputMode::Chat),
            "voice" => Command::Mode(InputMode::Voice),
            other => return Err(format!("Unknown input mode: {}", other)),
        },
        "avatar" => {
            let raw = require("a style name")?;
            Command::Avatar(
                AvatarStyle::parse(raw).ok_or_else(|| format!("Unknown avatar style: {}", raw))?,
            )
        }
        "skins" => Command::Skins,
        "import" => {
            let raw = require("a file path")?;
            let (path, name) = match raw.split_once(char::is_whitespace) {
                Some((path, name)) => (path, Some(name.trim().to_string())),
                None => (raw, None),
            };
            Command::Import { path: PathBuf::from(path), name }
        }
        "skin" => Command::Skin(parse_id(require("a skin ID")?)?),
        "delete" => Command::Delete(parse_id(require("a skin ID")?)?),
        "gender" => {
            let raw = require("female or male")?;
            Command::Gender(VoiceGender::parse(raw).ok_or_else(|| format!("Unknown voice: {}", raw))?)
        }
        "voice" => Command::Voice,
        "stop" => Command::Stop,
        "clear" => Command::Clear,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("Unknown command /{} (try /help)", other)),
    };
    Ok(Some(command))
}

fn require_arg<'a>(name: &str, arg: &'a str, what: &str) -> Result<&'a str, String> {
    if arg.is_empty() {
        Err(format!("/{} needs {}", name, what))
    } else {
        Ok(arg)
    }
}

/// Everything a command may touch.
#[derive(Clone)]
pub struct CommandContext {
    pub state: AppState,
    pub voice: VoiceHandle,
    pub recognizer: Arc<ConsoleRecognizer>,
}

#[derive(Debug, PartialEq)]
pub enum CommandOutcome {
    Continue(Option<String>),
    Quit,
}

fn reply(text: impl Into<String>) -> Result<CommandOutcome, String> {
    Ok(CommandOutcome::Continue(Some(text.into())))
}

pub async fn execute(ctx: &CommandContext, command: Command) -> Result<CommandOutcome, String> {
    let state = &ctx.state;
    match command {
        Command::Help => reply(HELP),
        Command::State => {
            let snapshot = state.snapshot();
            serde_json::to_string_pretty(&snapshot)
                .map_err(|e| format!("Failed to render state: {}", e))
                .and_then(reply)
        }
        Command::Connect => {
            if state.check_connection().await {
                reply(format!("Connected to {}", state.snapshot().server_url))
            } else {
                Err(format!("Cannot reach {}", state.snapshot().server_url))
            }
        }
        Command::Models => {
            let snapshot = state.snapshot();
            if snapshot.available_models.is_empty() {
                return reply("No models available (try /connect)");
            }
            let listing = snapshot
                .available_models
                .iter()
                .map(|m| {
                    let marker = if *m == snapshot.current_model { "*" } else { " " };
                    format!("{} {}", marker, m)
                })
                .collect::<Vec<_>>()
                .join("\n");
            reply(listing)
        }
        Command::Model(name) => {
            let snapshot = state.snapshot();
            if !snapshot.available_models.is_empty() && !snapshot.available_models.contains(&name) {
                log::warn!("Selecting model {} which the server did not list", name);
            }
            state.select_model(&name);
            reply(format!("Model: {}", name))
        }
        Command::Server(url) => {
            let connected = state.set_server_url(&url).await?;
            let server = state.snapshot().server_url;
            if connected {
                reply(format!("Connected to {}", server))
            } else {
                reply(format!("Saved {}, but the server is not reachable", server))
            }
        }
        Command::Mode(mode) => {
            state.set_input_mode(mode);
            reply(format!("Input mode: {:?}", mode))
        }
        Command::Avatar(style) => {
            state.set_avatar_style(style);
            reply(format!("Avatar: {} ({})", style.display_name(), style.description()))
        }
        Command::Skins => {
            let snapshot = state.snapshot();
            if snapshot.custom_skins.is_empty() {
                return reply("No imported skins");
            }
            let active_id = match &snapshot.active_avatar {
                ActiveAvatar::Custom { skin } => Some(skin.id),
                ActiveAvatar::BuiltIn { .. } => None,
            };
            let listing = snapshot
                .custom_skins
                .iter()
                .map(|skin| {
                    let marker = if Some(skin.id) == active_id { "*" } else { " " };
                    format!("{} {}  {}  ({})", marker, skin.id, skin.name, skin.added_at.format("%Y-%m-%d %H:%M"))
                })
                .collect::<Vec<_>>()
                .join("\n");
            reply(listing)
        }
        Command::Import { path, name } => {
            let name = name.unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "Custom skin".to_string())
            });
            let skin = state.import_skin(&path, &name).await?;
            reply(format!("Imported {} as {}", skin.name, skin.id))
        }
        Command::Skin(id) => {
            state.set_custom_avatar(id)?;
            reply("Custom avatar selected")
        }
        Command::Delete(id) => {
            if state.delete_skin(id).await? {
                reply("Skin deleted")
            } else {
                Err(format!("No custom skin with ID {}", id))
            }
        }
        Command::Gender(gender) => {
            state.set_voice_gender(gender);
            ctx.voice.set_gender(gender);
            reply(format!("Voice: {:?}", gender))
        }
        Command::Voice => {
            let was_continuous = ctx.voice.status().continuous;
            ctx.voice.toggle();
            if was_continuous {
                reply("Voice listening stopped")
            } else {
                reply("Listening... type what you would say")
            }
        }
        Command::Stop => {
            let stopped = state
                .streaming_replies()
                .into_iter()
                .filter(|id| state.stop_generation(*id))
                .count();
            if stopped == 0 {
                reply("Nothing is being generated")
            } else {
                Ok(CommandOutcome::Continue(None))
            }
        }
        Command::Clear => {
            state.clear_conversation().await;
            reply("Conversation cleared")
        }
        Command::Quit => Ok(CommandOutcome::Quit),
        Command::Say(text) => {
            if ctx.voice.status().state.is_listening() && ctx.recognizer.deliver(&text).await {
                return Ok(CommandOutcome::Continue(None));
            }
            // Send in the background so /stop stays usable while the reply streams
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let reply = ctx.state.send_message(&text).await;
                if ctx.state.snapshot().input_mode == InputMode::Voice {
                    if let Some(reply) = reply {
                        ctx.voice.reply_ready(reply);
                    }
                }
            });
            Ok(CommandOutcome::Continue(None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(parse_command("  cześć  "), Ok(Some(Command::Say("cześć".into()))));
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn parses_arguments() {
        assert_eq!(
            parse_command("/server http://10.0.0.2:11434/"),
            Ok(Some(Command::Server("http://10.0.0.2:11434/".into())))
        );
        assert_eq!(parse_command("/mode VOICE"), Ok(Some(Command::Mode(InputMode::Voice))));
        assert_eq!(
            parse_command("/avatar gold elite"),
            Ok(Some(Command::Avatar(AvatarStyle::GoldElite)))
        );
        assert_eq!(
            parse_command("/import /tmp/robot.glb My Robot"),
            Ok(Some(Command::Import {
                path: PathBuf::from("/tmp/robot.glb"),
                name: Some("My Robot".into())
            }))
        );
        assert_eq!(parse_command("/gender m"), Ok(Some(Command::Gender(VoiceGender::Male))));
        assert_eq!(parse_command("/q"), Ok(Some(Command::Quit)));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_command("/model").is_err());
        assert!(parse_command("/delete not-a-uuid").is_err());
        assert!(parse_command("/avatar paladin").is_err());
        assert!(parse_command("/dance").is_err());
    }
}
