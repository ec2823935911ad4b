use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

// Who authored a message
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// A message as sent to the chat endpoint (history entry)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

// A single conversation turn as shown to the user
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatEntry {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    // True while the assistant reply is still being streamed into this turn
    #[serde(default)]
    pub is_streaming: bool,
}

impl ChatEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: content.into(),
            is_streaming: false,
        }
    }

    pub fn streaming_assistant(id: Uuid) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: String::new(),
            is_streaming: true,
        }
    }
}

// An imported GLB model the user can pick as avatar
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CustomSkin {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub file_path: PathBuf, // Copy inside the app data directory
    #[serde(default = "Utc::now")]
    pub added_at: DateTime<Utc>,
}

/// Built-in procedurally drawn avatars.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AvatarStyle {
    #[default]
    DarkKnight,
    CyberKnight,
    Ghost,
    Lava,
    Forest,
    Void,
    GoldElite,
}

impl AvatarStyle {
    pub const ALL: [AvatarStyle; 7] = [
        AvatarStyle::DarkKnight,
        AvatarStyle::CyberKnight,
        AvatarStyle::Ghost,
        AvatarStyle::Lava,
        AvatarStyle::Forest,
        AvatarStyle::Void,
        AvatarStyle::GoldElite,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            AvatarStyle::DarkKnight => "Dark Knight",
            AvatarStyle::CyberKnight => "Cyber Knight",
            AvatarStyle::Ghost => "Ghost",
            AvatarStyle::Lava => "Lava",
            AvatarStyle::Forest => "Forest",
            AvatarStyle::Void => "Void",
            AvatarStyle::GoldElite => "Gold Elite",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AvatarStyle::DarkKnight => "Black neon with a sword",
            AvatarStyle::CyberKnight => "Navy blue knight",
            AvatarStyle::Ghost => "White and silver wraith",
            AvatarStyle::Lava => "Fiery warrior",
            AvatarStyle::Forest => "Forest guardian",
            AvatarStyle::Void => "Cosmic warrior",
            AvatarStyle::GoldElite => "Golden elite",
        }
    }

    /// Accepts the snake_case key or the display name, case-insensitively.
    pub fn parse(input: &str) -> Option<Self> {
        let wanted = input.trim().to_lowercase().replace([' ', '-'], "_");
        Self::ALL.into_iter().find(|style| {
            style.display_name().to_lowercase().replace(' ', "_") == wanted
                || style.key() == wanted
        })
    }

    fn key(&self) -> &'static str {
        match self {
            AvatarStyle::DarkKnight => "dark_knight",
            AvatarStyle::CyberKnight => "cyber_knight",
            AvatarStyle::Ghost => "ghost",
            AvatarStyle::Lava => "lava",
            AvatarStyle::Forest => "forest",
            AvatarStyle::Void => "void",
            AvatarStyle::GoldElite => "gold_elite",
        }
    }
}

// Which avatar is currently rendered
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActiveAvatar {
    BuiltIn { style: AvatarStyle },
    Custom { skin: CustomSkin },
}

impl Default for ActiveAvatar {
    fn default() -> Self {
        ActiveAvatar::BuiltIn { style: AvatarStyle::default() }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    #[default]
    Chat,
    Voice,
}
