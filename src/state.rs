use crate::api::ChatBackend;
use crate::config::{normalize_server_url, AppConfig, Settings, SettingsStore};
use crate::models::{
    ActiveAvatar, AvatarStyle, ChatEntry, ChatMessage, CustomSkin, InputMode, Role,
};
use crate::storage::SkinStore;
use crate::voice::VoiceGender;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use uuid::Uuid;

/// Everything the UI renders, as one immutable snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AppSnapshot {
    pub messages: Vec<ChatEntry>,
    pub server_url: String,
    pub is_connected: bool,
    pub current_model: String,
    pub available_models: Vec<String>,
    pub is_loading: bool,
    pub input_mode: InputMode,
    pub avatar_style: AvatarStyle,
    pub active_avatar: ActiveAvatar,
    pub custom_skins: Vec<CustomSkin>,
    pub voice_gender: VoiceGender,
}

// Result of pumping one reply stream
struct StreamOutcome {
    content: String,
    cancelled: bool,
}

// Core application state shared by the front end and background tasks
#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    pub api_provider: Arc<dyn ChatBackend>, // Hold the trait object
    skins: Arc<SkinStore>,
    settings: Arc<SettingsStore>,
    snapshot: Arc<watch::Sender<AppSnapshot>>,
    // Wire-level history sent with every request; starts with the system prompt
    history: Arc<Mutex<Vec<ChatMessage>>>,
    // One stop signal per reply that is still streaming
    pub cancelled_streams: Arc<DashMap<Uuid, Arc<Notify>>>,
}

impl AppState {
    pub async fn new(
        config: AppConfig,
        api_provider: Arc<dyn ChatBackend>,
        skins: SkinStore,
        settings: SettingsStore,
    ) -> Self {
        let saved_skins = skins.load_all().await;
        let saved_settings = settings.load(&config).await;
        log::info!(
            "Restored {} custom skins, server {}",
            saved_skins.len(),
            saved_settings.server_url
        );

        let snapshot = AppSnapshot {
            messages: Vec::new(),
            server_url: saved_settings.server_url,
            is_connected: false,
            current_model: config.default_model.clone(),
            available_models: Vec::new(),
            is_loading: false,
            input_mode: InputMode::default(),
            avatar_style: AvatarStyle::default(),
            active_avatar: ActiveAvatar::default(),
            custom_skins: saved_skins,
            voice_gender: VoiceGender::default(),
        };
        let history = vec![ChatMessage::new(Role::System, config.system_prompt.clone())];
        let (snapshot_tx, _) = watch::channel(snapshot);

        Self {
            config: Arc::new(config),
            api_provider,
            skins: Arc::new(skins),
            settings: Arc::new(settings),
            snapshot: Arc::new(snapshot_tx),
            history: Arc::new(Mutex::new(history)),
            cancelled_streams: Arc::new(DashMap::new()),
        }
    }

    /// Opens the stores under the configured data directory.
    pub async fn open(config: AppConfig, api_provider: Arc<dyn ChatBackend>) -> anyhow::Result<Self> {
        let skins = SkinStore::new(&config.data_dir).await?;
        let settings = SettingsStore::new(&config.data_dir);
        Ok(Self::new(config, api_provider, skins, settings).await)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn snapshot(&self) -> AppSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppSnapshot> {
        self.snapshot.subscribe()
    }

    fn update(&self, change: impl FnOnce(&mut AppSnapshot)) {
        self.snapshot.send_modify(change);
    }

    // --- Connection & models ---

    /// Checks the server and refreshes the model list. Returns the connection status.
    pub async fn check_connection(&self) -> bool {
        let server_url = self.snapshot.borrow().server_url.clone();
        log::debug!("Checking connection to {}", server_url);

        if !self.api_provider.check_connection(&server_url).await {
            log::warn!("Server {} is not reachable", server_url);
            self.update(|s| s.is_connected = false);
            return false;
        }

        let models = match self.api_provider.fetch_models(&server_url).await {
            Ok(models) => models,
            Err(e) => {
                log::error!("Failed to fetch models from {}: {:?}", server_url, e);
                Vec::new()
            }
        };
        log::info!("Connected to {} with {} models", server_url, models.len());

        self.update(|s| {
            s.is_connected = true;
            if let Some(first) = models.first() {
                s.current_model = first.clone();
            }
            s.available_models = models;
        });
        true
    }

    pub fn select_model(&self, model: &str) {
        log::info!("Selecting model {}", model);
        let model = model.trim().to_string();
        self.update(|s| s.current_model = model);
    }

    /// Switches to another server, persists it and reconnects.
    pub async fn set_server_url(&self, url: &str) -> Result<bool, String> {
        let clean_url = normalize_server_url(url);
        if clean_url.is_empty() {
            return Err("Server URL cannot be empty.".to_string());
        }
        log::info!("Switching server to {}", clean_url);

        self.update(|s| {
            s.server_url = clean_url.clone();
            s.is_connected = false;
        });
        let saved = self
            .settings
            .save(&Settings { server_url: clean_url })
            .await;

        let connected = self.check_connection().await;
        match saved {
            Ok(()) => Ok(connected),
            Err(e) => {
                log::error!("Failed to persist server URL: {:?}", e);
                Err(format!("Server changed but could not be saved: {}", e))
            }
        }
    }

    // --- Preferences ---

    pub fn set_input_mode(&self, mode: InputMode) {
        self.update(|s| s.input_mode = mode);
    }

    pub fn set_voice_gender(&self, gender: VoiceGender) {
        self.update(|s| s.voice_gender = gender);
    }

    pub fn set_avatar_style(&self, style: AvatarStyle) {
        log::info!("Using built-in avatar {}", style.display_name());
        self.update(|s| {
            s.avatar_style = style;
            s.active_avatar = ActiveAvatar::BuiltIn { style };
        });
    }

    pub fn set_custom_avatar(&self, skin_id: Uuid) -> Result<(), String> {
        let skin = self
            .snapshot
            .borrow()
            .custom_skins
            .iter()
            .find(|skin| skin.id == skin_id)
            .cloned();
        let Some(skin) = skin else {
            return Err(format!("No custom skin with ID {}", skin_id));
        };
        log::info!("Using custom avatar {}", skin.name);
        self.update(|s| s.active_avatar = ActiveAvatar::Custom { skin });
        Ok(())
    }

    // --- Custom skins ---

    /// Imports a model file and makes it the active avatar.
    pub async fn import_skin(&self, source: &Path, display_name: &str) -> Result<CustomSkin, String> {
        let skin = self
            .skins
            .import(source, display_name)
            .await
            .map_err(|e| {
                log::error!("Skin import failed: {:?}", e);
                format!("Failed to import skin: {:#}", e)
            })?;

        let all = self.skins.load_all().await;
        let active = skin.clone();
        self.update(|s| {
            s.custom_skins = all;
            s.active_avatar = ActiveAvatar::Custom { skin: active };
        });
        Ok(skin)
    }

    /// Deletes a skin; an active one is replaced by the built-in avatar.
    pub async fn delete_skin(&self, skin_id: Uuid) -> Result<bool, String> {
        let removed = self.skins.delete(skin_id).await.map_err(|e| {
            log::error!("Skin delete failed: {:?}", e);
            format!("Failed to delete skin: {:#}", e)
        })?;

        let all = self.skins.load_all().await;
        self.update(|s| {
            s.custom_skins = all;
            if matches!(&s.active_avatar, ActiveAvatar::Custom { skin } if skin.id == skin_id) {
                s.active_avatar = ActiveAvatar::BuiltIn { style: s.avatar_style };
            }
        });
        Ok(removed)
    }

    // --- Chat ---

    /// Sends a user message and streams the reply into a new assistant turn.
    ///
    /// Returns the complete reply, or `None` when the input was blank, the
    /// request failed (the turn then shows the error) or the stream was stopped.
    pub async fn send_message(&self, text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let assistant_id = Uuid::new_v4();
        // Registered before the turn shows up, so it can be stopped right away
        let cancel = Arc::new(Notify::new());
        self.cancelled_streams.insert(assistant_id, cancel.clone());
        self.update(|s| {
            s.messages.push(ChatEntry::user(text));
            s.messages.push(ChatEntry::streaming_assistant(assistant_id));
            s.is_loading = true;
        });

        let request_history = {
            let mut history = self.history.lock().await;
            history.push(ChatMessage::new(Role::User, text));
            history.clone()
        }; // Lock is released before the network call

        let (server_url, model) = {
            let s = self.snapshot.borrow();
            (s.server_url.clone(), s.current_model.clone())
        };

        let outcome = self
            .stream_reply(assistant_id, &cancel, &server_url, &model, &request_history)
            .await;

        let reply = self.complete_reply(assistant_id, outcome).await;
        // Only after the entry stopped streaming, so a late stop finds no signal
        self.cancelled_streams.remove(&assistant_id);
        reply
    }

    async fn complete_reply(
        &self,
        assistant_id: Uuid,
        outcome: anyhow::Result<StreamOutcome>,
    ) -> Option<String> {
        match outcome {
            Ok(StreamOutcome { content, cancelled }) => {
                log::info!(
                    "Reply {} finished ({} chars{})",
                    assistant_id,
                    content.len(),
                    if cancelled { ", stopped" } else { "" }
                );
                let final_content = content.clone();
                self.finish_entry(assistant_id, move |entry| entry.content = final_content);
                if !content.is_empty() {
                    self.history
                        .lock()
                        .await
                        .push(ChatMessage::new(Role::Assistant, content.clone()));
                }
                (!cancelled).then_some(content)
            }
            Err(e) => {
                log::error!("Chat request for reply {} failed: {:?}", assistant_id, e);
                let message = format!("Błąd: {:#}", e);
                self.finish_entry(assistant_id, move |entry| entry.content = message);
                None
            }
        }
    }

    async fn stream_reply(
        &self,
        assistant_id: Uuid,
        cancel: &Notify,
        server_url: &str,
        model: &str,
        history: &[ChatMessage],
    ) -> anyhow::Result<StreamOutcome> {
        // The server may take a long time to answer at all, e.g. while loading a model
        let mut delta_stream = tokio::select! {
            biased;
            _ = cancel.notified() => {
                log::warn!("Cancellation requested for reply {} before it started.", assistant_id);
                return Ok(StreamOutcome { content: String::new(), cancelled: true });
            }
            stream = self.api_provider.stream_chat(server_url, model, history) => stream?,
        };

        let mut content = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.notified() => {
                    log::warn!("Cancellation requested for reply {}. Stopping stream.", assistant_id);
                    return Ok(StreamOutcome { content, cancelled: true });
                }
                next = delta_stream.next() => next,
            };
            let Some(delta_result) = next else {
                break;
            };

            let delta = delta_result?;
            log::debug!("Reply {}: received chunk", assistant_id);
            content.push_str(&delta);
            self.update(|s| {
                if let Some(entry) = s.messages.iter_mut().find(|m| m.id == assistant_id) {
                    entry.content.push_str(&delta);
                }
            });
        }

        Ok(StreamOutcome { content, cancelled: false })
    }

    fn finish_entry(&self, entry_id: Uuid, change: impl FnOnce(&mut ChatEntry)) {
        self.update(|s| {
            if let Some(entry) = s.messages.iter_mut().find(|m| m.id == entry_id) {
                change(entry);
                entry.is_streaming = false;
            }
            s.is_loading = s.messages.iter().any(|m| m.is_streaming);
        });
    }

    /// Asks an in-flight reply to stop; the text received so far is kept.
    pub fn stop_generation(&self, message_id: Uuid) -> bool {
        let streaming = self
            .snapshot
            .borrow()
            .messages
            .iter()
            .any(|m| m.id == message_id && m.is_streaming);
        if !streaming {
            return false;
        }
        match self.cancelled_streams.get(&message_id) {
            Some(cancel) => {
                // Stored as a permit if the stream is between two polls
                cancel.notify_one();
                log::info!("Cancellation signal sent to reply {}", message_id);
                true
            }
            None => false,
        }
    }

    /// Ids of replies that are still streaming.
    pub fn streaming_replies(&self) -> Vec<Uuid> {
        self.snapshot
            .borrow()
            .messages
            .iter()
            .filter(|m| m.is_streaming)
            .map(|m| m.id)
            .collect()
    }

    pub async fn clear_conversation(&self) {
        log::info!("Clearing conversation");
        {
            let mut history = self.history.lock().await;
            history.clear();
            history.push(ChatMessage::new(Role::System, self.config.system_prompt.clone()));
        }
        self.update(|s| {
            s.messages.clear();
            s.is_loading = false;
        });
    }

    pub async fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().await.clone()
    }
}
