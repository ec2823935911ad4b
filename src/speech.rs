use crate::voice::{
    VoiceAction, VoiceEvent, VoiceGender, VoiceLoop, VoiceProfile, VoiceState, SPEAKING_TICK,
};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

pub type VoiceEventSender = mpsc::UnboundedSender<VoiceEvent>;

// Platform speech-to-text engine
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Begins one recognition session. Progress and results are reported
    /// through `events`; an `Err` means recognition is unavailable.
    async fn start_listening(&self, language: &str, events: VoiceEventSender) -> Result<()>;

    async fn stop_listening(&self);
}

// Platform text-to-speech engine
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speaks `text`, returning once the utterance finished or was stopped.
    async fn speak(&self, text: &str, profile: &VoiceProfile) -> Result<()>;

    async fn stop(&self);
}

/// Snapshot of the voice loop for observers
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VoiceStatus {
    pub state: VoiceState,
    pub continuous: bool,
    pub is_speaking: bool,
    pub amplitude: f32,
    pub transcript: String,
}

/// Cloneable front of a running voice controller.
#[derive(Clone)]
pub struct VoiceHandle {
    events: VoiceEventSender,
    status: watch::Receiver<VoiceStatus>,
    profile: Arc<watch::Sender<VoiceProfile>>,
}

impl VoiceHandle {
    /// Feeds a platform callback or user action into the loop.
    pub fn send(&self, event: VoiceEvent) {
        if self.events.send(event).is_err() {
            log::warn!("Voice controller is gone; dropping event");
        }
    }

    pub fn toggle(&self) {
        self.send(VoiceEvent::Toggle);
    }

    pub fn stop(&self) {
        self.send(VoiceEvent::Stop);
    }

    pub fn reply_ready(&self, text: String) {
        self.send(VoiceEvent::ReplyReady(text));
    }

    pub fn reply_failed(&self) {
        self.send(VoiceEvent::ReplyFailed);
    }

    pub fn set_gender(&self, gender: VoiceGender) {
        self.profile.send_modify(|profile| {
            *profile = VoiceProfile::new(profile.language.clone(), gender);
        });
    }

    pub fn status(&self) -> VoiceStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<VoiceStatus> {
        self.status.clone()
    }
}

struct VoiceController {
    machine: VoiceLoop,
    recognizer: Arc<dyn SpeechRecognizer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    events: mpsc::WeakUnboundedSender<VoiceEvent>,
    status: watch::Sender<VoiceStatus>,
    profile: watch::Receiver<VoiceProfile>,
    transcripts: mpsc::UnboundedSender<String>,
}

/// Starts the voice loop on the current tokio runtime.
///
/// Recognized utterances arrive on the returned receiver; the consumer answers
/// each one with [`VoiceHandle::reply_ready`] or [`VoiceHandle::reply_failed`].
/// The controller stops once every handle is dropped; recognizers only keep
/// a weak reference to the event channel.
pub fn spawn_voice_controller(
    recognizer: Arc<dyn SpeechRecognizer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    profile: VoiceProfile,
) -> (VoiceHandle, mpsc::UnboundedReceiver<String>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (transcripts_tx, transcripts_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(VoiceStatus::default());
    let (profile_tx, profile_rx) = watch::channel(profile);

    let controller = VoiceController {
        machine: VoiceLoop::new(),
        recognizer,
        synthesizer,
        events: events_tx.downgrade(),
        status: status_tx,
        profile: profile_rx,
        transcripts: transcripts_tx,
    };
    tokio::spawn(controller.run(events_rx));

    let handle = VoiceHandle {
        events: events_tx,
        status: status_rx,
        profile: Arc::new(profile_tx),
    };
    (handle, transcripts_rx)
}

impl VoiceController {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<VoiceEvent>) {
        log::info!("Voice controller started");
        while let Some(event) = events.recv().await {
            let actions = self.machine.handle(event);
            for action in actions {
                self.execute(action).await;
            }
            // Observers only see a state once its side effects have run
            self.status.send_replace(VoiceStatus {
                state: self.machine.state(),
                continuous: self.machine.is_continuous(),
                is_speaking: self.machine.is_speaking(),
                amplitude: self.machine.amplitude(),
                transcript: self.machine.transcript().to_string(),
            });
        }
        self.recognizer.stop_listening().await;
        self.synthesizer.stop().await;
        log::info!("Voice controller stopped");
    }

    async fn execute(&self, action: VoiceAction) {
        let Some(events) = self.events.upgrade() else {
            return;
        };

        match action {
            VoiceAction::StartRecognizer => {
                let language = self.profile.borrow().language.clone();
                log::debug!("Starting recognizer ({})", language);
                if let Err(e) = self.recognizer.start_listening(&language, events.clone()).await {
                    log::error!("Failed to start speech recognition: {:?}", e);
                    let _ = events.send(VoiceEvent::RecognizerUnavailable);
                }
            }
            VoiceAction::StopRecognizer => self.recognizer.stop_listening().await,
            VoiceAction::ScheduleRestart { delay, epoch } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(VoiceEvent::RestartDue(epoch));
                });
            }
            VoiceAction::Submit(text) => {
                log::info!("Recognized utterance ({} chars)", text.len());
                if self.transcripts.send(text).is_err() {
                    log::warn!("No transcript consumer; treating reply as failed");
                    let _ = events.send(VoiceEvent::ReplyFailed);
                }
            }
            VoiceAction::Speak(text) => {
                let synthesizer = self.synthesizer.clone();
                let profile = self.profile.borrow().clone();
                tokio::spawn(async move {
                    let _ = events.send(VoiceEvent::SpeakStarted);
                    let mut speech = synthesizer.speak(&text, &profile);
                    let mut ticker = tokio::time::interval(SPEAKING_TICK);
                    let mut tick: u32 = 0;
                    let result = loop {
                        tokio::select! {
                            result = &mut speech => break result,
                            _ = ticker.tick() => {
                                let _ = events.send(VoiceEvent::SpeakingTick(tick));
                                tick = tick.wrapping_add(1);
                            }
                        }
                    };
                    let finished = match result {
                        Ok(()) => VoiceEvent::SpeakFinished,
                        Err(e) => {
                            log::error!("Speech synthesis failed: {:?}", e);
                            VoiceEvent::SpeakFailed
                        }
                    };
                    let _ = events.send(finished);
                });
            }
            VoiceAction::StopSpeaking => self.synthesizer.stop().await,
        }
    }
}

// --- Terminal stand-ins for the platform engines ---

/// Treats typed lines as recognition results while a session is open.
#[derive(Default)]
pub struct ConsoleRecognizer {
    session: Mutex<Option<mpsc::WeakUnboundedSender<VoiceEvent>>>,
}

impl ConsoleRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `text` as the result of the open session. Returns false when
    /// nothing is listening.
    pub async fn deliver(&self, text: &str) -> bool {
        let session = self.session.lock().await.take();
        let Some(events) = session.and_then(|weak| weak.upgrade()) else {
            return false;
        };
        let _ = events.send(VoiceEvent::EndOfSpeech);
        events.send(VoiceEvent::Results(text.to_string())).is_ok()
    }
}

#[async_trait]
impl SpeechRecognizer for ConsoleRecognizer {
    async fn start_listening(&self, language: &str, events: VoiceEventSender) -> Result<()> {
        log::debug!("Console recognizer listening ({})", language);
        let _ = events.send(VoiceEvent::ReadyForSpeech);
        *self.session.lock().await = Some(events.downgrade());
        Ok(())
    }

    async fn stop_listening(&self) {
        self.session.lock().await.take();
    }
}

/// Prints utterances instead of playing them.
pub struct ConsoleSynthesizer;

#[async_trait]
impl SpeechSynthesizer for ConsoleSynthesizer {
    async fn speak(&self, text: &str, profile: &VoiceProfile) -> Result<()> {
        println!(
            "[speaking {:?}, rate {:.2}, pitch {:.2}] {}",
            profile.gender, profile.rate, profile.pitch, text
        );
        Ok(())
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct RecordingSynthesizer {
        spoken: Mutex<Vec<(String, VoiceGender)>>,
    }

    #[async_trait]
    impl SpeechSynthesizer for RecordingSynthesizer {
        async fn speak(&self, text: &str, profile: &VoiceProfile) -> Result<()> {
            self.spoken.lock().await.push((text.to_string(), profile.gender));
            Ok(())
        }

        async fn stop(&self) {}
    }

    struct UnavailableRecognizer;

    #[async_trait]
    impl SpeechRecognizer for UnavailableRecognizer {
        async fn start_listening(&self, _language: &str, _events: VoiceEventSender) -> Result<()> {
            Err(anyhow::anyhow!("no recognition service"))
        }

        async fn stop_listening(&self) {}
    }

    async fn wait_for(
        status: &mut watch::Receiver<VoiceStatus>,
        wanted: impl Fn(&VoiceStatus) -> bool,
    ) -> VoiceStatus {
        let current = tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| wanted(s)))
            .await
            .expect("timed out waiting for voice status")
            .expect("voice controller stopped");
        VoiceStatus::clone(&current)
    }

    #[tokio::test(start_paused = true)]
    async fn utterance_is_answered_spoken_and_listening_resumes() {
        let recognizer = Arc::new(ConsoleRecognizer::new());
        let synthesizer = Arc::new(RecordingSynthesizer { spoken: Mutex::new(Vec::new()) });
        let (voice, mut transcripts) = spawn_voice_controller(
            recognizer.clone(),
            synthesizer.clone(),
            VoiceProfile::new("pl-PL", VoiceGender::Female),
        );
        let mut status = voice.subscribe();

        voice.set_gender(VoiceGender::Male);
        voice.toggle();
        wait_for(&mut status, |s| s.state == VoiceState::Listening && s.continuous).await;

        voice.send(VoiceEvent::PartialResults("która".into()));
        wait_for(&mut status, |s| s.transcript == "która").await;

        assert!(recognizer.deliver("która godzina").await);
        let heard = transcripts.recv().await.unwrap();
        assert_eq!(heard, "która godzina");
        wait_for(&mut status, |s| s.transcript == "która godzina").await;

        voice.reply_ready("Jest południe".into());
        // Speaking, back to idle, and after the restart delay listening again
        wait_for(&mut status, |s| s.state == VoiceState::Listening).await;
        assert_eq!(
            synthesizer.spoken.lock().await.clone(),
            vec![("Jest południe".to_string(), VoiceGender::Male)]
        );

        voice.toggle();
        let stopped = wait_for(&mut status, |s| !s.continuous).await;
        assert_eq!(stopped.state, VoiceState::Idle);
        assert!(!recognizer.deliver("ignored").await);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_recognizer_falls_back_to_idle() {
        let (voice, _transcripts) = spawn_voice_controller(
            Arc::new(UnavailableRecognizer),
            Arc::new(ConsoleSynthesizer),
            VoiceProfile::new("pl-PL", VoiceGender::Female),
        );
        let mut status = voice.subscribe();
        voice.toggle();
        let settled = wait_for(&mut status, |s| s.continuous && s.state == VoiceState::Idle).await;
        assert_eq!(settled.amplitude, 0.0);
    }

    // Speaks until stopped
    struct EndlessSynthesizer {
        stopped: tokio::sync::Notify,
    }

    #[async_trait]
    impl SpeechSynthesizer for EndlessSynthesizer {
        async fn speak(&self, _text: &str, _profile: &VoiceProfile) -> Result<()> {
            self.stopped.notified().await;
            Ok(())
        }

        async fn stop(&self) {
            self.stopped.notify_one();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mouth_moves_while_speaking_and_rests_after_stop() {
        let (voice, _transcripts) = spawn_voice_controller(
            Arc::new(ConsoleRecognizer::new()),
            Arc::new(EndlessSynthesizer { stopped: tokio::sync::Notify::new() }),
            VoiceProfile::new("pl-PL", VoiceGender::Female),
        );
        let mut status = voice.subscribe();

        // Not continuous, so the reply is spoken without a processing step
        voice.reply_ready("Dzień dobry".into());
        let speaking = wait_for(&mut status, |s| s.is_speaking && s.amplitude > 0.0).await;
        assert_eq!(speaking.state, VoiceState::Speaking);
        assert!(speaking.amplitude >= 0.3);

        voice.stop();
        let rested = wait_for(&mut status, |s| !s.is_speaking).await;
        assert_eq!(rested.state, VoiceState::Idle);
        assert_eq!(rested.amplitude, 0.0);
        assert_eq!(voice.status().amplitude, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_session_does_not_keep_the_controller_alive() {
        let recognizer = Arc::new(ConsoleRecognizer::new());
        let (voice, _transcripts) = spawn_voice_controller(
            recognizer.clone(),
            Arc::new(ConsoleSynthesizer),
            VoiceProfile::new("pl-PL", VoiceGender::Female),
        );
        let mut status = voice.subscribe();
        voice.toggle();
        wait_for(&mut status, |s| s.state == VoiceState::Listening).await;

        drop(voice);
        tokio::time::timeout(Duration::from_secs(5), async {
            while status.changed().await.is_ok() {}
        })
        .await
        .expect("voice controller kept running");
        assert!(!recognizer.deliver("po wszystkim").await);
    }
}
