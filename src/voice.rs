//! Voice interaction loop
//!
//! `VoiceLoop` is a plain state machine: speech callbacks and user actions
//! come in as [`VoiceEvent`]s, and the side effects the caller has to run
//! come out as [`VoiceAction`]s. Timing lives in the caller; a scheduled
//! restart comes back as [`VoiceEvent::RestartDue`] carrying the epoch it
//! was scheduled in, so stopping the loop invalidates every pending restart.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const RESTART_AFTER_SPEECH: Duration = Duration::from_millis(600);
pub const RESTART_AFTER_RESULT: Duration = Duration::from_millis(800);
pub const RESTART_AFTER_EMPTY_RESULT: Duration = Duration::from_millis(300);
pub const RESTART_AFTER_ERROR: Duration = Duration::from_millis(700);
pub const RESTART_AFTER_BUSY: Duration = Duration::from_millis(1500);
/// How often the mouth level is refreshed while a reply is spoken
pub const SPEAKING_TICK: Duration = Duration::from_millis(80);

/// Where the voice pipeline currently is
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    #[default]
    Idle,
    /// Recognizer is capturing speech
    Listening,
    /// Speech captured, waiting for the transcript or the reply
    Processing,
    /// Reply is being synthesized
    Speaking,
}

impl VoiceState {
    pub fn is_idle(&self) -> bool {
        matches!(self, VoiceState::Idle)
    }

    pub fn is_listening(&self) -> bool {
        matches!(self, VoiceState::Listening)
    }
}

impl std::fmt::Display for VoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoiceState::Idle => write!(f, "Idle"),
            VoiceState::Listening => write!(f, "Listening"),
            VoiceState::Processing => write!(f, "Processing"),
            VoiceState::Speaking => write!(f, "Speaking"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceGender {
    #[default]
    Female,
    Male,
}

impl VoiceGender {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "female" | "f" => Some(VoiceGender::Female),
            "male" | "m" => Some(VoiceGender::Male),
            _ => None,
        }
    }
}

/// Synthesis parameters handed to the speech engine.
#[derive(Clone, Debug, PartialEq)]
pub struct VoiceProfile {
    pub language: String,
    pub gender: VoiceGender,
    pub rate: f32,
    pub pitch: f32,
}

impl VoiceProfile {
    pub fn new(language: impl Into<String>, gender: VoiceGender) -> Self {
        let (rate, pitch) = match gender {
            VoiceGender::Female => (1.05, 1.25),
            VoiceGender::Male => (0.95, 0.75),
        };
        Self {
            language: language.into(),
            gender,
            rate,
            pitch,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecognizerError {
    NoMatch,
    SpeechTimeout,
    /// The engine is still tearing down a previous session
    Busy,
    Other(i32),
}

impl RecognizerError {
    fn restart_delay(&self) -> Duration {
        match self {
            RecognizerError::Busy => RESTART_AFTER_BUSY,
            _ => RESTART_AFTER_ERROR,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum VoiceEvent {
    /// User tapped the microphone
    Toggle,
    /// Leave continuous mode
    Stop,
    ReadyForSpeech,
    RmsChanged(f32),
    /// Transcript so far, while the user is still talking
    PartialResults(String),
    EndOfSpeech,
    Results(String),
    RecognizerError(RecognizerError),
    RecognizerUnavailable,
    ReplyReady(String),
    ReplyFailed,
    SpeakStarted,
    /// Periodic while an utterance plays; drives the mouth animation
    SpeakingTick(u32),
    SpeakFinished,
    SpeakFailed,
    RestartDue(u64),
}

#[derive(Clone, Debug, PartialEq)]
pub enum VoiceAction {
    StartRecognizer,
    StopRecognizer,
    /// Send `RestartDue(epoch)` back after `delay`
    ScheduleRestart { delay: Duration, epoch: u64 },
    Submit(String),
    Speak(String),
    StopSpeaking,
}

#[derive(Debug, Default)]
pub struct VoiceLoop {
    state: VoiceState,
    continuous: bool,
    speaking: bool,
    amplitude: f32,
    transcript: String,
    epoch: u64,
}

impl VoiceLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Microphone level while listening, simulated mouth level while speaking; 0..=1
    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    /// Latest recognized text, partial or final
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn handle(&mut self, event: VoiceEvent) -> Vec<VoiceAction> {
        let before = self.state;
        let actions = self.transition(event);
        if before != self.state {
            log::debug!("Voice state {} -> {}", before, self.state);
        }
        actions
    }

    fn transition(&mut self, event: VoiceEvent) -> Vec<VoiceAction> {
        match event {
            VoiceEvent::Toggle if self.continuous => self.stop(),
            VoiceEvent::Toggle => {
                self.continuous = true;
                self.state = VoiceState::Listening;
                self.speaking = false;
                self.amplitude = 0.0;
                vec![VoiceAction::StopSpeaking, VoiceAction::StartRecognizer]
            }
            VoiceEvent::Stop => self.stop(),
            VoiceEvent::ReadyForSpeech => {
                self.state = VoiceState::Listening;
                self.amplitude = 0.0;
                Vec::new()
            }
            VoiceEvent::RmsChanged(db) => {
                self.amplitude = db.clamp(0.0, 10.0) / 10.0;
                Vec::new()
            }
            VoiceEvent::PartialResults(text) => {
                self.transcript = text;
                Vec::new()
            }
            VoiceEvent::EndOfSpeech => {
                self.state = VoiceState::Processing;
                Vec::new()
            }
            VoiceEvent::Results(text) => {
                self.amplitude = 0.0;
                self.transcript.clone_from(&text);
                if text.trim().is_empty() {
                    self.state = VoiceState::Idle;
                    self.restart_after(RESTART_AFTER_EMPTY_RESULT)
                } else {
                    self.state = VoiceState::Processing;
                    let mut actions = vec![VoiceAction::Submit(text)];
                    // Fires only if nothing else moved the loop on by then
                    actions.extend(self.restart_after(RESTART_AFTER_RESULT));
                    actions
                }
            }
            VoiceEvent::RecognizerError(error) => {
                log::warn!("Recognizer error: {:?}", error);
                self.state = VoiceState::Idle;
                self.amplitude = 0.0;
                self.restart_after(error.restart_delay())
            }
            VoiceEvent::RecognizerUnavailable => {
                log::warn!("Speech recognition is not available");
                self.state = VoiceState::Idle;
                self.amplitude = 0.0;
                Vec::new()
            }
            VoiceEvent::ReplyReady(text) if !text.trim().is_empty() => {
                vec![VoiceAction::Speak(text)]
            }
            VoiceEvent::ReplyReady(_) | VoiceEvent::ReplyFailed
                if self.state == VoiceState::Processing =>
            {
                self.state = VoiceState::Idle;
                self.restart_after(RESTART_AFTER_SPEECH)
            }
            VoiceEvent::ReplyReady(_) | VoiceEvent::ReplyFailed => Vec::new(),
            VoiceEvent::SpeakStarted => {
                self.state = VoiceState::Speaking;
                self.speaking = true;
                Vec::new()
            }
            VoiceEvent::SpeakingTick(tick) => {
                if self.speaking {
                    self.amplitude = speaking_level(tick);
                }
                Vec::new()
            }
            VoiceEvent::SpeakFinished | VoiceEvent::SpeakFailed
                if matches!(self.state, VoiceState::Idle | VoiceState::Listening) =>
            {
                // Synthesis was interrupted by a stop or a new listening session
                self.speaking = false;
                Vec::new()
            }
            VoiceEvent::SpeakFinished | VoiceEvent::SpeakFailed => {
                self.state = VoiceState::Idle;
                self.speaking = false;
                self.amplitude = 0.0;
                self.restart_after(RESTART_AFTER_SPEECH)
            }
            VoiceEvent::RestartDue(epoch) => {
                if epoch == self.epoch && self.continuous && self.state.is_idle() {
                    self.state = VoiceState::Listening;
                    vec![VoiceAction::StartRecognizer]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn stop(&mut self) -> Vec<VoiceAction> {
        self.continuous = false;
        self.epoch += 1;
        self.state = VoiceState::Idle;
        self.speaking = false;
        self.amplitude = 0.0;
        vec![VoiceAction::StopRecognizer, VoiceAction::StopSpeaking]
    }

    fn restart_after(&self, delay: Duration) -> Vec<VoiceAction> {
        if self.continuous {
            vec![VoiceAction::ScheduleRestart { delay, epoch: self.epoch }]
        } else {
            Vec::new()
        }
    }
}

/// Mouth opening for the given tick, in 0.3..=1.0. Two incommensurate
/// waves keep the pattern from looking periodic.
pub fn speaking_level(tick: u32) -> f32 {
    let t = tick as f32;
    let wave = 0.5 * (t * 1.7).sin() + 0.5 * (t * 0.63 + 1.0).sin();
    0.3 + 0.7 * (0.5 + 0.5 * wave).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restart_epoch(actions: &[VoiceAction]) -> Option<(Duration, u64)> {
        actions.iter().find_map(|a| match a {
            VoiceAction::ScheduleRestart { delay, epoch } => Some((*delay, *epoch)),
            _ => None,
        })
    }

    #[test]
    fn toggle_starts_listening() {
        let mut voice = VoiceLoop::new();
        let actions = voice.handle(VoiceEvent::Toggle);
        assert_eq!(voice.state(), VoiceState::Listening);
        assert!(voice.is_continuous());
        assert!(actions.contains(&VoiceAction::StartRecognizer));
    }

    #[test]
    fn full_cycle_returns_to_listening() {
        let mut voice = VoiceLoop::new();
        voice.handle(VoiceEvent::Toggle);
        voice.handle(VoiceEvent::ReadyForSpeech);
        voice.handle(VoiceEvent::EndOfSpeech);
        assert_eq!(voice.state(), VoiceState::Processing);

        let actions = voice.handle(VoiceEvent::Results("jaka jest pogoda".into()));
        assert_eq!(actions[0], VoiceAction::Submit("jaka jest pogoda".into()));
        let (delay, early_epoch) = restart_epoch(&actions).unwrap();
        assert_eq!(delay, RESTART_AFTER_RESULT);

        // The early restart lands while the reply is still pending
        assert!(voice.handle(VoiceEvent::RestartDue(early_epoch)).is_empty());
        assert_eq!(voice.state(), VoiceState::Processing);

        let actions = voice.handle(VoiceEvent::ReplyReady("Słonecznie".into()));
        assert_eq!(actions, vec![VoiceAction::Speak("Słonecznie".into())]);
        voice.handle(VoiceEvent::SpeakStarted);
        assert_eq!(voice.state(), VoiceState::Speaking);

        let actions = voice.handle(VoiceEvent::SpeakFinished);
        assert_eq!(voice.state(), VoiceState::Idle);
        let (delay, epoch) = restart_epoch(&actions).unwrap();
        assert_eq!(delay, RESTART_AFTER_SPEECH);

        let actions = voice.handle(VoiceEvent::RestartDue(epoch));
        assert_eq!(actions, vec![VoiceAction::StartRecognizer]);
        assert_eq!(voice.state(), VoiceState::Listening);
    }

    #[test]
    fn recognizer_errors_restart_with_delay() {
        let mut voice = VoiceLoop::new();
        voice.handle(VoiceEvent::Toggle);

        let actions = voice.handle(VoiceEvent::RecognizerError(RecognizerError::NoMatch));
        assert_eq!(voice.state(), VoiceState::Idle);
        assert_eq!(restart_epoch(&actions).unwrap().0, RESTART_AFTER_ERROR);

        let actions = voice.handle(VoiceEvent::RecognizerError(RecognizerError::Busy));
        let (delay, epoch) = restart_epoch(&actions).unwrap();
        assert_eq!(delay, RESTART_AFTER_BUSY);

        voice.handle(VoiceEvent::RestartDue(epoch));
        assert_eq!(voice.state(), VoiceState::Listening);
    }

    #[test]
    fn speak_failure_still_reaches_idle_and_restarts() {
        let mut voice = VoiceLoop::new();
        voice.handle(VoiceEvent::Toggle);
        voice.handle(VoiceEvent::Results("hej".into()));
        voice.handle(VoiceEvent::SpeakStarted);
        let actions = voice.handle(VoiceEvent::SpeakFailed);
        assert_eq!(voice.state(), VoiceState::Idle);
        assert!(restart_epoch(&actions).is_some());
    }

    #[test]
    fn empty_result_and_failed_reply_go_idle() {
        let mut voice = VoiceLoop::new();
        voice.handle(VoiceEvent::Toggle);
        let actions = voice.handle(VoiceEvent::Results("  ".into()));
        assert_eq!(voice.state(), VoiceState::Idle);
        assert_eq!(restart_epoch(&actions).unwrap().0, RESTART_AFTER_EMPTY_RESULT);

        voice.handle(VoiceEvent::Results("pytanie".into()));
        let actions = voice.handle(VoiceEvent::ReplyReady(String::new()));
        assert_eq!(voice.state(), VoiceState::Idle);
        assert_eq!(restart_epoch(&actions).unwrap().0, RESTART_AFTER_SPEECH);
    }

    #[test]
    fn stop_cancels_pending_restarts() {
        let mut voice = VoiceLoop::new();
        voice.handle(VoiceEvent::Toggle);
        let actions = voice.handle(VoiceEvent::RecognizerError(RecognizerError::SpeechTimeout));
        let (_, epoch) = restart_epoch(&actions).unwrap();

        let actions = voice.handle(VoiceEvent::Toggle);
        assert_eq!(actions, vec![VoiceAction::StopRecognizer, VoiceAction::StopSpeaking]);
        assert!(!voice.is_continuous());

        assert!(voice.handle(VoiceEvent::RestartDue(epoch)).is_empty());
        assert_eq!(voice.state(), VoiceState::Idle);
    }

    #[test]
    fn no_restart_outside_continuous_mode() {
        let mut voice = VoiceLoop::new();
        voice.handle(VoiceEvent::SpeakStarted);
        let actions = voice.handle(VoiceEvent::SpeakFinished);
        assert_eq!(voice.state(), VoiceState::Idle);
        assert!(actions.is_empty());
    }

    #[test]
    fn interrupted_speech_does_not_restart() {
        let mut voice = VoiceLoop::new();
        voice.handle(VoiceEvent::Toggle);
        voice.handle(VoiceEvent::Results("hej".into()));
        voice.handle(VoiceEvent::SpeakStarted);
        voice.handle(VoiceEvent::Stop);
        assert!(voice.handle(VoiceEvent::SpeakFinished).is_empty());
        assert_eq!(voice.state(), VoiceState::Idle);
    }

    #[test]
    fn amplitude_is_clamped() {
        let mut voice = VoiceLoop::new();
        voice.handle(VoiceEvent::RmsChanged(5.0));
        assert!((voice.amplitude() - 0.5).abs() < f32::EPSILON);
        voice.handle(VoiceEvent::RmsChanged(-2.0));
        assert_eq!(voice.amplitude(), 0.0);
        voice.handle(VoiceEvent::RmsChanged(42.0));
        assert_eq!(voice.amplitude(), 1.0);
    }

    #[test]
    fn transcript_tracks_partial_and_final_results() {
        let mut voice = VoiceLoop::new();
        voice.handle(VoiceEvent::Toggle);
        assert!(voice.handle(VoiceEvent::PartialResults("jaka".into())).is_empty());
        assert_eq!(voice.transcript(), "jaka");
        assert_eq!(voice.state(), VoiceState::Listening);

        voice.handle(VoiceEvent::Results("jaka jest pogoda".into()));
        assert_eq!(voice.transcript(), "jaka jest pogoda");
    }

    #[test]
    fn speaking_ticks_move_the_mouth_until_speech_ends() {
        let mut voice = VoiceLoop::new();
        voice.handle(VoiceEvent::Toggle);
        voice.handle(VoiceEvent::Results("hej".into()));
        voice.handle(VoiceEvent::ReplyReady("Cześć".into()));
        voice.handle(VoiceEvent::SpeakStarted);
        assert!(voice.is_speaking());

        for tick in 0..20 {
            voice.handle(VoiceEvent::SpeakingTick(tick));
            assert!((0.3..=1.0).contains(&voice.amplitude()), "{}", voice.amplitude());
        }

        voice.handle(VoiceEvent::SpeakFinished);
        assert!(!voice.is_speaking());
        assert_eq!(voice.amplitude(), 0.0);

        // A tick that was already in flight does not reopen the mouth
        voice.handle(VoiceEvent::SpeakingTick(20));
        assert_eq!(voice.amplitude(), 0.0);
    }

    #[test]
    fn stop_while_speaking_resets_the_mouth() {
        let mut voice = VoiceLoop::new();
        voice.handle(VoiceEvent::Toggle);
        voice.handle(VoiceEvent::SpeakStarted);
        voice.handle(VoiceEvent::SpeakingTick(3));
        assert!(voice.amplitude() > 0.0);

        voice.handle(VoiceEvent::Stop);
        assert!(!voice.is_speaking());
        assert_eq!(voice.amplitude(), 0.0);
    }

    #[test]
    fn profile_follows_gender() {
        let male = VoiceProfile::new("pl-PL", VoiceGender::Male);
        assert_eq!((male.rate, male.pitch), (0.95, 0.75));
        let female = VoiceProfile::new("pl-PL", VoiceGender::Female);
        assert_eq!((female.rate, female.pitch), (1.05, 1.25));
    }
}
