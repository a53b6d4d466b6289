// Spoken output with sentence-level prosody variation

pub mod sentences;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, warn};

use crate::core::config::SpeechConfig;
use crate::core::errors::SpeechError;

pub use sentences::split_sentences;

pub const MIN_RATE: f32 = 0.1;
pub const MIN_PITCH: f32 = 0.5;
pub const MAX_PITCH: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechStyle {
    /// Human-like: jittered rate and pitch, breathing pauses
    Natural,
    /// Steady reference narrator
    Neutral,
}

impl FromStr for SpeechStyle {
    type Err = SpeechError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "natural" => Ok(SpeechStyle::Natural),
            "neutral" | "clear" => Ok(SpeechStyle::Neutral),
            other => Err(SpeechError::Synthesizer(format!("unknown speech style '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceQuality {
    Default,
    Enhanced,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Voice {
    pub identifier: String,
    pub name: String,
    /// BCP 47 tag, e.g. "zh-CN"
    pub language: String,
    pub quality: VoiceQuality,
}

/// One sentence ready for the synthesizer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utterance {
    pub id: u64,
    pub text: String,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    pub pre_delay_secs: f32,
    pub post_delay_secs: f32,
    /// Voice identifier; `None` means the system default
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesizerEvent {
    Started(u64),
    Finished(u64),
    Cancelled(u64),
}

/// Text-to-speech engine
///
/// Progress is reported through the event channel handed to the narrator.
pub trait SpeechSynthesizer: Send + Sync {
    fn voices(&self) -> Vec<Voice>;
    /// The engine's own default voice for a bare language code, if any
    fn default_voice(&self, language: &str) -> Option<Voice>;
    fn speak(&self, utterance: Utterance) -> Result<(), SpeechError>;
    /// Stop immediately; queued utterances are reported as cancelled
    fn stop_speaking(&self);
    fn is_speaking(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSessionOptions {
    pub duck_others: bool,
    pub play_in_silent_mode: bool,
}

/// Playback session for spoken audio
pub const SPOKEN_AUDIO: AudioSessionOptions = AudioSessionOptions {
    duck_others: true,
    play_in_silent_mode: true,
};

pub trait AudioSession: Send + Sync {
    fn activate(&self, options: AudioSessionOptions) -> Result<(), SpeechError>;
    fn deactivate(&self, notify_others: bool) -> Result<(), SpeechError>;
}

/// Per-style prosody constants
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prosody {
    pub rate_jitter: f32,
    pub pitch_jitter: f32,
    pub first_pre_delay: f32,
    pub pre_delay: f32,
    pub interior_post_delay: f32,
    pub final_post_delay: f32,
}

impl Prosody {
    pub fn for_style(style: SpeechStyle) -> Self {
        match style {
            SpeechStyle::Natural => Self {
                rate_jitter: 0.03,
                pitch_jitter: 0.05,
                first_pre_delay: 0.01,
                pre_delay: 0.02,
                interior_post_delay: 0.12,
                final_post_delay: 0.20,
            },
            SpeechStyle::Neutral => Self {
                rate_jitter: 0.01,
                pitch_jitter: 0.0,
                first_pre_delay: 0.01,
                pre_delay: 0.01,
                interior_post_delay: 0.06,
                final_post_delay: 0.12,
            },
        }
    }
}

/// Base values the jitter is applied around
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceSettings {
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    pub max_rate: f32,
}

fn jitter(rng: &mut impl Rng, amount: f32) -> f32 {
    if amount > 0.0 {
        rng.gen_range(-amount..=amount)
    } else {
        0.0
    }
}

/// Build the utterance plan for already-split sentences
///
/// Ids are assigned consecutively from `first_id`.
pub fn plan_utterances(
    sentences: &[String],
    style: SpeechStyle,
    settings: VoiceSettings,
    voice: Option<&str>,
    first_id: u64,
    rng: &mut impl Rng,
) -> Vec<Utterance> {
    let prosody = Prosody::for_style(style);
    let last = sentences.len().saturating_sub(1);

    sentences
        .iter()
        .enumerate()
        .map(|(index, text)| {
            let rate = (settings.rate + jitter(rng, prosody.rate_jitter))
                .clamp(MIN_RATE, settings.max_rate.max(MIN_RATE));
            let pitch = (settings.pitch + jitter(rng, prosody.pitch_jitter)).clamp(MIN_PITCH, MAX_PITCH);
            Utterance {
                id: first_id + index as u64,
                text: text.clone(),
                rate,
                pitch,
                volume: settings.volume,
                pre_delay_secs: if index == 0 {
                    prosody.first_pre_delay
                } else {
                    prosody.pre_delay
                },
                post_delay_secs: if index == last {
                    prosody.final_post_delay
                } else {
                    prosody.interior_post_delay
                },
                voice: voice.map(str::to_string),
            }
        })
        .collect()
}

/// Whether a voice tagged `voice_tag` speaks `requested`
///
/// Primary subtags must be equal; a region in the request must match too,
/// so "zh" accepts "zh-TW" while "zh-CN" does not. Case is ignored and `_`
/// is read as `-`.
pub fn language_matches(voice_tag: &str, requested: &str) -> bool {
    let normalize = |tag: &str| tag.trim().replace('_', "-").to_ascii_lowercase();
    let (voice_tag, requested) = (normalize(voice_tag), normalize(requested));
    if requested.is_empty() {
        return false;
    }
    match requested.split_once('-') {
        Some(_) => voice_tag == requested || voice_tag.starts_with(&format!("{}-", requested)),
        None => voice_tag.split('-').next() == Some(requested.as_str()),
    }
}

/// Voice choice: pinned id matching the language, then an enhanced match,
/// then any match, then the engine default for the bare code.
pub fn select_voice(
    voices: &[Voice],
    preferred: Option<&str>,
    language: &str,
    default_voice: impl FnOnce() -> Option<Voice>,
) -> Option<Voice> {
    let matches = |v: &&Voice| language_matches(&v.language, language);

    if let Some(pinned) = preferred {
        if let Some(v) = voices.iter().filter(matches).find(|v| v.identifier == pinned) {
            return Some(v.clone());
        }
    }
    if let Some(v) = voices
        .iter()
        .filter(matches)
        .find(|v| v.quality == VoiceQuality::Enhanced)
    {
        return Some(v.clone());
    }
    if let Some(v) = voices.iter().find(matches) {
        return Some(v.clone());
    }
    default_voice()
}

/// Speaks translations and tracks whether anything is being spoken
pub struct SpeechNarrator {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    audio: Arc<dyn AudioSession>,
    config: SpeechConfig,
    pending: Arc<Mutex<HashSet<u64>>>,
    speaking: Arc<watch::Sender<bool>>,
    next_id: AtomicU64,
    events_task: tokio::task::JoinHandle<()>,
}

impl SpeechNarrator {
    /// `events` carries the synthesizer's progress notifications
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        audio: Arc<dyn AudioSession>,
        config: SpeechConfig,
        mut events: mpsc::UnboundedReceiver<SynthesizerEvent>,
    ) -> Self {
        let pending: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
        let (speaking, _) = watch::channel(false);
        let speaking = Arc::new(speaking);

        let events_task = {
            let pending = Arc::clone(&pending);
            let speaking = Arc::clone(&speaking);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        SynthesizerEvent::Started(id) => {
                            if pending.lock().contains(&id) {
                                speaking.send_replace(true);
                            }
                        }
                        SynthesizerEvent::Finished(id) | SynthesizerEvent::Cancelled(id) => {
                            let drained = {
                                let mut pending = pending.lock();
                                pending.remove(&id) && pending.is_empty()
                            };
                            if drained {
                                speaking.send_replace(false);
                            }
                        }
                    }
                }
            })
        };

        Self {
            synthesizer,
            audio,
            config,
            pending,
            speaking,
            next_id: AtomicU64::new(1),
            events_task,
        }
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn speaking_watch(&self) -> watch::Receiver<bool> {
        self.speaking.subscribe()
    }

    /// Installed voices, optionally limited to one language
    pub fn available_voices(&self, language: Option<&str>) -> Vec<Voice> {
        let voices = self.synthesizer.voices();
        match language.filter(|p| !p.is_empty()) {
            Some(tag) => voices
                .into_iter()
                .filter(|v| language_matches(&v.language, tag))
                .collect(),
            None => voices,
        }
    }

    pub fn best_voice(&self, language: &str) -> Option<Voice> {
        let voices = self.synthesizer.voices();
        let voice = select_voice(&voices, self.config.preferred_voice.as_deref(), language, || {
            self.synthesizer.default_voice(language)
        });
        if voice.is_none() {
            let mut languages: Vec<&str> = voices.iter().map(|v| v.language.as_str()).collect();
            languages.sort_unstable();
            languages.dedup();
            warn!("No voice available for '{}'; installed: {:?}", language, languages);
        }
        voice
    }

    fn settings(&self, style: SpeechStyle) -> VoiceSettings {
        VoiceSettings {
            rate: match style {
                SpeechStyle::Natural => self.config.natural_base_rate,
                SpeechStyle::Neutral => self.config.neutral_base_rate,
            },
            pitch: self.config.pitch,
            volume: self.config.volume,
            max_rate: self.config.max_rate,
        }
    }

    /// The utterances `speak` would queue, without speaking
    pub fn plan(&self, text: &str, language: &str, style: SpeechStyle) -> Vec<Utterance> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let sentences = split_sentences(trimmed);
        let voice = self.best_voice(language).map(|v| v.identifier);
        let first_id = self
            .next_id
            .fetch_add(sentences.len() as u64, Ordering::Relaxed);
        plan_utterances(
            &sentences,
            style,
            self.settings(style),
            voice.as_deref(),
            first_id,
            &mut rand::thread_rng(),
        )
    }

    /// Speak `text`; empty input is a no-op
    ///
    /// Audio session failures are logged and speech proceeds anyway.
    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub fn speak(
        &self,
        text: &str,
        language: &str,
        style: SpeechStyle,
        interrupt: bool,
    ) -> Result<Vec<Utterance>, SpeechError> {
        let utterances = self.plan(text, language, style);
        if utterances.is_empty() {
            return Ok(utterances);
        }

        if let Err(e) = self.audio.activate(SPOKEN_AUDIO) {
            warn!("Failed to configure audio session: {}", e);
        }
        if interrupt && self.synthesizer.is_speaking() {
            self.pending.lock().clear();
            self.synthesizer.stop_speaking();
        }

        self.pending.lock().extend(utterances.iter().map(|u| u.id));
        for utterance in &utterances {
            if let Err(e) = self.synthesizer.speak(utterance.clone()) {
                self.pending.lock().remove(&utterance.id);
                return Err(e);
            }
        }
        debug!("Queued {} utterances in {}", utterances.len(), language);
        Ok(utterances)
    }

    /// Stop immediately and release the audio session
    pub fn stop(&self) {
        self.pending.lock().clear();
        self.synthesizer.stop_speaking();
        self.speaking.send_replace(false);
        if let Err(e) = self.audio.deactivate(true) {
            warn!("Failed to deactivate audio session: {}", e);
        }
    }
}

impl Drop for SpeechNarrator {
    fn drop(&mut self) {
        self.events_task.abort();
    }
}

/// Synthesizer for hosts without audio output
///
/// Advertises one voice per catalogued language and reports every
/// utterance as started and finished as soon as it is queued.
pub struct HeadlessSynthesizer {
    voices: Vec<Voice>,
    events: mpsc::UnboundedSender<SynthesizerEvent>,
}

impl HeadlessSynthesizer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SynthesizerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let voices = crate::core::languages::SUPPORTED_LANGUAGES
            .iter()
            .map(|l| Voice {
                identifier: format!("headless.{}", l.speech_code),
                name: l.name.to_string(),
                language: l.speech_code.to_string(),
                quality: VoiceQuality::Default,
            })
            .collect();
        (Self { voices, events }, rx)
    }
}

impl SpeechSynthesizer for HeadlessSynthesizer {
    fn voices(&self) -> Vec<Voice> {
        self.voices.clone()
    }

    fn default_voice(&self, _language: &str) -> Option<Voice> {
        None
    }

    fn speak(&self, utterance: Utterance) -> Result<(), SpeechError> {
        let _ = self.events.send(SynthesizerEvent::Started(utterance.id));
        let _ = self.events.send(SynthesizerEvent::Finished(utterance.id));
        Ok(())
    }

    fn stop_speaking(&self) {}

    fn is_speaking(&self) -> bool {
        false
    }
}

/// Audio session that accepts every request
pub struct NoopAudioSession;

impl AudioSession for NoopAudioSession {
    fn activate(&self, _options: AudioSessionOptions) -> Result<(), SpeechError> {
        Ok(())
    }

    fn deactivate(&self, _notify_others: bool) -> Result<(), SpeechError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn voice(id: &str, language: &str, quality: VoiceQuality) -> Voice {
        Voice {
            identifier: id.to_string(),
            name: id.to_string(),
            language: language.to_string(),
            quality,
        }
    }

    /// Records utterances; events are driven by the test
    struct RecordingSynthesizer {
        voices: Vec<Voice>,
        spoken: Mutex<Vec<Utterance>>,
        stops: Mutex<usize>,
        speaking: Mutex<bool>,
        events: mpsc::UnboundedSender<SynthesizerEvent>,
    }

    impl SpeechSynthesizer for RecordingSynthesizer {
        fn voices(&self) -> Vec<Voice> {
            self.voices.clone()
        }

        fn default_voice(&self, language: &str) -> Option<Voice> {
            (language == "xx").then(|| voice("engine.xx", "xx", VoiceQuality::Default))
        }

        fn speak(&self, utterance: Utterance) -> Result<(), SpeechError> {
            *self.speaking.lock() = true;
            self.spoken.lock().push(utterance);
            Ok(())
        }

        fn stop_speaking(&self) {
            *self.stops.lock() += 1;
            *self.speaking.lock() = false;
            for u in self.spoken.lock().iter() {
                let _ = self.events.send(SynthesizerEvent::Cancelled(u.id));
            }
        }

        fn is_speaking(&self) -> bool {
            *self.speaking.lock()
        }
    }

    #[derive(Default)]
    struct RecordingAudio {
        calls: Mutex<Vec<String>>,
    }

    impl AudioSession for RecordingAudio {
        fn activate(&self, options: AudioSessionOptions) -> Result<(), SpeechError> {
            self.calls.lock().push(format!(
                "activate duck={} silent={}",
                options.duck_others, options.play_in_silent_mode
            ));
            Ok(())
        }

        fn deactivate(&self, notify_others: bool) -> Result<(), SpeechError> {
            self.calls.lock().push(format!("deactivate notify={}", notify_others));
            Ok(())
        }
    }

    fn narrator(
        preferred: Option<&str>,
    ) -> (
        SpeechNarrator,
        Arc<RecordingSynthesizer>,
        Arc<RecordingAudio>,
        mpsc::UnboundedSender<SynthesizerEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let synth = Arc::new(RecordingSynthesizer {
            voices: vec![
                voice("es.basic", "es-MX", VoiceQuality::Default),
                voice("es.enhanced", "es-ES", VoiceQuality::Enhanced),
                voice("zh.basic", "zh-CN", VoiceQuality::Default),
                voice("en.pinned", "en-US", VoiceQuality::Default),
            ],
            spoken: Mutex::new(Vec::new()),
            stops: Mutex::new(0),
            speaking: Mutex::new(false),
            events: tx.clone(),
        });
        let audio = Arc::new(RecordingAudio::default());
        let config = SpeechConfig {
            preferred_voice: preferred.map(str::to_string),
            ..SpeechConfig::default()
        };
        (
            SpeechNarrator::new(synth.clone(), audio.clone(), config, rx),
            synth,
            audio,
            tx,
        )
    }

    fn settings(rate: f32) -> VoiceSettings {
        VoiceSettings {
            rate,
            pitch: 1.0,
            volume: 1.0,
            max_rate: 1.0,
        }
    }

    fn sentences(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("Sentence {}.", i)).collect()
    }

    #[test]
    fn test_natural_plan_bounds_and_pauses() {
        let mut rng = StdRng::seed_from_u64(7);
        let plan = plan_utterances(&sentences(4), SpeechStyle::Natural, settings(0.48), None, 10, &mut rng);

        assert_eq!(plan.len(), 4);
        assert_eq!(plan.iter().map(|u| u.id).collect::<Vec<_>>(), vec![10, 11, 12, 13]);
        for u in &plan {
            assert!((0.45..=0.51).contains(&u.rate), "rate {}", u.rate);
            assert!((0.95..=1.05).contains(&u.pitch), "pitch {}", u.pitch);
        }
        assert!(plan[0].pre_delay_secs < plan[1].pre_delay_secs);
        assert!(plan[3].post_delay_secs > plan[1].post_delay_secs);
        assert_eq!(plan[3].post_delay_secs, 0.20);
    }

    #[test]
    fn test_neutral_plan_is_steady() {
        let mut rng = StdRng::seed_from_u64(7);
        let plan = plan_utterances(&sentences(3), SpeechStyle::Neutral, settings(0.50), Some("v"), 1, &mut rng);
        for u in &plan {
            assert!((0.49..=0.51).contains(&u.rate));
            assert_eq!(u.pitch, 1.0);
            assert_eq!(u.pre_delay_secs, 0.01);
            assert_eq!(u.voice.as_deref(), Some("v"));
        }
        assert_eq!(plan[0].post_delay_secs, 0.06);
        assert_eq!(plan[2].post_delay_secs, 0.12);
    }

    #[test]
    fn test_rate_and_pitch_are_clamped() {
        let mut rng = StdRng::seed_from_u64(1);
        let low = VoiceSettings {
            rate: 0.0,
            pitch: 0.0,
            volume: 1.0,
            max_rate: 1.0,
        };
        let plan = plan_utterances(&sentences(5), SpeechStyle::Natural, low, None, 1, &mut rng);
        assert!(plan.iter().all(|u| u.rate >= MIN_RATE && u.pitch >= MIN_PITCH));

        let high = VoiceSettings {
            rate: 5.0,
            pitch: 9.0,
            volume: 1.0,
            max_rate: 1.0,
        };
        let plan = plan_utterances(&sentences(5), SpeechStyle::Natural, high, None, 1, &mut rng);
        assert!(plan.iter().all(|u| u.rate <= 1.0 && u.pitch <= MAX_PITCH));
    }

    #[test]
    fn test_voice_selection_order() {
        let voices = vec![
            voice("es.basic", "es-MX", VoiceQuality::Default),
            voice("es.enhanced", "es-ES", VoiceQuality::Enhanced),
            voice("fr.basic", "fr-FR", VoiceQuality::Default),
        ];
        let none = || None;

        let pinned = select_voice(&voices, Some("es.basic"), "es", none).unwrap();
        assert_eq!(pinned.identifier, "es.basic");

        // A pinned voice for another language is ignored
        let enhanced = select_voice(&voices, Some("fr.basic"), "es", none).unwrap();
        assert_eq!(enhanced.identifier, "es.enhanced");

        assert_eq!(select_voice(&voices, None, "fr", none).unwrap().identifier, "fr.basic");

        let fallback = select_voice(&voices, None, "xx", || {
            Some(voice("engine.xx", "xx", VoiceQuality::Default))
        });
        assert_eq!(fallback.unwrap().identifier, "engine.xx");
        assert!(select_voice(&voices, None, "ja", none).is_none());

        // A bare prefix of a code is not a language
        assert!(select_voice(&voices, None, "e", none).is_none());
        assert_eq!(select_voice(&voices, None, "es-MX", none).unwrap().identifier, "es.basic");
    }

    #[test]
    fn test_language_matching_uses_subtags() {
        assert!(language_matches("en-US", "en"));
        assert!(language_matches("zh_TW", "zh"));
        assert!(language_matches("zh-CN", "ZH-cn"));
        assert!(!language_matches("es-ES", "e"));
        assert!(!language_matches("zh-TW", "zh-CN"));
        assert!(!language_matches("fil-PH", "fi"));
        assert!(!language_matches("en-US", ""));
    }

    #[tokio::test]
    async fn test_speak_queues_sentences_with_audio_session() {
        let (narrator, synth, audio, _tx) = narrator(None);
        let queued = narrator
            .speak("  Hola. ¿Qué tal? ", "es", SpeechStyle::Natural, true)
            .unwrap();

        assert_eq!(queued.len(), 2);
        let spoken = synth.spoken.lock();
        assert_eq!(spoken[0].text, "Hola.");
        assert_eq!(spoken[1].voice.as_deref(), Some("es.enhanced"));
        assert_eq!(audio.calls.lock()[0], "activate duck=true silent=true");
    }

    #[tokio::test]
    async fn test_empty_text_is_noop() {
        let (narrator, synth, audio, _tx) = narrator(None);
        assert!(narrator.speak("   ", "es", SpeechStyle::Natural, true).unwrap().is_empty());
        assert!(synth.spoken.lock().is_empty());
        assert!(audio.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_voice_uses_system_default() {
        let (narrator, synth, _audio, _tx) = narrator(None);
        narrator.speak("Merhaba.", "tr", SpeechStyle::Neutral, true).unwrap();
        assert_eq!(synth.spoken.lock()[0].voice, None);

        let (narrator, _, _, _tx) = narrator_with_pin();
        assert_eq!(narrator.best_voice("en").unwrap().identifier, "en.pinned");
    }

    fn narrator_with_pin() -> (
        SpeechNarrator,
        Arc<RecordingSynthesizer>,
        Arc<RecordingAudio>,
        mpsc::UnboundedSender<SynthesizerEvent>,
    ) {
        narrator(Some("en.pinned"))
    }

    async fn wait_for(rx: &mut watch::Receiver<bool>, value: bool) {
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|v| *v == value))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_speaking_flag_follows_events() {
        let (narrator, _synth, _audio, tx) = narrator(None);
        let mut flag = narrator.speaking_watch();
        let queued = narrator
            .speak("One. Two.", "es", SpeechStyle::Natural, true)
            .unwrap();
        assert!(!narrator.is_speaking());

        tx.send(SynthesizerEvent::Started(queued[0].id)).unwrap();
        wait_for(&mut flag, true).await;

        tx.send(SynthesizerEvent::Finished(queued[0].id)).unwrap();
        tx.send(SynthesizerEvent::Started(queued[1].id)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(narrator.is_speaking());

        tx.send(SynthesizerEvent::Finished(queued[1].id)).unwrap();
        wait_for(&mut flag, false).await;
    }

    #[tokio::test]
    async fn test_interrupt_and_stop() {
        let (narrator, synth, audio, tx) = narrator(None);
        let first = narrator.speak("Uno.", "es", SpeechStyle::Natural, true).unwrap();
        tx.send(SynthesizerEvent::Started(first[0].id)).unwrap();

        let second = narrator.speak("Dos.", "es", SpeechStyle::Natural, true).unwrap();
        assert_eq!(*synth.stops.lock(), 1);

        // The cancelled first utterance must not clear the flag for the second
        tx.send(SynthesizerEvent::Started(second[0].id)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(narrator.is_speaking());

        narrator.stop();
        assert!(!narrator.is_speaking());
        assert_eq!(audio.calls.lock().last().unwrap(), "deactivate notify=true");
    }

    #[tokio::test]
    async fn test_headless_synthesizer_round_trip() {
        let (synth, rx) = HeadlessSynthesizer::new();
        let narrator = SpeechNarrator::new(Arc::new(synth), Arc::new(NoopAudioSession), SpeechConfig::default(), rx);
        let mut flag = narrator.speaking_watch();

        let queued = narrator.speak("你好。", "zh", SpeechStyle::Neutral, false).unwrap();
        assert_eq!(queued[0].voice.as_deref(), Some("headless.zh-CN"));
        wait_for(&mut flag, false).await;
        assert_eq!(narrator.available_voices(Some("ja")).len(), 1);
        assert_eq!(narrator.available_voices(None).len(), 15);
    }
}
