//! Configuration management for Parley

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::conversation::{
    BackoffPolicy, DEFAULT_ACKNOWLEDGEMENTS, DEFAULT_WAKE_PHRASES, OrchestratorSettings,
};
use crate::search::DEFAULT_RESULT_LIMIT;
use crate::voice::{SttProvider, TtsProvider};
use crate::{Error, Result};

pub use file::{ParleyConfigFile, config_file_path};

/// Default system prompt
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Parley, a helpful voice assistant. \
Answer in one to three short sentences that sound natural when spoken aloud. \
Do not use markdown and do not read out URLs.";

/// Parley configuration
#[derive(Debug)]
pub struct Config {
    /// Turn-taking timings and thresholds
    pub conversation: ConversationConfig,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// Language model configuration
    pub llm: LlmConfig,

    /// Web search configuration
    pub search: SearchConfig,

    /// Frame producer configuration
    pub frames: FramesConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Turn-taking configuration
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub silence_threshold: Duration,
    pub response_timeout: Duration,
    pub wake_cooldown: Duration,
    pub standby_idle: Duration,
    pub poll_interval: Duration,
    pub engine_settle: Duration,
    pub history_limit: usize,
    pub barge_in_min_chars: usize,
    pub echo_window: usize,
    pub speech_rate: f32,
    pub listen_while_speaking: bool,
    pub backoff: BackoffPolicy,
}

/// Voice configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Listen for the wake phrase between sessions
    pub wake_enabled: bool,

    /// Activation phrases
    pub wake_phrases: Vec<String>,

    /// Replies to a bare wake phrase
    pub acknowledgements: Vec<String>,

    /// STT provider
    pub stt_provider: SttProvider,

    /// STT model (e.g. "whisper-1")
    pub stt_model: String,

    /// TTS provider
    pub tts_provider: TtsProvider,

    /// TTS model (e.g. "tts-1")
    pub tts_model: String,

    /// TTS voice (e.g. "alloy")
    pub tts_voice: String,
}

/// Language model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint base
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// System prompt
    pub system_prompt: String,

    /// Completion length cap
    pub max_tokens: u32,

    /// HTTP timeout for one request
    pub request_timeout: Duration,
}

/// Search provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchProviderKind {
    /// Brave Search API
    Brave,
    /// Serper (Google) Search API
    Serper,
}

impl FromStr for SearchProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "brave" => Ok(Self::Brave),
            "serper" | "google" => Ok(Self::Serper),
            other => Err(Error::Config(format!("unknown search provider: {other}"))),
        }
    }
}

/// Web search configuration
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Explicit provider; otherwise whichever key is present
    pub provider: Option<SearchProviderKind>,

    /// Results used to enrich a prompt
    pub result_limit: usize,
}

/// Frame producer configuration
#[derive(Debug, Clone, Default)]
pub struct FramesConfig {
    /// Latest camera still
    pub camera_path: Option<PathBuf>,

    /// Latest screen capture
    pub screen_path: Option<PathBuf>,
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    /// Language model key (falls back to the `OpenAI` key)
    pub llm: Option<SecretString>,
    pub openai: Option<SecretString>,
    pub elevenlabs: Option<SecretString>,
    pub deepgram: Option<SecretString>,
    pub brave: Option<SecretString>,
    pub serper: Option<SecretString>,
}

/// Parse an environment value, warning when it is malformed
fn parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    raw.trim().parse().map_or_else(
        |_| {
            tracing::warn!(key, value = %raw, "ignoring malformed environment value");
            None
        },
        Some,
    )
}

fn phrase_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn secret(value: Option<String>) -> Option<SecretString> {
    value.filter(|v| !v.trim().is_empty()).map(SecretString::from)
}

impl Config {
    /// Load configuration from environment, config file and defaults
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range or a provider name is unknown
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Assemble configuration with precedence env > file > default
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range or a provider name is unknown
    pub fn from_sources(fc: ParleyConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = OrchestratorSettings::default();
        let c = fc.conversation;

        let millis = |env_key: &str, file: Option<u64>, default: Duration| {
            parsed::<u64>(&env, env_key)
                .or(file)
                .map_or(default, Duration::from_millis)
        };
        let secs = |env_key: &str, file: Option<u64>, default: Duration| {
            parsed::<u64>(&env, env_key)
                .or(file)
                .map_or(default, Duration::from_secs)
        };

        let backoff = BackoffPolicy {
            cap: secs("PARLEY_BACKOFF_CAP_SECS", c.backoff_cap_secs, defaults.backoff.cap),
            reset_after: secs(
                "PARLEY_BACKOFF_RESET_SECS",
                c.backoff_reset_secs,
                defaults.backoff.reset_after,
            ),
            max_failures: c.max_failures.unwrap_or(defaults.backoff.max_failures),
        };

        let conversation = ConversationConfig {
            silence_threshold: millis(
                "PARLEY_SILENCE_THRESHOLD_MS",
                c.silence_threshold_ms,
                defaults.silence_threshold,
            ),
            response_timeout: secs(
                "PARLEY_RESPONSE_TIMEOUT_SECS",
                c.response_timeout_secs,
                defaults.response_timeout,
            ),
            wake_cooldown: secs(
                "PARLEY_WAKE_COOLDOWN_SECS",
                c.wake_cooldown_secs,
                defaults.wake_cooldown,
            ),
            standby_idle: secs(
                "PARLEY_STANDBY_IDLE_SECS",
                c.standby_idle_secs,
                defaults.standby_idle,
            ),
            poll_interval: millis(
                "PARLEY_POLL_INTERVAL_MS",
                c.poll_interval_ms,
                defaults.poll_interval,
            ),
            engine_settle: millis(
                "PARLEY_ENGINE_SETTLE_MS",
                c.engine_settle_ms,
                defaults.engine_settle,
            ),
            history_limit: c.history_limit.unwrap_or(defaults.history_limit),
            barge_in_min_chars: c.barge_in_min_chars.unwrap_or(defaults.barge_in_min_chars),
            echo_window: c.echo_window.unwrap_or(defaults.echo_window),
            speech_rate: parsed(&env, "PARLEY_SPEECH_RATE")
                .or(c.speech_rate)
                .unwrap_or(defaults.speech_rate),
            listen_while_speaking: c
                .listen_while_speaking
                .unwrap_or(defaults.listen_while_speaking),
            backoff,
        };

        let v = fc.voice;
        let voice = VoiceConfig {
            wake_enabled: parsed(&env, "PARLEY_WAKE_ENABLED")
                .or(v.wake_enabled)
                .unwrap_or(true),
            wake_phrases: env("PARLEY_WAKE_PHRASES")
                .map(|raw| phrase_list(&raw))
                .or(v.wake_phrases)
                .unwrap_or_else(|| DEFAULT_WAKE_PHRASES.iter().map(ToString::to_string).collect()),
            acknowledgements: v.acknowledgements.unwrap_or_else(|| {
                DEFAULT_ACKNOWLEDGEMENTS
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            }),
            stt_provider: env("PARLEY_STT_PROVIDER")
                .or(v.stt_provider)
                .map_or(Ok(SttProvider::Whisper), |p| p.parse())?,
            stt_model: env("PARLEY_STT_MODEL")
                .or(v.stt_model)
                .unwrap_or_else(|| "whisper-1".to_string()),
            tts_provider: env("PARLEY_TTS_PROVIDER")
                .or(v.tts_provider)
                .map_or(Ok(TtsProvider::OpenAI), |p| p.parse())?,
            tts_model: env("PARLEY_TTS_MODEL")
                .or(v.tts_model)
                .unwrap_or_else(|| "tts-1".to_string()),
            tts_voice: env("PARLEY_TTS_VOICE")
                .or(v.tts_voice)
                .unwrap_or_else(|| "alloy".to_string()),
        };

        let l = fc.llm;
        let llm = LlmConfig {
            base_url: env("PARLEY_LLM_BASE_URL")
                .or(l.base_url)
                .unwrap_or_else(|| crate::llm::DEFAULT_BASE_URL.to_string()),
            model: env("PARLEY_LLM_MODEL")
                .or(l.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            system_prompt: env("PARLEY_SYSTEM_PROMPT")
                .or(l.system_prompt)
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_tokens: l.max_tokens.unwrap_or(300),
            request_timeout: Duration::from_secs(l.request_timeout_secs.unwrap_or(30)),
        };

        let search = SearchConfig {
            provider: env("PARLEY_SEARCH_PROVIDER")
                .or(fc.search.provider)
                .map(|p| p.parse())
                .transpose()?,
            result_limit: fc.search.result_limit.unwrap_or(DEFAULT_RESULT_LIMIT),
        };

        let frames = FramesConfig {
            camera_path: env("PARLEY_CAMERA_FRAME")
                .or(fc.frames.camera_path)
                .map(PathBuf::from),
            screen_path: env("PARLEY_SCREEN_FRAME")
                .or(fc.frames.screen_path)
                .map(PathBuf::from),
        };

        // Load API keys (env > toml > None)
        let k = fc.api_keys;
        let api_keys = ApiKeys {
            llm: secret(env("PARLEY_LLM_API_KEY").or(k.llm)),
            openai: secret(env("OPENAI_API_KEY").or(k.openai)),
            elevenlabs: secret(env("ELEVENLABS_API_KEY").or(k.elevenlabs)),
            deepgram: secret(env("DEEPGRAM_API_KEY").or(k.deepgram)),
            brave: secret(env("BRAVE_API_KEY").or(k.brave)),
            serper: secret(env("SERPER_API_KEY").or(k.serper)),
        };

        let config = Self {
            conversation,
            voice,
            llm,
            search,
            frames,
            api_keys,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending value
    pub fn validate(&self) -> Result<()> {
        let c = &self.conversation;
        let threshold = c.silence_threshold;
        if threshold < Duration::from_millis(200) || threshold > Duration::from_secs(5) {
            return Err(Error::Config(format!(
                "silence threshold must be between 200ms and 5s, got {}ms",
                threshold.as_millis()
            )));
        }
        if c.history_limit == 0 {
            return Err(Error::Config("history limit must be at least 1".to_string()));
        }
        if c.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be non-zero".to_string()));
        }
        if c.response_timeout.is_zero() {
            return Err(Error::Config("response timeout must be non-zero".to_string()));
        }
        if !c.speech_rate.is_finite() || c.speech_rate <= 0.0 {
            return Err(Error::Config(format!(
                "speech rate must be positive, got {}",
                c.speech_rate
            )));
        }
        if self.voice.wake_enabled && self.voice.wake_phrases.is_empty() {
            return Err(Error::Config(
                "wake listening is enabled but no wake phrases are set".to_string(),
            ));
        }
        Ok(())
    }

    /// Turn-taking settings for the orchestrator
    #[must_use]
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let c = &self.conversation;
        OrchestratorSettings {
            silence_threshold: c.silence_threshold,
            response_timeout: c.response_timeout,
            standby_idle: c.standby_idle,
            poll_interval: c.poll_interval,
            wake_cooldown: c.wake_cooldown,
            engine_settle: c.engine_settle,
            history_limit: c.history_limit,
            barge_in_min_chars: c.barge_in_min_chars,
            echo_window: c.echo_window,
            speech_rate: c.speech_rate,
            listen_while_speaking: c.listen_while_speaking,
            backoff: c.backoff,
            wake_enabled: self.voice.wake_enabled,
            wake_phrases: self.voice.wake_phrases.clone(),
            acknowledgements: self.voice.acknowledgements.clone(),
            search_limit: self.search.result_limit,
            ..OrchestratorSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;
    use crate::config::file::{ApiKeysFileConfig, ConversationFileConfig, VoiceFileConfig};

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_any_source() {
        let config = Config::from_sources(ParleyConfigFile::default(), env_from(&[])).unwrap();
        assert_eq!(config.conversation.silence_threshold, Duration::from_millis(1_300));
        assert_eq!(config.conversation.response_timeout, Duration::from_secs(15));
        assert_eq!(config.conversation.history_limit, 5);
        assert_eq!(config.voice.stt_provider, SttProvider::Whisper);
        assert_eq!(config.llm.base_url, crate::llm::DEFAULT_BASE_URL);
        assert!(config.api_keys.openai.is_none());
        assert!(config.search.provider.is_none());
    }

    #[test]
    fn env_overrides_file() {
        let fc = ParleyConfigFile {
            conversation: ConversationFileConfig {
                silence_threshold_ms: Some(1_500),
                history_limit: Some(3),
                ..ConversationFileConfig::default()
            },
            voice: VoiceFileConfig {
                wake_phrases: Some(vec!["hey kisan".to_string()]),
                tts_voice: Some("nova".to_string()),
                ..VoiceFileConfig::default()
            },
            api_keys: ApiKeysFileConfig {
                openai: Some("file-key".to_string()),
                ..ApiKeysFileConfig::default()
            },
            ..ParleyConfigFile::default()
        };
        let env = env_from(&[
            ("PARLEY_SILENCE_THRESHOLD_MS", "1200"),
            ("PARLEY_WAKE_PHRASES", "hey parley, ok parley"),
            ("OPENAI_API_KEY", "env-key"),
        ]);

        let config = Config::from_sources(fc, env).unwrap();
        assert_eq!(config.conversation.silence_threshold, Duration::from_millis(1_200));
        assert_eq!(config.conversation.history_limit, 3);
        assert_eq!(config.voice.wake_phrases, vec!["hey parley", "ok parley"]);
        assert_eq!(config.voice.tts_voice, "nova");
        assert_eq!(
            config.api_keys.openai.as_ref().map(ExposeSecret::expose_secret),
            Some("env-key")
        );
    }

    #[test]
    fn malformed_env_value_is_ignored() {
        let config = Config::from_sources(
            ParleyConfigFile::default(),
            env_from(&[("PARLEY_RESPONSE_TIMEOUT_SECS", "soon")]),
        )
        .unwrap();
        assert_eq!(config.conversation.response_timeout, Duration::from_secs(15));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let result = Config::from_sources(
            ParleyConfigFile::default(),
            env_from(&[("PARLEY_SILENCE_THRESHOLD_MS", "50")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn zero_history_is_rejected() {
        let fc = ParleyConfigFile {
            conversation: ConversationFileConfig {
                history_limit: Some(0),
                ..ConversationFileConfig::default()
            },
            ..ParleyConfigFile::default()
        };
        assert!(Config::from_sources(fc, env_from(&[])).is_err());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let result = Config::from_sources(
            ParleyConfigFile::default(),
            env_from(&[("PARLEY_SEARCH_PROVIDER", "altavista")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn empty_keys_count_as_missing() {
        let config = Config::from_sources(
            ParleyConfigFile::default(),
            env_from(&[("BRAVE_API_KEY", "  ")]),
        )
        .unwrap();
        assert!(config.api_keys.brave.is_none());
    }

    #[test]
    fn settings_carry_voice_and_search_values() {
        let config = Config::from_sources(
            ParleyConfigFile::default(),
            env_from(&[("PARLEY_WAKE_ENABLED", "false")]),
        )
        .unwrap();
        let settings = config.orchestrator_settings();
        assert!(!settings.wake_enabled);
        assert_eq!(settings.search_limit, DEFAULT_RESULT_LIMIT);
        assert_eq!(settings.silence_threshold, config.conversation.silence_threshold);
    }
}
