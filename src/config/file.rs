//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfigFile {
    /// Turn-taking timings and thresholds
    #[serde(default)]
    pub conversation: ConversationFileConfig,

    /// Voice/audio configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Language model configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Web search configuration
    #[serde(default)]
    pub search: SearchFileConfig,

    /// Camera/screen still images
    #[serde(default)]
    pub frames: FramesFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Turn-taking configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    pub silence_threshold_ms: Option<u64>,
    pub response_timeout_secs: Option<u64>,
    pub wake_cooldown_secs: Option<u64>,
    pub standby_idle_secs: Option<u64>,
    pub backoff_cap_secs: Option<u64>,
    pub backoff_reset_secs: Option<u64>,
    pub max_failures: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub engine_settle_ms: Option<u64>,
    pub history_limit: Option<usize>,
    pub barge_in_min_chars: Option<usize>,
    pub echo_window: Option<usize>,
    pub speech_rate: Option<f32>,
    pub listen_while_speaking: Option<bool>,
}

/// Voice processing configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Listen for the wake phrase between sessions
    pub wake_enabled: Option<bool>,

    /// Activation phrases (e.g. "hey parley")
    pub wake_phrases: Option<Vec<String>>,

    /// Replies to a bare wake phrase
    pub acknowledgements: Option<Vec<String>>,

    /// STT provider ("whisper" or "deepgram")
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// TTS provider ("openai" or "elevenlabs")
    pub tts_provider: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "alloy")
    pub tts_voice: Option<String>,
}

/// Language model configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible endpoint base
    pub base_url: Option<String>,

    /// Model identifier (e.g. "gpt-4o-mini")
    pub model: Option<String>,

    /// System prompt sent with every request
    pub system_prompt: Option<String>,

    /// Completion length cap
    pub max_tokens: Option<u32>,

    /// HTTP timeout for one request
    pub request_timeout_secs: Option<u64>,
}

/// Web search configuration
#[derive(Debug, Default, Deserialize)]
pub struct SearchFileConfig {
    /// "brave" or "serper"
    pub provider: Option<String>,

    /// Results used to enrich a prompt
    pub result_limit: Option<usize>,
}

/// Frame producer configuration
#[derive(Debug, Default, Deserialize)]
pub struct FramesFileConfig {
    /// Latest camera still
    pub camera_path: Option<String>,

    /// Latest screen capture
    pub screen_path: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub llm: Option<String>,
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
    pub brave: Option<String>,
    pub serper: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ParleyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ParleyConfigFile {
    config_file_path().map_or_else(ParleyConfigFile::default, |path| read_config_file(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn read_config_file(path: &Path) -> ParleyConfigFile {
    if !path.exists() {
        return ParleyConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParleyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParleyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_file_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[conversation]
silence_threshold_ms = 1500

[voice]
wake_phrases = ["hey kisan"]
"#
        )
        .unwrap();

        let config = read_config_file(file.path());
        assert_eq!(config.conversation.silence_threshold_ms, Some(1500));
        assert_eq!(
            config.voice.wake_phrases.as_deref(),
            Some(&["hey kisan".to_string()][..])
        );
        assert!(config.llm.model.is_none());
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "conversation = [not toml").unwrap();

        let config = read_config_file(file.path());
        assert!(config.conversation.silence_threshold_ms.is_none());
    }

    #[test]
    fn missing_file_is_default() {
        let config = read_config_file(Path::new("/definitely/not/here/config.toml"));
        assert!(config.voice.wake_enabled.is_none());
    }

    #[test]
    fn path_ends_in_parley_dir() {
        if let Some(path) = config_file_path() {
            assert!(path.ends_with("parley/config.toml"));
        }
    }
}
