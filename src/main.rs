use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use parley::config::{self, SearchProviderKind};
use parley::voice::{
    AudioCapture, AudioPlayback, CloudRecognizer, CloudSynthesizer, ConsoleMicrophone,
    ConsoleSynthesizer, DEFAULT_WORD_DELAY, LevelMeter, PLAYBACK_SAMPLE_RATE, SpeechRecognizer,
    SpeechSynthesizer, SpeechToText, SttProvider, TextToSpeech, TtsProvider, console_microphone,
    decode_mp3, rms_energy, sine_tone,
};
use parley::{
    ChatCompletionsClient, Config, ConversationOrchestrator, FrameKind, FrameProducers,
    ImageFileSource, SearchCollaborator, SessionHandle, WebSearch,
};

/// Parley - hands-free conversational voice agent
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Type instead of talking; replies are printed
    #[arg(long, env = "PARLEY_CONSOLE")]
    console: bool,

    /// Start a session immediately instead of waiting for the wake phrase
    #[arg(long)]
    no_wake: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Print where the config file is read from
    ConfigPath,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,parley=info",
        1 => "info,parley=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => test_tts(&text).await,
            Command::ConfigPath => {
                match config::config_file_path() {
                    Some(path) => println!("{}", path.display()),
                    None => println!("no config directory on this platform"),
                }
                Ok(())
            }
        };
    }

    let mut config = Config::load()?;
    if cli.no_wake {
        config.voice.wake_enabled = false;
    }
    tracing::debug!(?config, "loaded configuration");

    let llm_key = config
        .api_keys
        .llm
        .clone()
        .or_else(|| config.api_keys.openai.clone())
        .ok_or_else(|| anyhow::anyhow!("set PARLEY_LLM_API_KEY or OPENAI_API_KEY"))?;
    let backend = Arc::new(ChatCompletionsClient::new(
        llm_key,
        config.llm.base_url.clone(),
        config.llm.model.clone(),
        config.llm.system_prompt.clone(),
        config.llm.max_tokens,
        config.llm.request_timeout,
    )?);

    let (microphone, recognizer, wake_recognizer, synthesizer) = if cli.console {
        let (mic, recognizer) = console_microphone(DEFAULT_WORD_DELAY);
        let recognizer: Arc<dyn SpeechRecognizer> = Arc::new(recognizer);
        let synthesizer: Arc<dyn SpeechSynthesizer> = Arc::new(ConsoleSynthesizer);
        // The typed stream doubles as the wake listener
        (Some(mic), Arc::clone(&recognizer), recognizer, synthesizer)
    } else {
        let recognizer: Arc<dyn SpeechRecognizer> = Arc::new(CloudRecognizer::new(stt(&config)?));
        let wake: Arc<dyn SpeechRecognizer> = Arc::new(CloudRecognizer::new(stt(&config)?));
        let synthesizer: Arc<dyn SpeechSynthesizer> =
            Arc::new(CloudSynthesizer::new(tts(&config)?));
        (None, recognizer, wake, synthesizer)
    };

    let mut builder = ConversationOrchestrator::builder(backend, recognizer, synthesizer)
        .settings(config.orchestrator_settings())
        .frames(frame_producers(&config));
    if config.voice.wake_enabled {
        builder = builder.wake_recognizer(wake_recognizer);
    }
    if let Some(search) = web_search(&config) {
        builder = builder.search(search);
    }
    let session = builder.spawn();

    if config.voice.wake_enabled {
        let phrase = config.voice.wake_phrases.first().map_or("", String::as_str);
        tracing::info!("parley ready - say \"{phrase}\"");
    } else {
        session.start().await?;
        tracing::info!("parley ready - listening");
    }
    if cli.console {
        println!("type to talk; /start /pause /resume /end /subtitles /quit");
    }

    tokio::spawn(report_states(session.clone()));

    tokio::select! {
        result = read_stdin(&session, microphone.as_ref()) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    session.shutdown().await?;
    Ok(())
}

fn stt(config: &Config) -> anyhow::Result<SpeechToText> {
    let key = match config.voice.stt_provider {
        SttProvider::Whisper => config.api_keys.openai.clone(),
        SttProvider::Deepgram => config.api_keys.deepgram.clone(),
    }
    .ok_or_else(|| anyhow::anyhow!("no API key for {:?} STT", config.voice.stt_provider))?;
    Ok(SpeechToText::new(
        config.voice.stt_provider,
        key,
        config.voice.stt_model.clone(),
    )?)
}

fn tts(config: &Config) -> anyhow::Result<TextToSpeech> {
    let key = match config.voice.tts_provider {
        TtsProvider::OpenAI => config.api_keys.openai.clone(),
        TtsProvider::ElevenLabs => config.api_keys.elevenlabs.clone(),
    }
    .ok_or_else(|| anyhow::anyhow!("no API key for {:?} TTS", config.voice.tts_provider))?;
    Ok(TextToSpeech::new(
        config.voice.tts_provider,
        key,
        config.voice.tts_voice.clone(),
        config.voice.tts_model.clone(),
    )?)
}

fn web_search(config: &Config) -> Option<Arc<dyn SearchCollaborator>> {
    let keys = &config.api_keys;
    let pick = |kind: SearchProviderKind| -> Option<WebSearch> {
        match kind {
            SearchProviderKind::Brave => keys.brave.clone().map(WebSearch::brave),
            SearchProviderKind::Serper => keys.serper.clone().map(WebSearch::serper),
        }
    };

    let search = match config.search.provider {
        Some(kind) => pick(kind),
        None => pick(SearchProviderKind::Brave).or_else(|| pick(SearchProviderKind::Serper)),
    };
    if search.is_none() {
        tracing::info!("no search key configured, prompts go out without web context");
    }
    search.map(|s| Arc::new(s) as Arc<dyn SearchCollaborator>)
}

fn frame_producers(config: &Config) -> FrameProducers {
    let mut frames = FrameProducers::default();
    if let Some(path) = &config.frames.camera_path {
        frames = frames.with_source(Arc::new(ImageFileSource::new(FrameKind::Camera, path)));
    }
    if let Some(path) = &config.frames.screen_path {
        frames = frames.with_source(Arc::new(ImageFileSource::new(FrameKind::Screen, path)));
    }
    frames
}

/// Control commands and typed speech from stdin
async fn read_stdin(
    session: &SessionHandle,
    microphone: Option<&ConsoleMicrophone>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/start" => session.start().await?,
            "/pause" => session.pause().await?,
            "/resume" => session.resume().await?,
            "/end" => session.end().await?,
            "/subtitles" => {
                let on = session.toggle_subtitles().await?;
                println!("subtitles {}", if on { "on" } else { "off" });
            }
            "/history" => {
                for turn in session.history().await? {
                    println!("you: {}\nparley: {}", turn.user_input, turn.agent_response);
                }
            }
            other if other.starts_with('/') => println!("unknown command: {other}"),
            speech => match microphone {
                Some(mic) => mic.say(speech)?,
                None => println!("typed speech needs --console"),
            },
        }
    }
    Ok(())
}

/// Log state changes as they are published
async fn report_states(session: SessionHandle) {
    let mut snapshots = session.subscribe();
    let mut last = snapshots.borrow().state;
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.state != last {
            tracing::info!(state = %snapshot.state, "conversation state");
            last = snapshot.state;
        }
        if let Some(error) = &snapshot.last_error {
            tracing::debug!(error, "last error");
        }
    }
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = mpsc::channel::<Vec<f32>>(64);
    let mut capture = AudioCapture::new()?;
    capture.start(tx)?;
    println!("---");

    for i in 0..duration {
        let mut samples = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            samples.extend(chunk);
        }

        let energy = rms_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check that the mic is plugged in and not muted.");

    Ok(())
}

/// Test speaker output
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let tone = sine_tone(440.0, Duration::from_secs(2), PLAYBACK_SAMPLE_RATE);
    play(tone).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    Ok(())
}

/// Test TTS output
async fn test_tts(text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load()?;
    let mp3 = tts(&config)?
        .synthesize(text, config.conversation.speech_rate)
        .await?;
    println!("Received {} bytes of audio", mp3.len());
    play(decode_mp3(&mp3)?).await?;

    println!("Done");
    Ok(())
}

async fn play(audio: parley::voice::DecodedAudio) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || {
        let playback = AudioPlayback::new()?;
        playback.play_blocking(audio, &AtomicBool::new(false), &LevelMeter::new())
    })
    .await??;
    Ok(())
}
