use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kalakriti_kit::auth::{Authorization, TOKEN_ENV_VAR};
use kalakriti_kit::audio::CpalMicrophone;
use kalakriti_kit::capture::MicrophoneController;
use kalakriti_kit::media::{MediaAsset, MediaKind};
use kalakriti_kit::settings::{load_settings, save_settings, settings_path, AppSettings};
use kalakriti_kit::state_machine::Event;
use kalakriti_kit::submission::{HttpBackend, Platform, SubmissionPipeline};
use kalakriti_kit::{Devices, Studio, StudioOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Parser)]
#[command(name = "kalakriti-kit", about = "Capture a craft photo and its story, get a marketing kit back")]
struct Cli {
    /// ID token for the generation service
    #[arg(long, env = TOKEN_ENV_VAR, hide_env_values = true, global = true)]
    token: Option<String>,

    /// Override the backend base URL from settings
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit an image and an audio story in one shot
    Submit {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        audio: PathBuf,
        /// instagram, facebook, twitter_x or linkedin
        #[arg(long)]
        platform: Option<Platform>,
        /// Write the generated image here, if the service returns one
        #[arg(long)]
        save_image: Option<PathBuf>,
    },
    /// Record a story from the default microphone into a WAV file
    Record {
        #[arg(long)]
        output: PathBuf,
        /// Stop after this many seconds instead of waiting for Enter
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Interactive session driven from stdin; prints UI state as JSON
    Studio,
    /// Print the effective settings, optionally writing them back to disk
    Config {
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let path = match cli.settings.clone() {
        Some(path) => Some(path),
        None => match settings_path() {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("Settings: {}", e);
                None
            }
        },
    };
    let mut settings = path
        .as_deref()
        .map(load_settings)
        .unwrap_or_default();
    if let Some(url) = &cli.backend_url {
        settings.backend_url = url.clone();
    }

    let auth = cli.token.as_deref().and_then(|t| Authorization::bearer(t).ok());

    let result = match cli.command {
        Command::Submit {
            image,
            audio,
            platform,
            save_image,
        } => run_submit(&settings, auth, image, audio, platform, save_image).await,
        Command::Record { output, seconds } => run_record(output, seconds).await,
        Command::Studio => run_studio(settings, auth).await,
        Command::Config { write } => run_config(&settings, path.as_deref(), write),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_submit(
    settings: &AppSettings,
    auth: Option<Authorization>,
    image: PathBuf,
    audio: PathBuf,
    platform: Option<Platform>,
    save_image: Option<PathBuf>,
) -> CliResult {
    let image = MediaAsset::from_path(&image, MediaKind::Image).await?;
    let audio = MediaAsset::from_path(&audio, MediaKind::Audio).await?;
    let backend = HttpBackend::new(&settings.backend_url, settings.request_timeout())?;
    let pipeline = SubmissionPipeline::new(Arc::new(backend), CancellationToken::new());

    let platform = platform.unwrap_or(settings.default_platform);
    let kit = tokio::select! {
        result = pipeline.submit(Some(&image), Some(&audio), Some(platform), auth.as_ref()) => result?,
        _ = tokio::signal::ctrl_c() => {
            pipeline.close();
            return Err("Interrupted".into());
        }
    };

    println!("{}", serde_json::to_string_pretty(&kit)?);

    if let (Some(path), Some(generated)) = (save_image, &kit.generated_image) {
        tokio::fs::write(&path, &generated.bytes).await?;
        log::info!("Generated image written to {:?}", path);
    }
    Ok(())
}

fn run_config(settings: &AppSettings, path: Option<&Path>, write: bool) -> CliResult {
    println!("{}", serde_json::to_string_pretty(settings)?);
    if write {
        let path = path.ok_or("No settings path available")?;
        save_settings(path, settings)?;
        eprintln!("Settings written to {:?}", path);
    }
    Ok(())
}

async fn run_record(output: PathBuf, seconds: Option<u64>) -> CliResult {
    if let Some(name) = CpalMicrophone::default_device_name() {
        log::info!("Recording from {}", name);
    }
    let mut controller =
        MicrophoneController::new(Arc::new(CpalMicrophone::new()), CancellationToken::new());
    controller.start().await?;

    match seconds {
        Some(secs) => {
            eprintln!("Recording for {}s...", secs);
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
        None => {
            eprintln!("Recording... press Enter to stop");
            let mut line = String::new();
            BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        }
    }

    match controller.stop().await? {
        Some(asset) => {
            tokio::fs::write(&output, asset.bytes()).await?;
            eprintln!("Wrote {} bytes to {:?}", asset.len(), output);
            Ok(())
        }
        None => Err("Recording was not running".into()),
    }
}

const STUDIO_HELP: &str = "commands: record | stop | discard | image <path> | audio <path> | \
remove-image | remove-audio | platform <id> | submit | cancel | reset | metrics | quit";

async fn run_studio(settings: AppSettings, auth: Option<Authorization>) -> CliResult {
    let backend = HttpBackend::new(&settings.backend_url, settings.request_timeout())?;
    let studio = Studio::launch(
        StudioOptions::from_settings(settings),
        Devices {
            microphone: Arc::new(CpalMicrophone::new()),
            camera: None,
        },
        Arc::new(backend),
    );

    let mut ui = studio.subscribe();
    let printer = tokio::spawn(async move {
        while ui.changed().await.is_ok() {
            let state = ui.borrow_and_update().clone();
            match serde_json::to_string(&state) {
                Ok(json) => println!("{}", json),
                Err(e) => log::warn!("Failed to serialize UI state: {}", e),
            }
        }
    });

    eprintln!("{}", STUDIO_HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.trim().splitn(2, ' ');
        let command = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim);

        let event = match (command, arg) {
            ("", _) => continue,
            ("quit" | "exit", _) => break,
            ("record", _) => Event::StartRecording,
            ("stop", _) => Event::StopRecording,
            ("discard", _) => Event::DiscardRecording,
            ("remove-image", _) => Event::RemoveImage,
            ("remove-audio", _) => Event::RemoveAudio,
            ("cancel", _) => Event::CancelSubmission,
            ("reset", _) => Event::StartOver,
            ("submit", _) => Event::Submit { auth: auth.clone() },
            ("image", Some(path)) => {
                if let Err(e) = studio.select_image_file(Path::new(path)).await {
                    eprintln!("{}", e);
                }
                continue;
            }
            ("audio", Some(path)) => {
                if let Err(e) = studio.select_audio_file(Path::new(path)).await {
                    eprintln!("{}", e);
                }
                continue;
            }
            ("platform", Some(id)) => match id.parse::<Platform>() {
                Ok(platform) => Event::PlatformSelected { platform },
                Err(e) => {
                    eprintln!("{}", e);
                    continue;
                }
            },
            ("metrics", _) => {
                let summary = studio.metrics_summary().await;
                println!("{}", serde_json::to_string(&summary)?);
                continue;
            }
            _ => {
                eprintln!("{}", STUDIO_HELP);
                continue;
            }
        };

        if studio.send(event).await.is_err() {
            break;
        }
    }

    studio.shutdown().await;
    printer.abort();
    Ok(())
}
