use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use newscast::core::config::{Config, DEFAULT_CONFIG_PATH};
use newscast::services::setup::build_components;
use newscast::services::tts::create_speech_client;
use newscast::services::workflow::{resume_audio, PipelineOrchestrator};

/// Turns the day's news into a two-host podcast episode
#[derive(Parser, Debug)]
#[command(name = "newscast", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Produce one episode: collect, script, audio, feed, upload
    Run {
        /// Write feed.xml locally but do not upload it
        #[arg(long)]
        dry_run_feed: bool,
    },
    /// Keep waiting for a synthesis job submitted by an earlier run
    ResumeAudio {
        /// Job file written next to the episode outputs
        #[arg(long, value_name = "FILE")]
        job: PathBuf,
        /// Where to write the audio
        #[arg(long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Load and check the configuration, then exit
    ValidateConfig,
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping. Remote jobs keep running and can be resumed.");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match Config::load_from(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure '{}' exists with valid settings.", cli.config.display());
            return Err(e);
        }
    };

    match cli.command {
        Command::ValidateConfig => {
            config.validate()?;
            println!("{} is valid", cli.config.display());
            Ok(())
        }
        Command::ResumeAudio { job, output } => {
            config.audio.validate()?;
            let client = config.http.build_client()?;
            let speech = create_speech_client(&config.audio, client);
            let artifact = resume_audio(&config, speech, &job, &output, &cancel_on_ctrl_c())
                .await
                .with_context(|| format!("Failed to resume job from {}", job.display()))?;
            info!(
                "Audio ready: {} ({} bytes)",
                artifact.path.display(),
                artifact.file_size_bytes
            );
            println!("{}", serde_json::to_string_pretty(&artifact.job)?);
            Ok(())
        }
        Command::Run { dry_run_feed } => {
            if dry_run_feed {
                config.pipeline.upload_feed = false;
            }
            config.validate()?;
            config.ensure_directories()?;

            let components = build_components(&config)?;
            let orchestrator =
                PipelineOrchestrator::new(config, components).with_cancellation(cancel_on_ctrl_c());
            let result = orchestrator.run().await;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
