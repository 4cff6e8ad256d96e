use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use troupe_agents::{EventBus, Orchestrator};
use troupe_core::strip_dialogue_markup;

mod config;
mod render;
mod store;
mod studio;

use config::Config;
use store::SessionStore;
use studio::ConsoleStudio;

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: all tracing including streaming chunks
    Trace,
    /// Verbose: model requests/responses, agent round details
    Debug,
    /// Standard: high-level flow, orchestration milestones
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "troupe")]
#[command(author, version, about = "Multi-agent task runner", long_about = None)]
struct Cli {
    /// Task to run
    #[arg(value_name = "TASK")]
    task: String,

    /// Conversation id attached to every record
    #[arg(long, default_value = "local")]
    conversation: String,

    /// Provider for text models (overrides config)
    #[arg(long)]
    provider: Option<String>,

    /// Model for text models (overrides config)
    #[arg(short, long)]
    model: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn")]
    log_level: LogLevel,

    /// Enable debug logging (shorthand for --log-level debug)
    #[arg(short, long)]
    debug: bool,

    /// Write logs to file (JSON-lines format)
    #[arg(long)]
    log_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Resolve log level: --debug overrides --log-level
    let log_level = if cli.debug { LogLevel::Debug } else { cli.log_level };
    let filter = EnvFilter::new(log_level.as_filter());

    if let Some(log_path) = &cli.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = Config::load()?;
    config.apply_overrides(cli.provider.as_deref(), cli.model.as_deref())?;
    let resolver = Arc::new(config.build_resolver()?);

    let bus = EventBus::new(256);
    let renderer = tokio::spawn(render::run(bus.subscribe()));

    let orchestrator = Orchestrator::new(
        Arc::new(SessionStore::new()),
        Arc::new(bus.clone()),
        Arc::new(ConsoleStudio),
        resolver,
    )
    .with_events(bus.clone());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let outcome = orchestrator
        .run_task(&cli.conversation, &cli.task, None, cancel)
        .await;
    let stats = orchestrator.usage().stats();

    // Drop the remaining bus senders so the renderer sees the channel close.
    drop(orchestrator);
    drop(bus);
    let _ = renderer.await;

    if stats.session.total_tokens > 0 {
        eprintln!(
            "tokens used: {} prompt, {} completion, {} total",
            stats.session.prompt_tokens,
            stats.session.completion_tokens,
            stats.session.total_tokens
        );
    }

    match outcome {
        Ok(outcome) => {
            match outcome.content {
                Some(content) => {
                    println!();
                    println!("{}", strip_dialogue_markup(&content));
                }
                None => println!("(no answer produced)"),
            }
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            eprintln!("Aborted.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
