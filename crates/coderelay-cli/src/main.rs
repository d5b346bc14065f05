use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use coderelay_agent::ClaudeCliEngine;
use coderelay_channels::telegram::{TelegramBot, TelegramChat};
use coderelay_channels::ChannelBot;
use coderelay_core::{
    expand_home, formatter_for, load_config, RegistryConfig, RelayConfig, SessionRegistry,
};
use coderelay_gateway::{spawn_inactivity_sweep, Gateway};
use coderelay_settings::{JsonFileBackend, SettingsStore};

#[derive(Parser)]
#[command(name = "coderelay", version, about = "Bridge a chat bot to a coding agent")]
struct Cli {
    #[arg(
        long,
        default_value = "~/.coderelay/coderelay.yaml",
        help = "Path to the YAML config file"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    #[command(about = "Run the chat bot (default)")]
    Start,
    #[command(about = "Validate the config file and print a summary")]
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    cli.config = expand_home(&cli.config);

    let config_dir = cli
        .config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let log_dir = config_dir.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "coderelay.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Validate => {
            let config = load_config(&cli.config)?;
            println!("{}", describe_config(&config));
        }
        Commands::Start => {
            let config = load_config(&cli.config)?;
            start_bot(config).await?;
        }
    }

    Ok(())
}

fn describe_config(config: &RelayConfig) -> String {
    let allowed = config
        .channels
        .telegram
        .as_ref()
        .map(|telegram| telegram.allowed_users.len())
        .unwrap_or_default();
    format!(
        "Config valid. platform={}, agent={}, cwd={}, settings={}, inactivity timeout {}s, allowed users: {}",
        config.platform(),
        config.agent.binary,
        config.default_working_directory().display(),
        config.settings.path.display(),
        config.sessions.inactivity_timeout_secs,
        if allowed == 0 {
            "everyone".to_string()
        } else {
            allowed.to_string()
        }
    )
}

async fn start_bot(config: RelayConfig) -> Result<()> {
    let telegram = config
        .channels
        .telegram
        .clone()
        .context("channels.telegram is missing")?;

    let default_cwd = config.default_working_directory();
    tokio::fs::create_dir_all(&default_cwd)
        .await
        .with_context(|| format!("failed to create working directory: {}", default_cwd.display()))?;

    let settings = Arc::new(
        SettingsStore::open(Arc::new(JsonFileBackend::new(&config.settings.path)))
            .await
            .with_context(|| {
                format!("failed to open settings: {}", config.settings.path.display())
            })?,
    );
    let engine = Arc::new(
        ClaudeCliEngine::new(config.agent.binary.clone())
            .with_extra_args(config.agent.extra_args.clone()),
    );
    let chat = Arc::new(TelegramChat::from_token(&telegram.token));
    let formatter = formatter_for(&config.platform());

    let registry = SessionRegistry::new(
        engine,
        chat.clone(),
        formatter.clone(),
        settings.clone(),
        RegistryConfig::new(default_cwd.clone())
            .with_permission_mode(config.agent.permission_mode.clone())
            .with_system_prompt(config.agent.system_prompt.clone())
            .with_pacing(config.sessions.pacing()),
    );
    let gateway = Arc::new(Gateway::new(
        registry.clone(),
        settings,
        chat.clone(),
        formatter,
    ));

    let sweep = spawn_inactivity_sweep(
        registry,
        config.sessions.sweep_interval(),
        config.sessions.inactivity_timeout(),
    );

    tracing::info!(
        platform = %config.platform(),
        cwd = %default_cwd.display(),
        "starting coderelay"
    );
    let bot: Box<dyn ChannelBot> = Box::new(TelegramBot::new(
        chat,
        gateway,
        telegram.allowed_users.clone(),
    ));
    let channel = bot.channel_type().to_string();
    let result = bot.run().await;
    sweep.abort();
    if let Err(err) = &result {
        tracing::error!("{channel} bot exited with error: {err:#}");
    }
    result
}
