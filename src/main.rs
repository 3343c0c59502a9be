use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rss2transmission::cache::CacheFile;
use rss2transmission::config::{Config, ConfigHandle};
use rss2transmission::feed::HttpFeedSource;
use rss2transmission::poll::{run_cycle, CycleContext, CycleOptions, RunMode};
use rss2transmission::prompt::TerminalPrompter;
use rss2transmission::transmission::TransmissionClient;
use rss2transmission::vpn::{GluetunClient, RotationController};
use rss2transmission::watch::{spawn_reload_listener, WatchOptions, Watcher, RELOAD_POLL_INTERVAL};

#[derive(Parser, Debug)]
#[command(
    name = "rss2transmission",
    about = "Submit matching RSS/Atom feed entries to Transmission"
)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    /// Include source file and line in log output
    #[arg(long, global = true)]
    lines: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    /// Config file (default: first of ~/.rss2transmission, ~/.config/rss2transmission, /etc/rss2transmission)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the seen cache file from the config
    #[arg(long, value_name = "FILE", global = true)]
    seen_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check all feeds once
    Once(OnceArgs),
    /// Check feeds periodically until interrupted
    Watch(WatchArgs),
    /// Print the version
    Version,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("action").multiple(false)))]
struct OnceArgs {
    /// Limit to the given feed(s)
    #[arg(long = "feed", value_name = "NAME")]
    feeds: Vec<String>,

    /// Download .torrent files instead of submitting them
    #[arg(short, long, group = "action")]
    download: bool,

    /// Directory for downloaded .torrent files (default: current directory)
    #[arg(short = 'p', long, value_name = "DIR")]
    download_path: Option<PathBuf>,

    /// Ask what to do with every match
    #[arg(short, long, group = "action")]
    interactive: bool,

    /// Only print matches
    #[arg(short, long, group = "action")]
    no_action: bool,

    /// Mark every match as seen without acting
    #[arg(short, long, group = "action")]
    skip: bool,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Limit to the given feed(s)
    #[arg(long = "feed", value_name = "NAME")]
    feeds: Vec<String>,

    /// Download .torrent files instead of submitting them
    #[arg(short, long)]
    download: bool,

    /// Directory for downloaded .torrent files (default: current directory)
    #[arg(short = 'p', long, value_name = "DIR")]
    download_path: Option<PathBuf>,

    /// Seconds between cycles
    #[arg(short, long, default_value_t = 300)]
    sleep: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(cli.lines)
        .with_line_number(cli.lines);

    match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file '{}'", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn download_dir(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(p) => Ok(p.to_path_buf()),
        None => std::env::current_dir().context("Failed to determine current directory"),
    }
}

fn load_config(cli: &Cli) -> Result<(PathBuf, Config)> {
    let path = Config::locate(cli.config.as_deref())?;
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load config '{}'", path.display()))?;
    if config.feeds.is_empty() {
        tracing::warn!(path = %path.display(), "No feeds configured");
    }
    Ok((path, config))
}

fn open_cache(cli: &Cli, config: &Config) -> Result<CacheFile> {
    let path = cli.seen_file.clone().unwrap_or_else(|| config.seen_path());
    CacheFile::open(&path)
        .with_context(|| format!("Refusing to start with unreadable cache '{}'", path.display()))
}

async fn once(cli: &Cli, args: &OnceArgs) -> Result<()> {
    let (_, config) = load_config(cli)?;
    let mut cache = open_cache(cli, &config)?;
    let source = HttpFeedSource::new().context("Failed to build HTTP client")?;
    let client = TransmissionClient::new(&config.transmission)
        .context("Failed to build Transmission client")?;
    let prompter = TerminalPrompter;

    let dir = download_dir(args.download_path.as_deref())?;
    let mode = if args.no_action {
        RunMode::NoAction
    } else if args.skip {
        RunMode::Skip
    } else if args.download {
        RunMode::Download { dir }
    } else if args.interactive {
        RunMode::Interactive { dir }
    } else {
        RunMode::Torrent
    };
    let options = CycleOptions {
        mode,
        feeds: args.feeds.clone(),
    };

    let mut ctx = CycleContext {
        config: &config,
        cache: &mut cache,
        source: &source,
        client: &client,
        prompter: Some(&prompter),
    };
    run_cycle(&mut ctx, &options, Utc::now())
        .await
        .context("Unable to save seen cache")?;
    Ok(())
}

async fn watch(cli: &Cli, args: &WatchArgs) -> Result<()> {
    let (path, config) = load_config(cli)?;
    let mut cache = open_cache(cli, &config)?;
    let source = HttpFeedSource::new().context("Failed to build HTTP client")?;
    let client = Arc::new(
        TransmissionClient::new(&config.transmission)
            .context("Failed to build Transmission client")?,
    );

    let rotation: Option<RotationController<GluetunClient, Arc<TransmissionClient>>> =
        if config.gluetun.is_enabled() {
            let sidecar =
                GluetunClient::new(&config.gluetun).context("Failed to build Gluetun client")?;
            Some(RotationController::new(sidecar, Arc::clone(&client), Utc::now()))
        } else {
            tracing::debug!("Gluetun not configured, tunnel rotation disabled");
            None
        };

    let dir = download_dir(args.download_path.as_deref())?;
    let options = WatchOptions {
        cycle: CycleOptions {
            mode: if args.download {
                RunMode::Download { dir }
            } else {
                RunMode::Torrent
            },
            feeds: args.feeds.clone(),
        },
        sleep: Duration::from_secs(args.sleep.max(1)),
    };

    let handle = ConfigHandle::new(path, config);
    let listener = spawn_reload_listener(handle.clone(), RELOAD_POLL_INTERVAL);

    {
        let mut watcher = Watcher {
            handle,
            cache: &mut cache,
            source: &source,
            client: client.as_ref(),
            rotation,
        };
        watcher.run(&options).await.context("Watch loop failed")?;
    }

    listener.abort();
    if let Err(e) = cache.flush() {
        tracing::error!(error = %e, "Unable to save seen cache on shutdown");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    match &cli.command {
        Command::Once(args) => once(&cli, args).await,
        Command::Watch(args) => watch(&cli, args).await,
        Command::Version => {
            println!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
