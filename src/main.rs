use std::{
    error::Error,
    path::{Path, PathBuf},
    process,
    time::Duration,
};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};

use nowplaying::{
    capture::{Capture, Replay},
    config::Config,
    monitor::{Callbacks, Monitor},
    signal::Signals,
    state::PlaybackState,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// How long to wait before reopening the pipe after the reader thread exited.
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// TOML file with monitor settings. Keys that are absent keep their
    /// default value.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Metadata pipe
    ///
    /// Named pipe that shairport-sync writes its metadata to.
    ///
    /// [default: /tmp/shairport-sync-metadata]
    #[arg(short, long, value_name = "PATH", value_hint = ValueHint::FilePath, env = "NOWPLAYING_PIPE")]
    pipe: Option<PathBuf>,

    /// Cover art directory
    ///
    /// [default: system temporary directory]
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    cover_art_dir: Option<PathBuf>,

    /// Capture the metadata stream
    ///
    /// Write every line read from the pipe to a JSON-lines file for later
    /// replay. Files ending in `.gz` are compressed.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, conflicts_with = "replay")]
    capture: Option<PathBuf>,

    /// Replay a capture instead of reading the pipe
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    replay: Option<PathBuf>,

    /// Print a summary of the replay file and exit
    #[arg(long, default_value_t = false, requires = "replay")]
    info: bool,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if args.quiet || args.verbose > 0 {
        let level = match args.verbose {
            // Quiet and verbose are mutually exclusive, so this is quiet mode.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Applies the configuration file and command line overrides.
fn load_config(args: &Args) -> nowplaying::error::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(pipe) = &args.pipe {
        config.pipe_path.clone_from(pipe);
    }
    if let Some(dir) = &args.cover_art_dir {
        config.cover_art_dir.clone_from(dir);
    }

    debug!("configuration: {config:#?}");
    Ok(config)
}

/// Feeds a capture through a monitor, the same way the reader thread would.
fn replay(config: Config, path: &Path, info_only: bool) -> Result<(), Box<dyn Error>> {
    let replay = Replay::open(path)?;

    if info_only {
        println!("{}", serde_json::to_string_pretty(&replay.info()?)?);
        return Ok(());
    }

    let monitor = Monitor::new(config, Callbacks::logging());
    monitor.set_state(PlaybackState::Undetermined);

    let mut first = true;
    replay.replay(
        |line| {
            if first {
                first = false;
                monitor.set_state(PlaybackState::Playing);
            }
            monitor.process_line(line);
        },
        |kind, description, timestamp| debug!("captured {kind} at {timestamp:.2}s: {description}"),
    )?;

    Ok(())
}

/// Main application loop.
///
/// Runs the monitor until a shutdown signal arrives. When the reader thread
/// exits because the writer closed the pipe, the pipe is reopened.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;

    if let Some(path) = &args.replay {
        return replay(config, path, args.info);
    }

    let mut monitor = Monitor::new(config, Callbacks::logging());
    if let Some(path) = &args.capture {
        monitor.set_capture(Some(Box::new(Capture::create(path)?)));
    }

    let mut signals = Signals::new()?;
    monitor.start()?;

    let restart_timer = tokio::time::sleep(RESTART_DELAY);
    tokio::pin!(restart_timer);

    loop {
        tokio::select! {
            // Prioritize signals.
            biased;

            signal = signals.recv() => {
                info!("received {signal}");
                tokio::task::block_in_place(|| monitor.stop());

                if signal.is_shutdown() {
                    info!("shutting down gracefully");
                    break Ok(());
                }

                if let Err(e) = monitor.start() {
                    error!("{e}");
                }
            }

            () = &mut restart_timer => {
                if !monitor.is_running() {
                    info!("reopening {}", monitor.config().pipe_path.display());
                    if let Err(e) = monitor.start() {
                        error!("{e}");
                    }
                }
                restart_timer.as_mut().reset(tokio::time::Instant::now() + RESTART_DELAY);
            }
        }
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
