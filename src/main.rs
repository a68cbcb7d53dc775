use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use jsgamepad::config::Config;
use jsgamepad::controller::{AdapterError, ControllerHandle, JoystickDevice, SourceError};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Print gamepad state changes read from a joystick device
#[derive(Parser, Debug)]
#[command(name = "jsgamepad", version, about)]
struct Args {
    /// Configuration file (defaults to <config dir>/jsgamepad/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Joystick device, overrides the configured one
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short = 't', long)]
    duration: Option<u64>,

    /// Log level, overrides the configured one
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).await?;
    if let Some(device) = args.device {
        config.device.path = device;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    setup(config.logging.max_level()?)?;
    run(config, args.duration).await
}

fn setup(level: Level) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(level);
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn run(config: Config, duration: Option<u64>) -> Result<()> {
    let path = &config.device.path;
    info!("Opening joystick device {}", path.display());
    let device = JoystickDevice::open(path)
        .wrap_err_with(|| format!("Failed to open {}", path.display()))?;

    let cancel = CancellationToken::new();
    spawn_shutdown_triggers(cancel.clone(), duration);

    let (handle, mut errors) =
        ControllerHandle::spawn(device, Some(config.controller.clone()), cancel.clone());
    let mut changed = handle.subscribe();
    let mut fatal = None;

    // Both the notifications and the errors must be drained
    loop {
        tokio::select! {
            res = changed.changed() => {
                if res.is_err() {
                    debug!("State cache closed");
                    break;
                }
                if let Some(event) = handle.cache().last_event().await {
                    println!("{event}");
                }
            }
            Some(err) = errors.recv() => match err {
                AdapterError::Source(SourceError::ReadDeadlineExceeded(_)) => trace!("{}", err),
                AdapterError::UnknownEventKind(_) => debug!("{}", err),
                AdapterError::Source(SourceError::Decode(_)) => warn!("{}", err),
                AdapterError::Source(SourceError::ReadFailure(_)) => {
                    error!("{}", err);
                    fatal = Some(err);
                }
            },
        }
    }

    // Keep draining until the adapter drops its error sender
    while let Some(err) = errors.recv().await {
        trace!("Discarding error during shutdown: {}", err);
    }
    handle.join().await?;

    match fatal {
        Some(err) => Err(err).wrap_err("Device failed"),
        None => Ok(()),
    }
}

fn spawn_shutdown_triggers(cancel: CancellationToken, duration: Option<u64>) {
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupt: {}", e);
            return;
        }
        info!("Interrupt received, shutting down");
        on_signal.cancel();
    });

    if let Some(secs) = duration {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("Run duration of {}s elapsed, shutting down", secs);
                    cancel.cancel();
                }
            }
        });
    }
}
