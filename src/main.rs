mod config;
mod coordinator;
mod handler_chain;
#[cfg(unix)]
mod listener;
mod logging;
mod process_scan;
mod signals;

use clap::Parser;
use config::LauncherConfig;
use coordinator::InstanceCoordinator;
use process_scan::{find_running_instance, SysinfoTable};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;

/// Launcher for the efck chat keyboard. If a copy is already running, it is asked
/// to show its window and this launch exits; otherwise this process becomes the
/// running copy and waits for wake requests.
#[derive(Parser, Debug)]
#[command(name = "efck-launcher", version, about)]
pub struct Cli {
    /// Print debug messages to stderr
    #[arg(long)]
    debug: bool,

    /// Config file path
    #[arg(short, long, default_value = "efck.toml")]
    config: PathBuf,

    /// Application name to look for (overrides config)
    #[arg(long)]
    name: Option<String>,

    /// Print the running instance as JSON and exit without signalling it
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match LauncherConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(name) = &cli.name {
        config.instance.app_name = name.clone();
        if let Err(e) = config.validate() {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    }

    let app_name = config.instance.app_name.clone();
    let log_path = logging::init(&app_name, &config.logging, cli.debug);
    tracing::info!("{} v{}", app_name, env!("CARGO_PKG_VERSION"));
    if cli.debug {
        if let Some(path) = &log_path {
            tracing::info!("Logging into {:?}", path);
        }
    }
    tracing::debug!(?cli, "parsed CLI arguments");
    if !cli.config.exists() {
        tracing::debug!(path = %cli.config.display(), "no config file, using defaults");
    }

    if cli.check {
        return check(&app_name);
    }

    // Everything before the runtime is built runs on this one thread.
    let (wake_tx, wake_rx) = mpsc::unbounded_channel();
    let mut coordinator = InstanceCoordinator::new(app_name);
    let on_wake = move || {
        let _ = wake_tx.send(());
    };
    if let Err(e) = coordinator.ensure_single_instance(on_wake) {
        tracing::error!(error = %e, "single-instance check failed");
        return ExitCode::FAILURE;
    }

    #[cfg(unix)]
    {
        if let Some(listener) = coordinator.listener() {
            tracing::debug!(
                app_name = coordinator.app_name(),
                signal = %listener.signal(),
                running = listener.is_running(),
                state = ?coordinator.state(),
                "active instance"
            );
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run_active(wake_rx));

    ExitCode::SUCCESS
}

/// Stand-in for the GUI event loop: every wake request re-surfaces the window.
async fn run_active(mut wakes: mpsc::UnboundedReceiver<()>) {
    let mut shown: u64 = 0;
    loop {
        tokio::select! {
            event = wakes.recv() => match event {
                Some(()) => {
                    shown += 1;
                    tracing::info!(shown, "showing window");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
        }
    }
}

/// `--check`: exit 0 and print the record when an instance is running, 1 when not.
fn check(app_name: &str) -> ExitCode {
    let mut table = SysinfoTable::new();
    let found = match find_running_instance(&mut table, app_name, std::process::id()) {
        Ok(found) => found,
        Err(e) => {
            tracing::error!(error = %e, "instance scan failed");
            return ExitCode::from(2);
        }
    };

    match serde_json::to_string_pretty(&found) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize process record");
            return ExitCode::from(2);
        }
    }

    if found.is_some() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["efck-launcher"]).unwrap();
        assert!(!cli.debug);
        assert!(!cli.check);
        assert_eq!(cli.config, PathBuf::from("efck.toml"));
        assert_eq!(cli.name, None);
    }

    #[test]
    fn test_cli_all_flags() {
        let cli = Cli::try_parse_from([
            "efck-launcher",
            "--debug",
            "-c",
            "/etc/efck.toml",
            "--name",
            "efck-beta",
            "--check",
        ])
        .unwrap();
        assert!(cli.debug);
        assert!(cli.check);
        assert_eq!(cli.config, PathBuf::from("/etc/efck.toml"));
        assert_eq!(cli.name.as_deref(), Some("efck-beta"));
    }

    #[test]
    fn test_cli_rejects_unknown_flag() {
        assert!(Cli::try_parse_from(["efck-launcher", "--bogus"]).is_err());
    }

    #[tokio::test]
    async fn test_run_active_counts_wakes_until_channel_closes() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(()).unwrap();
        tx.send(()).unwrap();
        drop(tx);
        // Returns once the sender side is gone.
        run_active(rx).await;
    }
}
