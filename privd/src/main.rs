use clap::Parser;
use nix::unistd::Pid;
use privd::{config::CONFIG_PATH, supervisor, Config, Error, Secret};
use privd_log::{crit, info, warn};
use std::{path::PathBuf, process};

/// Exit status when started without root privileges.
const EX_NOPERM: i32 = 77;

/// Privileged helper daemon of the management daemon.
#[derive(Debug, Parser)]
#[command(name = "privd", version)]
struct Args {
    /// Secret shared with the launcher.
    secret: String,
    /// PID of the launcher, the daemon exits when it is gone.
    launcher: i32,
    /// Path of the configuration file.
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,
    /// Log to stderr instead of syslog.
    #[arg(long)]
    foreground: bool,
}

fn main() {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {}", err);
            process::exit(1);
        }
    };

    let status = runtime.block_on(daemon(args));
    drop(runtime);
    process::exit(status);
}

async fn daemon(args: Args) -> i32 {
    let Args {
        secret,
        launcher,
        config: config_path,
        foreground,
    } = args;

    let (config, _guard) = match Config::load(&config_path) {
        Ok(mut config) => {
            config.log.foreground |= foreground;
            match privd_log::async_logger("privd", config.log.clone()).await {
                Ok(guard) => (config, guard),
                Err(err) => {
                    let guard = privd_log::fallback_logger("privd");
                    warn!("Failed to configure logging: {}", err);
                    (config, guard)
                }
            }
        }
        Err(err) => {
            let guard = privd_log::fallback_logger("privd");
            warn!(
                "Failed to load {}, using defaults: {}",
                config_path.display(),
                err
            );
            (Config::default(), guard)
        }
    };

    let secret = match Secret::new(secret) {
        Ok(secret) => secret,
        Err(err) => {
            crit!("{}", err);
            return 1;
        }
    };

    info!("Starting privd, launcher {}", launcher);

    match supervisor::run(config, secret, Pid::from_raw(launcher)).await {
        Ok(()) => {
            info!("Terminated");
            0
        }
        Err(Error::PermissionDenied) => {
            crit!("{}", Error::PermissionDenied);
            EX_NOPERM
        }
        Err(err) => {
            crit!("Fatal error: {}", err);
            1
        }
    }
}
