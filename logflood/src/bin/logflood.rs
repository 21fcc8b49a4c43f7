use std::{env, fs, io, io::Read, io::Write, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use logflood::{Config, Report, Runner, config, runner};
use tokio::{runtime::Builder, signal, time::Duration};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Invalid logflood config: {0}")]
    Config(#[from] config::Error),
    #[error("Run failed: {0}")]
    Runner(#[from] runner::Error),
    #[error("Could not join the run task: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Failed to serialize report: {0}")]
    Report(#[from] serde_json::Error),
}

fn default_config_path() -> String {
    "/etc/logflood/logflood.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run logflood with specified configuration
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// path on disk to write the run report to, stdout if absent
    #[clap(long)]
    report_path: Option<PathBuf>,
    /// the maximum time to wait, in seconds, for the runtime to shut down
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config_contents(config_path: &str) -> Result<String, Error> {
    if let Ok(env_var_value) = env::var("LOGFLOOD_CONFIG") {
        debug!("Using config from env var 'LOGFLOOD_CONFIG'");
        Ok(env_var_value)
    } else {
        debug!("Attempting to open configuration file at: {}", config_path);
        let mut file = fs::OpenOptions::new()
            .read(true)
            .open(config_path)
            .map_err(|err| {
                error!("Could not read config file '{}': {}", config_path, err);
                err
            })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

fn get_config(config_path: &str) -> Result<Config, Error> {
    let contents = load_config_contents(config_path)?;
    Config::parse(&contents).map_err(|err| {
        error!("Configuration validation failed: {}", err);
        Error::Config(err)
    })
}

fn write_report(report: &Report, report_path: Option<&PathBuf>) -> Result<(), Error> {
    if let Some(path) = report_path {
        let mut file = fs::File::create(path)?;
        serde_json::to_writer_pretty(&mut file, report)?;
        file.write_all(b"\n")?;
        info!("Report written to {}", path.display());
    } else {
        let mut stdout = io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, report)?;
        stdout.write_all(b"\n")?;
    }
    Ok(())
}

async fn inner_main(config: Config) -> Result<Report, Error> {
    let (shutdown_watcher, shutdown_broadcast) = logflood_signal::signal();
    let runner = Runner::new(&config, shutdown_watcher)?;
    let mut run = tokio::spawn(runner.run());

    let report = tokio::select! {
        res = &mut run => res??,
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, stopping run");
            shutdown_broadcast.signal();
            run.await??
        }
    };
    Ok(report)
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting logflood {version} run.");

    let run_cmd = match Cli::parse().command {
        Commands::Run(run_cmd) => run_cmd,
        Commands::ConfigCheck(config_check_cmd) => {
            match get_config(&config_check_cmd.config_path) {
                Ok(_) => {
                    info!("Configuration file is valid");
                    std::process::exit(0)
                }
                Err(_) => std::process::exit(1),
            }
        }
    };

    let config = get_config(&run_cmd.config_path)?;
    let max_shutdown_delay = Duration::from_secs(run_cmd.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);

    let report = res?;
    write_report(&report, run_cmd.report_path.as_ref())?;
    info!("Bye. :)");
    Ok(())
}
