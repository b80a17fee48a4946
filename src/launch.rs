use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use exitcode::ExitCode;
use scrape_sidecar::config::Config;
use scrape_sidecar::materialize::Materializer;
use scrape_sidecar::process::PidFile;
use scrape_sidecar::registry::Registry;
use scrape_sidecar::scheduler::Scheduler;
use scrape_sidecar::signal::{self, SignalTo};
use scrape_sidecar::{bus, trace};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(FromArgs)]
#[argh(
    description = "Render scrape targets announced on the bus into the agent's input config",
    help_triggers("-h", "--help")
)]
pub struct RootCommand {
    #[argh(switch, short = 'v', description = "show version")]
    version: bool,

    #[argh(
        option,
        short = 'l',
        default = "\"info\".to_string()",
        description = "log level"
    )]
    log_level: String,

    #[argh(switch, description = "log in json format")]
    log_json: bool,

    #[argh(
        option,
        short = 'c',
        long = "config",
        description = "read configuration from a YAML file, defaults apply without it"
    )]
    config: Option<PathBuf>,

    #[argh(
        option,
        short = 't',
        default = "default_worker_threads()",
        description = "specify how many threads the Tokio runtime will use"
    )]
    threads: usize,

    #[argh(subcommand)]
    sub_commands: Option<SubCommands>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum SubCommands {
    Validate(Validate),
}

#[derive(FromArgs)]
#[argh(
    subcommand,
    name = "validate",
    description = "Validate the configuration and exit",
    help_triggers("-h", "--help")
)]
struct Validate {}

impl RootCommand {
    #![allow(clippy::print_stdout)]
    fn show_version(&self) {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    }

    fn load_config(&self) -> Result<Config, ExitCode> {
        Config::load(self.config.as_deref()).map_err(|err| {
            error!(message = "Configuration error", %err);
            exitcode::CONFIG
        })
    }

    pub fn run(&self) -> Result<(), ExitCode> {
        if self.version {
            self.show_version();
            return Ok(());
        }

        let log_level = std::env::var(trace::LOG_ENV).unwrap_or(self.log_level.clone());
        let color = std::io::stdout().is_terminal();
        trace::init(color, self.log_json, &log_level);

        let config = self.load_config()?;

        if let Some(SubCommands::Validate(_)) = &self.sub_commands {
            println!("Configuration is valid");
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("scrape-sidecar-worker")
            .worker_threads(self.threads.max(1))
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| {
                error!(message = "Build runtime failed", %err);
                exitcode::OSERR
            })?;

        runtime.block_on(serve(config))?;
        runtime.shutdown_timeout(Duration::from_secs(5));

        Ok(())
    }
}

async fn serve(config: Config) -> Result<(), ExitCode> {
    info!(
        message = "Start scrape sidecar",
        version = env!("CARGO_PKG_VERSION"),
        output = ?config.output_path(),
        pid_file = ?config.pid_file,
        local_address = ?config.local_address,
    );

    // The directory must be fresh, a leftover one means another instance
    // owns it or the environment is not what we expect.
    std::fs::create_dir(&config.config_dir).map_err(|err| {
        error!(message = "Unable to create config dir", dir = ?config.config_dir, %err);
        exitcode::CANTCREAT
    })?;

    let mut signals = signal::os_signals().map_err(|err| {
        error!(message = "Unable to listen OS signals", %err);
        exitcode::OSERR
    })?;

    let registry = Arc::new(Registry::new());

    let client = bus::connect(&config.bus).await.map_err(|err| {
        error!(message = "Unable to connect to bus", %err);
        exitcode::UNAVAILABLE
    })?;
    let subscriber = bus::subscribe(&client, &config.bus.topic)
        .await
        .map_err(|err| {
            error!(message = "Unable to subscribe scrape targets", %err);
            exitcode::UNAVAILABLE
        })?;

    info!(message = "Subscribed", topic = %config.bus.topic);
    tokio::spawn(bus::run(subscriber, Arc::clone(&registry)));

    let materializer = Materializer::new(
        config.output_path(),
        config.tls.clone(),
        config.local_address.clone(),
        PidFile::new(&config.pid_file),
    );
    let scheduler = Scheduler::new(
        registry,
        materializer,
        config.render_interval,
        config.evict_interval,
        config.ttl,
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut scheduler = tokio::spawn(scheduler.run(async move {
        let _ = shutdown_rx.await;
    }));

    let signal = tokio::select! {
        signal = signals.recv() => signal,
        result = &mut scheduler => {
            // the scheduler only returns after shutdown, so this is a panic
            error!(message = "Scheduler exited unexpectedly", ?result);
            return Err(exitcode::SOFTWARE);
        }
    };

    let _ = shutdown_tx.send(());
    let _ = scheduler.await;

    match signal {
        SignalTo::Shutdown => {
            info!(message = "Shutdown signal received, draining bus connection");

            if let Err(err) = client.drain().await {
                warn!(message = "Drain bus connection failed", %err);
            }
        }
        SignalTo::Quit => {
            info!(message = "Quit signal received");
        }
    }

    Ok(())
}
