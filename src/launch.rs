use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use argh::FromArgs;
use exitcode::ExitCode;
use pvesd::cache::{CacheWriter, Snapshot};
use pvesd::config::{Config, env};
use pvesd::discovery::Discovery;
use pvesd::proxmox::Client;
use pvesd::responder::{FileSnapshot, Responder};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2)
}

/// Which half of the service this process runs. The two halves only share
/// the cache file, so they can live in separate containers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Role {
    All,
    Discovery,
    Responder,
}

impl Role {
    fn discovery(self) -> bool {
        matches!(self, Role::All | Role::Discovery)
    }

    fn responder(self) -> bool {
        matches!(self, Role::All | Role::Responder)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Role::All),
            "discovery" => Ok(Role::Discovery),
            "responder" => Ok(Role::Responder),
            _ => Err(format!(
                "unknown role {s:?}, expect one of all, discovery or responder"
            )),
        }
    }
}

#[derive(FromArgs)]
#[argh(
    description = "Discover Proxmox VMs and serve them as Prometheus HTTP SD targets",
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

    #[argh(
        option,
        short = 'c',
        long = "config",
        description = "read configuration from file, everything has a default"
    )]
    config: Option<PathBuf>,

    #[argh(
        option,
        short = 'r',
        default = "Role::All",
        description = "run all, discovery or responder"
    )]
    role: Role,

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

impl RootCommand {
    #![allow(clippy::print_stdout)]
    fn show_version(&self) {
        println!("pvesd {}", pvesd::get_version());
    }

    fn load_config(&self) -> Result<Config, ExitCode> {
        Config::load(self.config.as_deref(), &env::vars()).map_err(handle_config_errors)
    }

    fn build_runtime(&self) -> Result<Runtime, ExitCode> {
        tokio::runtime::Builder::new_multi_thread()
            .thread_name("pvesd-worker")
            .worker_threads(self.threads.max(1))
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| {
                error!(message = "build tokio runtime failed", %err);
                exitcode::OSERR
            })
    }

    pub fn run(&self) -> Result<(), ExitCode> {
        if self.version {
            self.show_version();
            return Ok(());
        }

        let log_level = std::env::var("PVESD_LOG").unwrap_or(self.log_level.clone());
        let color = std::io::stdout().is_terminal();
        if let Err(err) = pvesd::trace::init(color, &log_level) {
            eprintln!("invalid log level {log_level:?}, {err}");
            return Err(exitcode::USAGE);
        }

        let config = self.load_config()?;

        match &self.sub_commands {
            Some(SubCommands::Validate(_)) => validate(&config),
            Some(SubCommands::Discover(_)) => {
                let runtime = self.build_runtime()?;
                runtime.block_on(discover(config))
            }
            None => {
                let runtime = self.build_runtime()?;
                runtime.block_on(self.serve(config))?;
                runtime.shutdown_timeout(Duration::from_secs(5));

                Ok(())
            }
        }
    }

    async fn serve(&self, config: Config) -> Result<(), ExitCode> {
        info!(
            message = "start pvesd",
            version = pvesd::get_version(),
            role = ?self.role,
            threads = self.threads,
            config = ?self.config,
        );

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::with_capacity(2);

        if self.role.responder() {
            let responder = Responder::bind(&config.responder).await.map_err(|err| {
                error!(
                    message = "bind responder failed",
                    listen = %config.responder.listen,
                    %err
                );

                exitcode::SOFTWARE
            })?;

            let provider = FileSnapshot::new(config.cache.path.clone());
            tasks.push(tokio::spawn(responder.serve(provider, shutdown.clone())));
        }

        if self.role.discovery() {
            let client = Client::new(&config.proxmox).map_err(|err| {
                error!(message = "build proxmox client failed", %err);
                exitcode::CONFIG
            })?;

            let discovery = Discovery::new(
                client,
                config.discovery.subnet,
                CacheWriter::new(config.cache.path.clone()),
            );
            tasks.push(tokio::spawn(
                discovery.run(config.discovery.interval, shutdown.clone()),
            ));
        }

        pvesd::signal::cancel_on_signal(shutdown).await;

        for result in futures::future::join_all(tasks).await {
            if let Err(err) = result {
                error!(message = "task panicked", %err);
                return Err(exitcode::SOFTWARE);
            }
        }

        info!(message = "pvesd stopped");

        Ok(())
    }
}

#[allow(clippy::print_stdout)]
fn validate(config: &Config) -> Result<(), ExitCode> {
    println!("√ Loaded configuration");
    println!("  endpoint:  {}", config.proxmox.endpoint);
    println!("  username:  {}", config.proxmox.username);
    println!("  subnet:    {}", config.discovery.subnet);
    println!("  cache:     {}", config.cache.path.display());
    println!("  listen:    {}", config.responder.listen);

    if let Err(err) = Client::new(&config.proxmox) {
        println!("x Invalid TLS settings, {err}");
        return Err(exitcode::CONFIG);
    }

    println!("√ Validated");
    Ok(())
}

/// Run a single discovery cycle and print the snapshot, the cache file is
/// left alone.
async fn discover(config: Config) -> Result<(), ExitCode> {
    let client = Client::new(&config.proxmox).map_err(|err| {
        error!(message = "build proxmox client failed", %err);
        exitcode::CONFIG
    })?;

    let discovery = Discovery::new(
        client,
        config.discovery.subnet,
        CacheWriter::new(config.cache.path),
    );
    let snapshot = discovery.run_once().await;

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(&snapshot.to_json())
        .and_then(|_| stdout.write_all(b"\n"))
        .map_err(|_| exitcode::IOERR)?;

    match snapshot {
        Snapshot::Targets(_) => Ok(()),
        Snapshot::Error { .. } => Err(exitcode::UNAVAILABLE),
    }
}

pub fn handle_config_errors(errors: Vec<String>) -> ExitCode {
    for err in errors {
        error!(message = "configuration error", %err);
    }

    exitcode::CONFIG
}

#[derive(Debug, FromArgs)]
#[argh(
    subcommand,
    name = "validate",
    description = "Validate configuration, then exit",
    help_triggers("-h", "--help")
)]
struct Validate {}

#[derive(Debug, FromArgs)]
#[argh(
    subcommand,
    name = "discover",
    description = "Run one discovery cycle and print the targets to stdout",
    help_triggers("-h", "--help")
)]
struct Discover {}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum SubCommands {
    Validate(Validate),
    Discover(Discover),
}
