use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use wava::client::{Client, Session};
use wava::config::{parse_memory, PromisePolicy, SchedulerConfig, WavaHome, HOME_ENV};
use wava::daemon::Daemon;
use wava::error::WavaError;
use wava::protocol::{EventRecord, GroupRequest, JobRequest, RetCode};
use wava::shutdown::install_shutdown_handler;
use wava::worker::JOB_ID_ENV;

#[derive(Parser, Debug)]
#[command(name = "wava")]
#[command(version)]
#[command(about = "A memory-aware batch job scheduler")]
#[command(propagate_version = true)]
struct Args {
    /// Scheduler home directory
    #[arg(long, global = true, env = HOME_ENV)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler daemon
    Serve(ServeArgs),

    /// Submit a job and wait for it to finish
    Submit(SubmitArgs),

    /// Cancel a queued or running job
    Cancel {
        /// The job ID
        id: u64,
    },

    /// List queued and running jobs
    Jobs {
        /// Omit the header line
        #[arg(long)]
        no_headers: bool,
    },

    /// Group management commands
    Group {
        #[command(subcommand)]
        command: GroupCommands,
    },

    /// Stop the daemon
    Exit,
}

// =============================================================================
// Daemon Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Configuration file (default: $WAVA_HOME/etc/wava.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Memory handed out to jobs, e.g. "16G" (default: total system memory)
    #[arg(long, value_parser = memory_arg)]
    managed_memory: Option<u64>,

    /// What happens when a job outgrows its promise
    #[arg(long)]
    promise_policy: Option<PolicyArg>,

    /// Largest promise a single job may make, e.g. "4G"
    #[arg(long, value_parser = memory_arg)]
    max_job_rss: Option<u64>,

    /// Milliseconds between scheduling cycles
    #[arg(long)]
    refresh_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Strict,
    Lax,
}

impl From<PolicyArg> for PromisePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Strict => PromisePolicy::Strict,
            PolicyArg::Lax => PromisePolicy::Lax,
        }
    }
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Promised peak RSS of the job's process tree, e.g. "512M"
    #[arg(long, short = 'm', value_parser = memory_arg)]
    max_rss: u64,

    /// Group to file the job under
    #[arg(long, short = 'g')]
    group: Option<String>,

    /// Parent job (set automatically inside a running job)
    #[arg(long, env = JOB_ID_ENV)]
    parent: Option<u64>,

    /// The job may be killed and relaunched to resolve a starvation deadlock
    #[arg(long)]
    idempotent: bool,

    /// Print scheduler events to stderr
    #[arg(long, short = 'v')]
    verbose: bool,

    /// The command to execute
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(clap::Subcommand, Debug)]
enum GroupCommands {
    /// Create a group or update its settings
    Set {
        name: String,

        /// Scheduling priority; lower runs first, negative values need root
        #[arg(long, allow_hyphen_values = true)]
        priority: Option<i32>,

        /// Seconds the group survives once empty; -1 keeps it forever
        #[arg(long, allow_hyphen_values = true)]
        time_to_idle: Option<i64>,
    },
    /// Delete an empty group
    Delete { name: String },
    /// List groups
    List {
        #[arg(long)]
        no_headers: bool,
    },
}

// =============================================================================
// Helper Functions
// =============================================================================

fn memory_arg(value: &str) -> Result<u64, String> {
    parse_memory(value).ok_or_else(|| format!("invalid memory size: {value}"))
}

fn resolve_home(home: Option<PathBuf>) -> Result<WavaHome, WavaError> {
    match home {
        Some(root) => Ok(WavaHome::new(root)),
        None => WavaHome::from_env(),
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn describe(event: &EventRecord) -> String {
    match &event.value {
        Some(value) => format!("wava: {} {}", event.name, value),
        None => format!("wava: {}", event.name),
    }
}

async fn finish(session: Session, verbose: bool) -> Result<i32, WavaError> {
    let id = session.id();
    let retcode = session
        .drive(tokio::io::stdout(), tokio::io::stderr(), |event| {
            if verbose {
                eprintln!("{}", describe(event));
            }
        })
        .await?;
    match retcode {
        Some(code) => Ok(code),
        None => {
            eprintln!("wava: request {id} ended without a return code");
            Ok(RetCode::Error.code())
        }
    }
}

// =============================================================================
// Daemon Implementation
// =============================================================================

async fn run_serve(home: WavaHome, args: ServeArgs) -> Result<(), WavaError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = args.config.unwrap_or_else(|| home.config_file());
    let mut config = SchedulerConfig::load(&config_path)?;
    if let Some(bytes) = args.managed_memory {
        config = config.with_managed_memory(bytes);
    }
    if let Some(policy) = args.promise_policy {
        config = config.with_promise_policy(policy.into());
    }
    if let Some(bytes) = args.max_job_rss {
        config = config.with_max_job_rss(bytes);
    }
    if let Some(interval) = args.refresh_interval_ms {
        config.refresh_interval_ms = interval;
    }

    tracing::info!(
        home = %home.root().display(),
        config = %config_path.display(),
        managed_memory = ?config.managed_memory,
        promise_policy = ?config.promise_policy,
        "Starting wava daemon"
    );

    let shutdown = install_shutdown_handler(CancellationToken::new())?;
    Daemon::new(home, config).run(shutdown).await
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn run_client(home: WavaHome, command: Commands) -> Result<i32, WavaError> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let client = Client::new(home);
    match command {
        Commands::Submit(args) => {
            let working_directory = std::env::current_dir()?;
            let mut request = JobRequest::new(args.command, args.max_rss, working_directory);
            request.environment = std::env::vars_os()
                .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
                .collect();
            if let Some(group) = args.group {
                request = request.with_group(group);
            }
            if let Some(parent) = args.parent {
                request = request.with_parent(parent);
            }
            if args.idempotent {
                request = request.idempotent();
            }
            finish(client.submit(request).await?, args.verbose).await
        }
        Commands::Cancel { id } => finish(client.cancel(id).await?, false).await,
        Commands::Jobs { no_headers } => finish(client.jobs(no_headers).await?, false).await,
        Commands::Group { command } => {
            let request = match command {
                GroupCommands::Set {
                    name,
                    priority,
                    time_to_idle,
                } => GroupRequest {
                    name: Some(name),
                    priority,
                    time_to_idle,
                    ..GroupRequest::default()
                },
                GroupCommands::Delete { name } => GroupRequest {
                    name: Some(name),
                    delete: true,
                    ..GroupRequest::default()
                },
                GroupCommands::List { no_headers } => GroupRequest {
                    list: true,
                    no_headers,
                    ..GroupRequest::default()
                },
            };
            finish(client.group(request).await?, false).await
        }
        Commands::Exit => finish(client.exit().await?, false).await,
        Commands::Serve(_) => Ok(RetCode::Error.code()),
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let home = match resolve_home(args.home) {
        Ok(home) => home,
        Err(e) => {
            eprintln!("Error: {e}");
            return exit_code(e.ret_code().code());
        }
    };

    match args.command {
        Commands::Serve(serve_args) => match run_serve(home, serve_args).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e}");
                exit_code(e.ret_code().code())
            }
        },
        command => match run_client(home, command).await {
            Ok(code) => exit_code(code),
            Err(WavaError::Closed) => {
                eprintln!("Error: the wava daemon is not running");
                exit_code(RetCode::CoreNotRunning.code())
            }
            Err(e) => {
                eprintln!("Error: {e}");
                exit_code(e.ret_code().code())
            }
        },
    }
}
