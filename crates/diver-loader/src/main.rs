//! Diver Loader
//!
//! Injects the diver agent assembly into a running managed process and waits for it to answer.
//!
//! Attachment modes:
//! - by PID
//! - by process name
//! - wait for a process with that name to start, then attach

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use diver_common::{init_host_logging, init_logging, DiverConfig};
use diver_core::{
    find_process_by_name, inject, open_process, wait_for_agent, AgentArgument, InjectionReport,
    InjectionRequest,
};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "diver-loader")]
#[command(about = "Diver loader - inject the diver agent into a managed process")]
#[command(version)]
struct Args {
    /// Path to the agent assembly (default: Diver.dll next to the loader)
    #[arg(short, long, global = true)]
    agent: Option<PathBuf>,

    /// Full name of the agent entry type
    #[arg(long = "type", global = true, default_value = "Diver.Entry")]
    entry_type: String,

    /// Static `int Method(string)` entry method
    #[arg(long, global = true, default_value = "Main")]
    method: String,

    /// Argument fields handed to the entry method, joined with '*'
    #[arg(long = "argument", global = true)]
    arguments: Vec<String>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Hosted runtime version, overriding the configuration
    #[arg(long, global = true)]
    runtime_version: Option<String>,

    /// Local TCP port the agent listens on; enables the liveness wait
    #[arg(long, global = true)]
    probe_port: Option<u16>,

    /// Maximum retries on injection failure
    #[arg(long, global = true, default_value = "0")]
    retries: u32,

    /// Delay between retries in milliseconds
    #[arg(long, global = true, default_value = "1000")]
    retry_delay: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach to a running process by PID
    Pid {
        /// Process ID to attach to
        pid: u32,
    },

    /// Attach to a running process by name
    Name {
        /// Process name (e.g., "app.exe")
        name: String,
    },

    /// Wait for a process to start, then attach
    Wait {
        /// Process name to wait for
        name: String,

        /// Timeout in seconds (0 = wait forever)
        #[arg(short, long, default_value = "60")]
        timeout: u64,
    },
}

fn load_config(args: &Args) -> anyhow::Result<DiverConfig> {
    match &args.config {
        Some(path) => DiverConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(DiverConfig::default()),
    }
}

fn agent_path(args: &Args) -> anyhow::Result<PathBuf> {
    let path = match &args.agent {
        Some(path) => path.clone(),
        None => {
            let exe_dir = match std::env::current_exe()?.parent() {
                Some(p) => p.to_path_buf(),
                None => std::env::current_dir()?,
            };
            exe_dir.join("Diver.dll")
        }
    };
    if !path.exists() {
        bail!("agent assembly not found: {}", path.display());
    }
    // The target resolves the path itself, so hand it an absolute one
    Ok(path.canonicalize().unwrap_or(path))
}

fn resolve_pid(command: &Command) -> anyhow::Result<u32> {
    match command {
        Command::Pid { pid } => Ok(*pid),
        Command::Name { name } => find_process_by_name(name)?
            .with_context(|| format!("no running process named {}", name)),
        Command::Wait { name, timeout } => {
            let started = Instant::now();
            let limit = (*timeout > 0).then(|| Duration::from_secs(*timeout));
            info!(target: "diver_loader", name = %name, timeout_secs = *timeout, "Waiting for process");
            loop {
                if let Some(pid) = find_process_by_name(name)? {
                    return Ok(pid);
                }
                if limit.is_some_and(|l| started.elapsed() >= l) {
                    bail!("process {} did not start within {} s", name, timeout);
                }
                std::thread::sleep(Duration::from_millis(250));
            }
        }
    }
}

fn build_request(args: &Args, config: &DiverConfig, agent: &std::path::Path) -> anyhow::Result<InjectionRequest> {
    let mut argument = AgentArgument::new();
    for field in &args.arguments {
        argument = argument.field(field.as_str())?;
    }
    let version = args
        .runtime_version
        .clone()
        .unwrap_or_else(|| config.injector.runtime_version.clone());
    Ok(InjectionRequest::new(
        agent.to_string_lossy(),
        args.entry_type.as_str(),
        args.method.as_str(),
    )
    .with_argument(&argument)
    .with_runtime_version(version))
}

fn inject_with_retry(pid: u32, request: &InjectionRequest, args: &Args) -> anyhow::Result<InjectionReport> {
    let mut attempt = 0;
    loop {
        let result = open_process(pid).and_then(|process| inject(process.as_ref(), request));
        match result {
            Ok(report) => return Ok(report),
            Err(e) if attempt < args.retries && e.is_retryable() => {
                attempt += 1;
                warn!(target: "diver_loader", attempt, error = %e, "Injection failed, retrying");
                std::thread::sleep(Duration::from_millis(args.retry_delay));
            }
            Err(e) => return Err(e).with_context(|| format!("injecting into process {}", pid)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    if args.config.is_some() {
        init_logging(&config.logging);
    } else {
        init_host_logging();
    }

    println!("Diver Loader v{}", env!("CARGO_PKG_VERSION"));

    let agent = agent_path(&args)?;
    println!("Agent: {}", agent.display());

    let request = build_request(&args, &config, &agent)?;
    let pid = resolve_pid(&args.command)?;
    println!("Target: PID {}", pid);

    let report = inject_with_retry(pid, &request, &args)?;
    println!(
        "Bootstrap thread {} started in PID {} (stub at {:#x})",
        report.thread_id, report.pid, report.stub_address
    );

    if let Some(port) = args.probe_port {
        let address = SocketAddr::from(([127, 0, 0, 1], port));
        let probe_timeout = config.injector.liveness_poll();
        let waited = wait_for_agent(
            || TcpStream::connect_timeout(&address, probe_timeout).is_ok(),
            config.injector.liveness_timeout(),
            config.injector.liveness_poll(),
        )
        .context("agent did not come up")?;
        println!(
            "Agent is listening on {} (after {} ms)",
            address,
            waited.as_millis()
        );
    }

    Ok(())
}
