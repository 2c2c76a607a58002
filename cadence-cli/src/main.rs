use std::path::PathBuf;
use std::process::{Command, ExitCode, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use cadence_cli::supervisor::{self, StopOutcome};
use cadence_cli::telemetry::{init_tracing, RotationPolicy};
use cadence_config::{load_config_from, AppConfig};

/// Exit codes shared with the deployment tooling.
const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_MISCONFIGURED: u8 = 2;
const EXIT_ALREADY_RUNNING: u8 = 3;
const EXIT_NOT_RUNNING: u8 = 4;

const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about = "Cadence recurring order service")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long)]
    env: Option<String>,
    /// Configuration directory
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service in the background
    Start(StartArgs),
    /// Stop the background service
    Stop,
    /// Stop then start the background service
    Restart,
    /// Report whether the service is running and what it is up to
    Status,
    /// Show the service log
    Logs(LogsArgs),
    /// Trigger a recurring-order run on the running service
    Execute(ExecuteArgs),
    /// Run the service in the foreground (what `start` detaches)
    #[command(hide = true)]
    Run,
}

#[derive(Args)]
struct StartArgs {
    /// Run in the foreground instead of detaching
    #[arg(long)]
    foreground: bool,
}

#[derive(Args)]
struct LogsArgs {
    /// Follow the log as it grows
    #[arg(short, long)]
    follow: bool,
    /// Number of lines to show
    #[arg(short = 'n', long, default_value_t = 50)]
    lines: usize,
}

#[derive(Args)]
struct ExecuteArgs {
    /// Restrict the run to one frequency class (daily, weekly, monthly)
    #[arg(long)]
    frequency: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config_from(&cli.config_dir, cli.env.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_MISCONFIGURED);
        }
    };

    let filter = match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let code = match &cli.command {
        Commands::Run => cmd_run(config, &filter).await,
        Commands::Start(args) if args.foreground => cmd_run(config, &filter).await,
        Commands::Start(_) => cmd_start(&cli, &config),
        Commands::Stop => cmd_stop(&config),
        Commands::Restart => {
            let stop_code = cmd_stop(&config);
            if stop_code != EXIT_OK && stop_code != EXIT_NOT_RUNNING {
                stop_code
            } else {
                std::thread::sleep(Duration::from_secs(1));
                cmd_start(&cli, &config)
            }
        }
        Commands::Status => cmd_status(&config).await,
        Commands::Logs(args) => cmd_logs(&config, args),
        Commands::Execute(args) => cmd_execute(&config, args).await,
    };
    ExitCode::from(code)
}

/// Foreground service run, the supervisor's child.
async fn cmd_run(config: AppConfig, filter: &str) -> u8 {
    let sink = Some((
        config.service.log_path.clone(),
        RotationPolicy {
            max_bytes: config.service.log_rotate_bytes,
            keep_files: config.service.log_keep_files,
        },
    ));
    if let Err(err) = init_tracing(filter, sink) {
        eprintln!("failed to initialize logging: {err}");
        return EXIT_FAILURE;
    }
    match cadence_service::run_service(config).await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            tracing::error!(error = %err, "service exited with error");
            EXIT_FAILURE
        }
    }
}

fn cmd_start(cli: &Cli, config: &AppConfig) -> u8 {
    if let Some(pid) = supervisor::probe(&config.service.pid_file) {
        eprintln!("service is already running (pid {pid})");
        return EXIT_ALREADY_RUNNING;
    }
    match spawn_detached(cli, config) {
        Ok(pid) => {
            // Give the child a moment to write its PID file and settle.
            for _ in 0..20 {
                std::thread::sleep(Duration::from_millis(250));
                if let Some(live) = supervisor::probe(&config.service.pid_file) {
                    println!("service started (pid {live})");
                    println!(
                        "status: http://{}/recurring/status",
                        config.service.listen_addr
                    );
                    return EXIT_OK;
                }
                if !supervisor::is_alive(pid) {
                    break;
                }
            }
            eprintln!(
                "service failed to start; check {}",
                config.service.log_path.display()
            );
            EXIT_FAILURE
        }
        Err(err) => {
            eprintln!("failed to start service: {err}");
            EXIT_FAILURE
        }
    }
}

fn spawn_detached(cli: &Cli, config: &AppConfig) -> Result<i32> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let log_dir = config
        .service
        .log_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let stdout = std::fs::File::create(log_dir.join("service_stdout.log"))?;
    let stderr = std::fs::File::create(log_dir.join("service_stderr.log"))?;

    let mut command = Command::new(exe);
    command
        .arg("--config-dir")
        .arg(&cli.config_dir)
        .arg("run")
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    if let Some(env) = &cli.env {
        command.arg("--env").arg(env);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let child = command.spawn().context("failed to spawn service process")?;
    Ok(child.id() as i32)
}

fn cmd_stop(config: &AppConfig) -> u8 {
    let Some(pid) = supervisor::probe(&config.service.pid_file) else {
        eprintln!("service is not running");
        return EXIT_NOT_RUNNING;
    };
    match supervisor::stop(&config.service.pid_file, pid, STOP_GRACE) {
        Ok(StopOutcome::Graceful) => {
            println!("service stopped");
            EXIT_OK
        }
        Ok(StopOutcome::Killed) => {
            println!("service did not stop gracefully; killed");
            EXIT_OK
        }
        Err(err) => {
            eprintln!("failed to stop service: {err}");
            EXIT_FAILURE
        }
    }
}

async fn cmd_status(config: &AppConfig) -> u8 {
    let Some(pid) = supervisor::probe(&config.service.pid_file) else {
        println!("service is NOT running");
        return EXIT_FAILURE;
    };
    println!("service is running (pid {pid})");
    if let Some(rss) = supervisor::memory_rss_mib(pid) {
        println!("memory: {rss:.1} MiB");
    }

    let url = format!("http://{}/recurring/status", config.service.listen_addr);
    match fetch_json(&url).await {
        Ok(status) => {
            print_field(&status, "uptime_secs", "uptime (s)");
            print_field(&status, "next_fire", "next fire");
            if let Some(stats) = status.get("statistics") {
                print_field(stats, "executions", "executions");
                print_field(stats, "successes", "successes");
                print_field(stats, "failures", "failures");
                print_field(stats, "last_run_at", "last run");
                print_field(stats, "last_error", "last error");
            }
            if let Some(due) = status.get("due_today").and_then(Value::as_array) {
                if !due.is_empty() {
                    println!("due today:");
                    for entry in due {
                        println!("  - {}", entry.as_str().unwrap_or_default());
                    }
                }
            }
            EXIT_OK
        }
        Err(err) => {
            eprintln!("status API not responding: {err}");
            EXIT_OK
        }
    }
}

fn print_field(value: &Value, key: &str, label: &str) {
    match value.get(key) {
        Some(Value::Null) | None => {}
        Some(Value::String(s)) => println!("{label}: {s}"),
        Some(other) => println!("{label}: {other}"),
    }
}

fn cmd_logs(config: &AppConfig, args: &LogsArgs) -> u8 {
    let path = &config.service.log_path;
    if !path.exists() {
        eprintln!("log file not found: {}", path.display());
        return EXIT_FAILURE;
    }
    if args.follow {
        match supervisor::follow(path) {
            Ok(()) => EXIT_OK,
            Err(err) => {
                eprintln!("failed to follow log: {err}");
                EXIT_FAILURE
            }
        }
    } else {
        match supervisor::tail_lines(path, args.lines) {
            Ok(lines) => {
                for line in lines {
                    println!("{line}");
                }
                EXIT_OK
            }
            Err(err) => {
                eprintln!("failed to read log: {err}");
                EXIT_FAILURE
            }
        }
    }
}

async fn cmd_execute(config: &AppConfig, args: &ExecuteArgs) -> u8 {
    let mut url = format!("http://{}/recurring/execute", config.service.listen_addr);
    if let Some(frequency) = &args.frequency {
        url.push_str(&format!("?frequency={frequency}"));
    }
    let client = reqwest::Client::new();
    let response = match client.post(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            eprintln!("could not reach the service: {err}");
            return EXIT_FAILURE;
        }
    };
    let status = response.status();
    let body: Value = match response.json().await {
        Ok(body) => body,
        Err(err) => {
            eprintln!("bad response from service: {err}");
            return EXIT_FAILURE;
        }
    };
    if status.as_u16() == 409 {
        println!("a run is already in flight");
        return EXIT_OK;
    }
    if !status.is_success() {
        eprintln!(
            "execution failed: {}",
            body.get("message").and_then(Value::as_str).unwrap_or("?")
        );
        return EXIT_FAILURE;
    }
    println!(
        "executed: total={} success={} failed={}",
        body.get("total").and_then(Value::as_u64).unwrap_or(0),
        body.get("successes").and_then(Value::as_u64).unwrap_or(0),
        body.get("failures").and_then(Value::as_u64).unwrap_or(0),
    );
    if let Some(results) = body.get("results").and_then(Value::as_array) {
        for result in results {
            println!(
                "  {} {} -> {}",
                result.get("symbol").and_then(Value::as_str).unwrap_or("?"),
                result
                    .get("requested_qty")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                result
                    .get("outcome")
                    .and_then(Value::as_str)
                    .unwrap_or("?"),
            );
        }
    }
    EXIT_OK
}

async fn fetch_json(url: &str) -> Result<Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    Ok(client.get(url).send().await?.json().await?)
}
