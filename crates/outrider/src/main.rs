//! Thin CLI host: supervise one worker script and tail its output.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use outrider::{LogLevel, LogRecord, SupervisorConfig, WorkerSupervisor, COUNTERS};
use outrider_logging::LogConfig;

#[derive(Parser, Debug)]
#[command(name = "outrider", version, about = "Supervise an interpreter worker script")]
struct Cli {
    /// Target script to run inside the worker
    script: PathBuf,

    /// Worker argument, forwarded as JSON (repeatable)
    #[arg(long = "arg", value_name = "VALUE")]
    args: Vec<String>,

    #[arg(long, env = "OUTRIDER_INTERPRETER", default_value = "python3")]
    interpreter: PathBuf,

    /// Bootstrap program executed inside the worker
    #[arg(long, env = "OUTRIDER_BOOTSTRAP", default_value = "bootstrap.py")]
    bootstrap: PathBuf,

    #[arg(long, default_value_t = 512)]
    memory_limit_mb: u32,

    #[arg(long, default_value_t = 80.0)]
    cpu_limit_percent: f64,

    /// Worker log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long, default_value = "INFO")]
    log_level: String,

    /// Mirror supervisor diagnostics to the console
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    outrider_logging::init_logging(LogConfig {
        app_name: "outrider",
        verbose: cli.verbose,
    })
    .context("failed to initialize logging")?;

    let worker_log_level: LogLevel = cli.log_level.parse().map_err(|e: String| anyhow!(e))?;

    let config = SupervisorConfig {
        interpreter: cli.interpreter,
        bootstrap: cli.bootstrap,
        memory_limit_mb: cli.memory_limit_mb,
        cpu_limit_percent: cli.cpu_limit_percent,
        worker_log_level,
        ..Default::default()
    };

    let supervisor = WorkerSupervisor::new(config);
    let id = supervisor
        .create(&cli.script, &cli.args)
        .context("failed to launch worker")?;
    eprintln!("worker {} started", id);

    let stream = supervisor
        .log_stream(id)
        .ok_or_else(|| anyhow!("log stream unavailable for worker {}", id))?;

    loop {
        while let Some(record) = stream.next_record(Duration::from_millis(250)) {
            print_record(&record);
        }
        match supervisor.status(id) {
            Some(status) if status.is_terminal() => break,
            None => break,
            _ => {}
        }
    }

    // The pumps survive the worker; give trailing output a moment.
    while let Some(record) = stream.next_record(Duration::from_millis(500)) {
        print_record(&record);
    }

    if let Some(status) = supervisor.status(id) {
        eprintln!("worker {} finished: {}", id, status);
    }
    if let Some(metrics) = supervisor.metrics(id) {
        eprintln!(
            "cpu: {} ms, memory: {} bytes (peak {}), ran {:.1}s",
            metrics.cpu_time_ms,
            metrics.current_memory_bytes,
            metrics.peak_memory_bytes,
            metrics.execution_time.as_secs_f64()
        );
    }
    eprintln!("{}", COUNTERS.snapshot().summary());

    supervisor.shutdown();
    Ok(())
}

fn print_record(record: &LogRecord) {
    println!(
        "{} [{}] {} {}",
        record.timestamp.format("%H:%M:%S%.3f"),
        record.source.as_str(),
        record.level,
        record.message
    );
}
