//! procpool - run units of work on a pool of worker subprocesses

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{
    OwoColorize,
    Stream::{Stderr, Stdout},
};
use procpool::builtin::Task;
use procpool::logging::{self, LogConfig, level_for_verbosity};
use procpool::worker::{self, DispatchConfig};
use procpool::{Pool, PoolConfig, PoolStats};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use cli::{Cli, Commands, RunArgs};

fn main() {
    // Workers re-execute this binary; they must not touch stdout or parse arguments.
    if worker::is_worker_process() {
        logging::init(LogConfig::for_worker().with_env_overrides());
        worker::run_worker_main::<Task>(DispatchConfig::from_env());
    }

    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Install the subscriber. Explicit flags win over the environment.
fn init_logging(cli: &Cli) {
    let mut config = LogConfig::for_controller()
        .with_ansi(!cli.no_color)
        .with_env_overrides();
    if cli.verbose > 0 || cli.quiet {
        config = config.with_level(level_for_verbosity(cli.verbose, cli.quiet));
        config.filter = None;
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    logging::init(config);
}

/// One line of the run report.
#[derive(Debug, Serialize)]
struct WorkerRow {
    index: usize,
    pid: i32,
    frequency: u64,
    failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    workers: Vec<WorkerRow>,
    stats: PoolStats,
}

fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let mut config = PoolConfig::for_current_exe()?
        .with_env_overrides()
        .with_name("run");
    if let Some(workers) = args.workers {
        config = config.with_size(workers);
    }
    if cli.verbose > 0 || cli.quiet {
        let level = level_for_verbosity(cli.verbose, cli.quiet);
        config.command = config.command.env("PROCPOOL_LOG_LEVEL", level.to_string());
    }

    let mut pool: Pool<Task> = Pool::new(config).context("Failed to start worker pool")?;

    if args.expand > 0 {
        pool.expand(args.expand)?;
    }
    if args.shrink > 0 {
        pool.shrink(args.shrink)?;
    }

    let sleep = Task::sleep(Duration::from_millis(args.sleep_ms));
    for _ in 0..args.tasks {
        pool.schedule(&sleep).context("Failed to schedule task")?;
    }
    if args.broadcast {
        let reached = pool.broadcast(&Task::Noop)?.len();
        debug!(workers = reached, "Broadcast no-op task");
    }
    for n in 1..=args.fail {
        pool.schedule(&Task::fail(format!("requested failure #{}", n)))
            .context("Failed to schedule failing task")?;
    }

    // Stats are taken after shutdown so every published outcome has been merged.
    pool.shutdown(args.timeout.map(Duration::from_millis))
        .context("Failed to shut down worker pool")?;

    let report = collect_report(&mut pool);
    info!(
        dispatched = report.stats.total_dispatched,
        failed = report.stats.failed,
        "Run finished"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn collect_report(pool: &mut Pool<Task>) -> RunReport {
    let workers = pool
        .workers_mut()
        .iter_mut()
        .enumerate()
        .map(|(index, w)| WorkerRow {
            index,
            pid: w.pid().as_raw(),
            frequency: w.frequency(),
            failed: w.is_failed(),
            failure: w.backtrace().map(|bt| bt.lines().next().unwrap_or_default().to_string()),
        })
        .collect();
    RunReport {
        workers,
        stats: pool.stats(),
    }
}

fn print_report(report: &RunReport) {
    println!(
        "{} {} workers, {} units dispatched, {} failed",
        "Pool:".if_supports_color(Stdout, |text| text.bold()),
        report.stats.worker_count,
        report.stats.total_dispatched,
        report.stats.failed
    );
    for row in &report.workers {
        let state = if row.failed {
            format!(
                "{} {}",
                "failed".if_supports_color(Stdout, |text| text.red()),
                row.failure.as_deref().unwrap_or_default()
            )
        } else {
            "ok".if_supports_color(Stdout, |text| text.green()).to_string()
        };
        println!(
            "  #{:<3} pid {:<8} frequency {:<5} {}",
            row.index, row.pid, row.frequency, state
        );
    }
}
