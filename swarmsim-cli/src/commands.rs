//! Subcommand definitions and handlers.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use swarmsim_core::{ManagerHandle, Swarm, SwarmConfig, SwarmError, SwarmStatistics};

#[derive(Subcommand)]
pub enum Commands {
    /// Run one simulation and print its statistics
    Run {
        /// Number of seeds created at start
        #[arg(long, default_value_t = 1)]
        seeds: usize,

        #[command(flatten)]
        options: SimulationArgs,
    },
    /// Run one simulation per seed count and compare completion times
    Sweep {
        /// Comma-separated seed counts, e.g. 1,2,4
        #[arg(long, value_delimiter = ',', default_values_t = [1, 2, 4])]
        seeds: Vec<usize>,

        #[command(flatten)]
        options: SimulationArgs,
    },
}

#[derive(Args, Clone)]
pub struct SimulationArgs {
    /// Number of downloading peers
    #[arg(long, default_value_t = 8)]
    peers: usize,

    /// File size in bytes
    #[arg(long)]
    file_size: Option<u64>,

    /// Block size in bytes
    #[arg(long)]
    block_size: Option<u64>,

    /// Real seconds per simulated second
    #[arg(long)]
    time_dilation: Option<f64>,

    /// Give up waiting after this many real seconds
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,

    /// Fixed seed for reproducible block and peer selection
    #[arg(long)]
    rng_seed: Option<u64>,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,
}

impl SimulationArgs {
    fn config(&self) -> SwarmConfig {
        let mut config = SwarmConfig::from_env();
        if let Some(file_size) = self.file_size {
            config.file.file_size = file_size;
        }
        if let Some(block_size) = self.block_size {
            config.file.block_size = block_size;
        }
        if let Some(time_dilation) = self.time_dilation {
            config.simulation.time_dilation = time_dilation;
        }
        if self.rng_seed.is_some() {
            config.simulation.deterministic_seed = self.rng_seed;
        }
        config
    }
}

/// Outcome of one simulation run.
struct RunReport {
    seeds: usize,
    peers: usize,
    completed: bool,
    stats: SwarmStatistics,
    wall_time: Duration,
}

/// Dispatches a parsed subcommand.
///
/// # Errors
/// - Invalid configuration or a node that fails to join its swarm
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run { seeds, options } => {
            let report = simulate(seeds, &options).await?;
            print_report(&report, options.json)
        }
        Commands::Sweep { seeds, options } => sweep(&seeds, &options).await,
    }
}

async fn simulate(seeds: usize, options: &SimulationArgs) -> Result<RunReport> {
    let config = options.config();
    println!(
        "Simulating {} seeds and {} peers: {} blocks of {} bytes, dilation {}",
        seeds,
        options.peers,
        config.file.block_count(),
        config.file.block_size,
        config.simulation.time_dilation
    );

    let swarm = Swarm::new(config).map_err(describe)?;
    swarm.add_seeds(seeds).await.map_err(describe)?;
    swarm.add_peers(options.peers).await.map_err(describe)?;

    let started = Instant::now();
    let timeout = Duration::from_secs(options.timeout_secs);
    let reporter = spawn_progress_reporter(&swarm);
    let completed = swarm.wait_until_complete(timeout).await;
    reporter.abort();
    let wall_time = started.elapsed();

    if !completed {
        tracing::warn!("Simulation did not finish within {:?}", timeout);
    }
    let stats = swarm.stats();
    swarm.shutdown().await;

    Ok(RunReport {
        seeds,
        peers: options.peers,
        completed,
        stats,
        wall_time,
    })
}

fn spawn_progress_reporter(swarm: &Swarm) -> tokio::task::JoinHandle<()> {
    let manager = std::sync::Arc::clone(swarm.manager());
    let nodes = swarm.nodes();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let peers: Vec<_> = nodes.iter().filter(|node| !node.is_disposed()).collect();
            let mean_progress = if peers.is_empty() {
                0.0
            } else {
                peers.iter().map(|node| node.progress()).sum::<f64>() / peers.len() as f64
            };
            let utilization = manager.bandwidth_utilization().await.unwrap_or(0.0);
            tracing::info!(
                "Seeds {}/{}, mean progress {:.1}%, download in use {:.0} B/s",
                manager.seed_count(),
                manager.node_count(),
                mean_progress * 100.0,
                utilization
            );
        }
    })
}

async fn sweep(seed_counts: &[usize], options: &SimulationArgs) -> Result<()> {
    let mut reports = Vec::with_capacity(seed_counts.len());
    for &seeds in seed_counts {
        let report = simulate(seeds, options)
            .await
            .with_context(|| format!("simulation with {seeds} seeds failed"))?;
        reports.push(report);
    }

    if options.json {
        let rows: Vec<_> = reports.iter().map(report_json).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("Seed/peer sweep");
    println!("{:-<60}", "");
    println!(
        "{:>6} {:>6} {:>8} {:>22} {:>10}",
        "seeds", "peers", "ratio", "mean completion (ms)", "complete"
    );
    for report in &reports {
        println!(
            "{:>6} {:>6} {:>8.3} {:>22} {:>10}",
            report.seeds,
            report.peers,
            ratio(report),
            report.stats.mean_time_to_completion_ms,
            report.completed
        );
    }
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(report))?);
        return Ok(());
    }

    println!("Simulation Results");
    println!("{:-<60}", "");
    println!("Initial seeds: {}", report.stats.initial_seed_count);
    println!("Initial peers: {}", report.stats.initial_peer_count);
    println!("Total nodes: {}", report.stats.total_node_count);
    println!(
        "Mean time to completion: {} simulated ms",
        report.stats.mean_time_to_completion_ms
    );
    println!("Complete: {}", report.completed);
    println!("Wall time: {:.2?}", report.wall_time);
    Ok(())
}

fn report_json(report: &RunReport) -> serde_json::Value {
    serde_json::json!({
        "seeds": report.seeds,
        "peers": report.peers,
        "ratio": ratio(report),
        "completed": report.completed,
        "wall_time_ms": report.wall_time.as_millis() as u64,
        "stats": report.stats,
    })
}

fn ratio(report: &RunReport) -> f64 {
    if report.peers == 0 {
        return 0.0;
    }
    report.seeds as f64 / report.peers as f64
}

fn describe(error: SwarmError) -> anyhow::Error {
    let message = error.user_message();
    anyhow::Error::new(error).context(message)
}
