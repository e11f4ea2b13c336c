//! Load simulator for the dynamic batch scheduler

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use dynbatch_scheduler::config::{ConfigBuilder, generate_example_config};
use dynbatch_scheduler::monitoring::init_tracing;
use dynbatch_scheduler::{
    DynamicBatchScheduler, InMemoryResponseCache, InferenceRequest, MetricsReporter, Scheduler, SchedulerComponents,
    SchedulerStats, SemaphoreAdmission, SyntheticBackend,
};

#[derive(Parser)]
#[command(name = "dynbatch-sim")]
#[command(about = "Drive the dynamic batch scheduler with synthetic load")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "DYNBATCH_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Total requests to submit
    #[arg(long, default_value = "1000")]
    requests: usize,

    /// Concurrent producer tasks
    #[arg(long, default_value = "8")]
    producers: usize,

    /// Pause between submissions of one producer, in microseconds
    #[arg(long, default_value = "100")]
    arrival_interval_us: u64,

    /// Fixed backend latency per payload, in microseconds
    #[arg(long, default_value = "2000")]
    backend_base_us: u64,

    /// Additional backend latency per batch slot, in microseconds
    #[arg(long, default_value = "50")]
    backend_per_slot_us: u64,

    /// Payloads allowed to execute concurrently
    #[arg(long, default_value = "2")]
    max_inflight: usize,

    /// Give request `i` fingerprint `i % N`, so repeated fingerprints can hit the cache
    #[arg(long)]
    fingerprint_modulo: Option<u64>,

    /// Response cache capacity when caching is enabled
    #[arg(long, default_value = "4096")]
    cache_capacity: u64,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds to wait for the scheduler to drain
    #[arg(long, default_value = "10")]
    shutdown_timeout: u64,
}

#[derive(Debug, Serialize)]
struct SimReport {
    submitted: usize,
    completed: usize,
    failed: usize,
    rejected: usize,
    elapsed_ms: u128,
    throughput_rps: f64,
    avg_batch_requests: f64,
    drain_ms: u128,
    scheduler: SchedulerStats,
}

#[derive(Default)]
struct ProducerTally {
    completed: usize,
    failed: usize,
    rejected: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        println!("{}", generate_example_config());
        return Ok(());
    }

    let mut builder = ConfigBuilder::new();
    if let Some(path) = &args.config {
        builder = builder.from_file(path)?;
    }
    let mut config = builder.from_env()?.validate()?.build();
    if let Some(level) = args.log_level.clone() {
        config.monitoring.log_level = level;
    }

    let _tracing = init_tracing(&config.monitoring)?;

    let backend = Arc::new(SyntheticBackend::new(
        Duration::from_micros(args.backend_base_us),
        Duration::from_micros(args.backend_per_slot_us),
    ));
    let mut components = SchedulerComponents::new(backend)
        .with_admission(Arc::new(SemaphoreAdmission::per_payload(args.max_inflight)));
    if config.scheduler.response_cache {
        components = components.with_cache(Arc::new(InMemoryResponseCache::new(args.cache_capacity)));
    }
    if config.monitoring.metrics_enabled {
        // This binary installs no recorder; the JSON report carries the scheduler's own counters.
        debug!("Forwarding scheduler metrics to the metrics facade without a recorder");
        components = components.with_metrics(Arc::new(MetricsReporter::new(config.scheduler.model_name.clone())));
    }

    let priority_levels = config.scheduler.priority_levels;
    let scheduler = Arc::new(DynamicBatchScheduler::new(config.scheduler, components)?);

    info!(requests = args.requests, producers = args.producers, "Starting simulation");
    let started = Instant::now();

    let producers = args.producers.max(1);
    let mut tasks = Vec::with_capacity(producers);
    for producer in 0..producers {
        let scheduler = Arc::clone(&scheduler);
        let total = args.requests;
        let interval = Duration::from_micros(args.arrival_interval_us);
        let fingerprint_modulo = args.fingerprint_modulo.filter(|m| *m > 0);

        tasks.push(tokio::spawn(async move {
            let mut tally = ProducerTally::default();
            let mut handles = Vec::new();

            for i in (producer..total).step_by(producers) {
                let id = i as u64;
                let priority = if priority_levels > 0 { (id % u64::from(priority_levels)) as u32 + 1 } else { 0 };
                let mut request = InferenceRequest::new(id).with_priority(priority);
                if let Some(m) = fingerprint_modulo {
                    request = request.with_fingerprint(id % m);
                }

                match scheduler.enqueue(request) {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        debug!(request_id = id, error = %err, "Submission rejected");
                        tally.rejected += 1;
                    }
                }

                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }

            for handle in handles {
                match handle.await {
                    Ok(_) => tally.completed += 1,
                    Err(_) => tally.failed += 1,
                }
            }
            tally
        }));
    }

    let mut totals = ProducerTally::default();
    for task in tasks {
        let tally = task.await?;
        totals.completed += tally.completed;
        totals.failed += tally.failed;
        totals.rejected += tally.rejected;
    }
    let elapsed = started.elapsed();

    let stats = scheduler.stats();
    let drain = scheduler.shutdown(Duration::from_secs(args.shutdown_timeout)).await;

    let report = SimReport {
        submitted: args.requests,
        completed: totals.completed,
        failed: totals.failed,
        rejected: totals.rejected,
        elapsed_ms: elapsed.as_millis(),
        throughput_rps: totals.completed as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        avg_batch_requests: if stats.batches_dispatched > 0 {
            stats.requests_dispatched as f64 / stats.batches_dispatched as f64
        } else {
            0.0
        },
        drain_ms: drain.as_millis(),
        scheduler: stats,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
