use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::time::sleep;

#[cfg(feature = "demo-signals")]
use vesperd::demo::DemoProfile;
use vesperd::clock::Clock;
use vesperd::config::Config;
use vesperd::custom::multi_rising_edge::{MultiRisingEdgeTrigger, MULTI_RISING_EDGE_TRIGGER};
use vesperd::fetch::{DataFetchManager, FetchFunctionRegistry};
use vesperd::inspection::engine::InspectionEngine;
use vesperd::inspection::worker::InspectionWorker;
use vesperd::lks::persist::MetadataStore;
use vesperd::lks::worker::LastKnownStateWorker;
use vesperd::lks::LastKnownStateInspector;
use vesperd::metrics::Metrics;
use vesperd::producer::{NamedSignalSource, SignalDistributor};
use vesperd::queue::BoundedQueue;
use vesperd::rawbuf::RawBufferManager;
use vesperd::schemes::load_scheme_bundle;
use vesperd::sink::{spawn_sender, JsonlSink, SinkList};

#[derive(Parser, Debug)]
#[command(name = "vesperd")]
#[command(about = "Vesper vehicle telemetry inspection daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH", default_value = "/etc/vesper/vesper.toml")]
    config: PathBuf,
    /// Scheme file to install at startup, overriding the configured one
    #[arg(long, value_name = "PATH")]
    schemes: Option<PathBuf>,
    /// Validate configuration and schemes, then exit
    #[arg(long)]
    dry_run: bool,
    #[cfg(feature = "demo-signals")]
    /// Generate synthetic driving signals (cruise, city)
    #[arg(long, value_enum)]
    demo: Option<DemoProfile>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    println!("[vesperd] Starting inspection daemon...");

    let config = Config::load_from(args.config.clone());

    // --- Metrics ---
    let metrics = Arc::new(Metrics::new());
    {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                metrics.rollup();
            }
        });
    }
    {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                log::info!(
                    "metrics: signals/s={} payloads={} triggered={} eval_errors={} queue_drops={}",
                    metrics.signals_per_sec(),
                    metrics.payloads_total(),
                    metrics.conditions_triggered(),
                    metrics.eval_errors(),
                    metrics.queue_drops()
                );
            }
        });
    }

    let clock = Clock::new();
    let raw_buffer_manager = Arc::new(RawBufferManager::new(&config.rawbuf));

    // --- Queues ---
    let notify_every = config.runtime.queue_notify_every;
    let signal_queue = Arc::new(BoundedQueue::with_notify_every(
        config.runtime.signal_queue_size,
        "signal buffer",
        notify_every,
    ));
    let lks_signal_queue = Arc::new(BoundedQueue::with_notify_every(
        config.runtime.signal_queue_size,
        "last known state signal buffer",
        notify_every,
    ));
    let output_queue = Arc::new(BoundedQueue::new(
        config.runtime.payload_queue_size,
        "collected data",
    ));
    let fetch_queue = Arc::new(BoundedQueue::new(
        config.runtime.fetch_queue_size,
        "fetch requests",
    ));
    let command_queue = Arc::new(BoundedQueue::new(16, "state template commands"));

    let distributor = Arc::new(SignalDistributor::new(
        vec![Arc::clone(&signal_queue), Arc::clone(&lks_signal_queue)],
        Arc::clone(&metrics),
    ));
    let named_signal_source = Arc::new(NamedSignalSource::new(
        Arc::clone(&distributor),
        Some(Arc::clone(&raw_buffer_manager)),
        clock.clone(),
    ));

    // --- Inspection engine + worker ---
    let mut engine = InspectionEngine::new(
        Some(Arc::clone(&raw_buffer_manager)),
        Some(Arc::clone(&fetch_queue)),
        config.inspection.send_once_per_condition,
        config.inspection.min_fetch_trigger_ms,
        Arc::clone(&metrics),
    );
    engine.register_custom_function(
        MULTI_RISING_EDGE_TRIGGER,
        Arc::new(MultiRisingEdgeTrigger::new(
            Arc::clone(&named_signal_source),
            Some(Arc::clone(&raw_buffer_manager)),
        )),
    );

    if args.dry_run {
        // Validate the scheme file without starting any worker.
        if let Some(path) = args.schemes.as_deref() {
            let bundle = load_scheme_bundle(path).context("scheme validation failed")?;
            println!(
                "[vesperd] Dry run: schemes ok (inspection: {}, fetch: {}, templates: {})",
                bundle.inspection.is_some(),
                bundle.fetch.is_some(),
                bundle.state_templates.is_some()
            );
        }
        println!("[vesperd] Dry run requested; exiting after validation.");
        return Ok(());
    }

    let mut inspection_worker = InspectionWorker::start(
        engine,
        Arc::clone(&signal_queue),
        Arc::clone(&output_queue),
        Some(Arc::clone(&raw_buffer_manager)),
        clock.clone(),
        Arc::clone(&metrics),
        config.runtime.idle_wait_ms,
    );

    // --- Last-known-state worker ---
    let metadata_store = MetadataStore::new(std::path::Path::new(&config.persistence.dir));
    let inspector = LastKnownStateInspector::new(
        Arc::clone(&output_queue),
        Some(metadata_store),
        Arc::clone(&metrics),
    );
    let mut lks_worker = LastKnownStateWorker::start(
        inspector,
        Arc::clone(&lks_signal_queue),
        Arc::clone(&command_queue),
        Arc::clone(&output_queue),
        clock.clone(),
        Arc::clone(&metrics),
        config.runtime.idle_wait_ms,
    );

    // --- Fetch worker ---
    // Fetch functions (UDS DTC queries etc.) are registered here by the
    // integration; the stock daemon starts with an empty registry.
    let fetch_registry = FetchFunctionRegistry::new();
    let mut fetch_manager = DataFetchManager::start(
        Arc::clone(&fetch_queue),
        fetch_registry,
        clock.clone(),
        Arc::clone(&metrics),
    );

    // --- Install schemes from file, if any ---
    let scheme_path = args
        .schemes
        .clone()
        .or_else(|| config.schemes.file.as_ref().map(PathBuf::from));
    if let Some(path) = scheme_path {
        match load_scheme_bundle(&path) {
            Ok(bundle) => {
                info!("[vesperd] installing schemes from {}", path.display());
                if let Some(matrix) = bundle.inspection {
                    inspection_worker.on_change_inspection_matrix(Arc::new(matrix));
                }
                if let Some(fetch_matrix) = bundle.fetch {
                    fetch_manager.on_change_fetch_matrix(Arc::new(fetch_matrix));
                }
                if let Some(templates) = bundle.state_templates {
                    lks_worker.on_change_state_templates(Arc::new(templates));
                }
            }
            Err(error) => warn!("[vesperd] failed to load schemes: {:#}", error),
        }
    }

    // --- Sender ---
    let mut sinks = SinkList::new();
    match JsonlSink::new(
        &config.output.payload_file,
        Some(Arc::clone(&raw_buffer_manager)),
    )
    .await
    {
        Ok(sink) => sinks.register(sink),
        Err(error) => warn!(
            "[vesperd] payload sink unavailable ({}): {}",
            config.output.payload_file, error
        ),
    }
    let sender_task = spawn_sender(Arc::clone(&output_queue), Arc::new(sinks));

    #[cfg(feature = "demo-signals")]
    if let Some(profile) = args.demo.clone() {
        let distributor = Arc::clone(&distributor);
        let demo_clock = clock.clone();
        println!("[vesperd] Demo profile {:?} active", profile);
        tokio::spawn(async move {
            vesperd::demo::run_demo(profile, distributor, demo_clock).await;
        });
    }

    // --- Shutdown ---
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    println!("[vesperd] Running. Press Ctrl+C to exit.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {
            println!("[vesperd] SIGTERM received");
        }
    }

    println!("[vesperd] Shutting down...");
    inspection_worker.stop();
    lks_worker.stop();
    fetch_manager.stop();
    // Let the sender flush what the workers drained on the way out.
    sleep(Duration::from_millis(200)).await;
    sender_task.abort();
    info!("[vesperd] shutdown complete");
    Ok(())
}
