//! Shared memory ambilight consumer daemon
//!
//! Attaches to the producer's frame segment, smooths and scales the frames and
//! pushes them to the configured sink until SIGINT or SIGTERM.

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use ambilight_consumer::{
    ConsumerError, DeviceSink, DiagnosticSink, OutputSink, PerformanceMonitor, Pipeline,
    ShmFrameSource, run,
};
use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Args, FileConfig, Settings, SinkChoice};

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    exit_code(try_main(args))
}

/// 0 after a clean interrupt, 1 for any bootstrap or pipeline error
fn exit_code(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn try_main(args: Args) -> Result<()> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(args, file)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .with_context(|| format!("failed to register handler for signal {signal}"))?;
    }

    let source = ShmFrameSource::attach(
        &settings.segment,
        &settings.semaphore,
        settings.pipeline.layout,
        settings.pipeline.acquire_timeout,
    )
    .context("failed to attach to the frame producer")?;

    match &settings.sink {
        SinkChoice::Diagnostic { log_every } => {
            let mut sink = DiagnosticSink::new().with_history(1).with_logging(*log_every);
            if let Some(perimeter) = settings.perimeter {
                sink = sink.with_perimeter(perimeter);
            }
            consume(source, sink, &settings, &shutdown)?;
        }
        SinkChoice::Device(path) => {
            let sink = DeviceSink::open(path)
                .with_context(|| format!("failed to open output device {}", path.display()))?;
            consume(source, sink, &settings, &shutdown)?;
        }
    }

    info!("stopped cleanly");
    Ok(())
}

fn consume<O: OutputSink>(
    source: ShmFrameSource,
    sink: O,
    settings: &Settings,
    shutdown: &AtomicBool,
) -> Result<(), ConsumerError> {
    let pipeline = Pipeline::new(source, sink, &settings.pipeline);
    let monitor = settings.monitor.then(PerformanceMonitor::new);
    run(pipeline, shutdown, monitor).map(drop)
}
