use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use clap::Parser;
use crossbeam_channel::{bounded, tick, Receiver, Sender};

use dnswatch::capture::PacketCapture;
use dnswatch::cli::Cli;
use dnswatch::correlator::Correlator;
use dnswatch::error::WatchError;
use dnswatch::output::json::JsonLinesSink;
use dnswatch::output::RecordSink;
use dnswatch::record::Record;
use dnswatch::sniff::PacketIngest;
use dnswatch::stats::StatsAggregator;
use dnswatch::{capture, privilege};

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
    }
}

fn exit_code(err: &WatchError) -> i32 {
    match err {
        WatchError::InsufficientPermission(_) => 1,
        WatchError::CaptureDevice(_) => 2,
        WatchError::Config { .. } => 3,
        _ => 4,
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

fn run(cli: Cli) -> Result<(), WatchError> {
    install_signal_handlers();
    privilege::check_root()?;

    let config = cli.resolve_config()?;
    let timeout = config.transaction_timeout();

    let mut cap = PacketCapture::new(&cli.interface)?;
    log::info!(
        "observing {} on {} (timeout {}s)",
        config
            .ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(","),
        cli.interface,
        config.transaction_timeout_secs
    );

    let (frame_tx, frame_rx): (
        Sender<capture::linux::CapturedFrame>,
        Receiver<capture::linux::CapturedFrame>,
    ) = bounded(8192);
    let (record_tx, record_rx): (Sender<Record>, Receiver<Record>) = bounded(1024);

    let stats = Arc::new(StatsAggregator::new());
    let correlator = Arc::new(Correlator::new(
        config.clone(),
        Arc::clone(&stats),
        record_tx,
    ));
    let ingest = Arc::new(PacketIngest::new(
        config.ports.iter().copied(),
        Arc::clone(&correlator),
        Arc::clone(&stats),
    ));

    let mut handles = Vec::new();

    // Capture thread: blocking reads with a short timeout, frames into the
    // worker queue.
    let link_type = cap.link_type();
    let capture_handle = thread::Builder::new()
        .name("dnswatch-capture".into())
        .spawn(move || capture_loop(&mut cap, &frame_tx))
        .map_err(|e| WatchError::Fatal(format!("spawn capture thread: {e}")))?;

    // Worker threads: parse, defragment, correlate.
    let workers = thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2);
    for i in 0..workers {
        let rx = frame_rx.clone();
        let ingest = Arc::clone(&ingest);
        let h = thread::Builder::new()
            .name(format!("dnswatch-worker-{i}"))
            .spawn(move || worker_loop(&rx, &ingest, link_type))
            .map_err(|e| WatchError::Fatal(format!("spawn worker thread: {e}")))?;
        handles.push(h);
    }
    drop(frame_rx);

    // Janitor: expire unanswered transactions at the timeout period.
    {
        let correlator = Arc::clone(&correlator);
        let h = thread::Builder::new()
            .name("dnswatch-janitor".into())
            .spawn(move || janitor_loop(&correlator, timeout))
            .map_err(|e| WatchError::Fatal(format!("spawn janitor thread: {e}")))?;
        handles.push(h);
    }

    // Optional counter snapshots to the log.
    if let Some(secs) = cli.stats_interval {
        let stats = Arc::clone(&stats);
        let h = thread::Builder::new()
            .name("dnswatch-stats".into())
            .spawn(move || stats_loop(&stats, Duration::from_secs(secs)))
            .map_err(|e| WatchError::Fatal(format!("spawn stats thread: {e}")))?;
        handles.push(h);
    }

    // Publisher: drains the record queue to stdout, off every map lock.
    let publisher_handle = thread::Builder::new()
        .name("dnswatch-publisher".into())
        .spawn(move || publisher_loop(&record_rx))
        .map_err(|e| WatchError::Fatal(format!("spawn publisher thread: {e}")))?;

    // The capture thread owns the frame sender; when it returns, the worker
    // queue disconnects and everything downstream unwinds.
    let _ = capture_handle.join();
    for h in handles {
        let _ = h.join();
    }

    // Flush whatever never got a response, then let the publisher drain.
    correlator.flush();
    drop(ingest);
    drop(correlator);
    let _ = publisher_handle.join();

    let snapshot = stats.global_snapshot();
    log::info!(
        "done: {} requests, {} responses, {} unmatched",
        snapshot.requests,
        snapshot.responses,
        snapshot.unmatched_requests
    );
    Ok(())
}

fn capture_loop(cap: &mut PacketCapture, tx: &Sender<capture::linux::CapturedFrame>) {
    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            return;
        }
        match cap.read_frame() {
            Ok(Some(frame)) => {
                if tx.send(frame).is_err() {
                    return; // workers gone
                }
            }
            Ok(None) => {} // receive timeout, re-check shutdown
            Err(e) => {
                log::warn!("capture read error: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn worker_loop(
    rx: &Receiver<capture::linux::CapturedFrame>,
    ingest: &PacketIngest,
    link_type: dnswatch::packet::LinkType,
) {
    for frame in rx.iter() {
        ingest.handle_frame(&frame.data, link_type, frame.ts);
    }
}

fn janitor_loop(correlator: &Correlator, timeout: Duration) {
    let ticker = tick(timeout);
    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            return;
        }
        crossbeam_channel::select! {
            recv(ticker) -> _ => correlator.sweep(SystemTime::now()),
            default(Duration::from_millis(500)) => {},
        }
    }
}

fn stats_loop(stats: &StatsAggregator, interval: Duration) {
    let ticker = tick(interval);
    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            return;
        }
        crossbeam_channel::select! {
            recv(ticker) -> _ => {
                match serde_json::to_string(&stats.global_snapshot()) {
                    Ok(json) => log::info!("counters {json}"),
                    Err(e) => log::warn!("counter snapshot failed: {e}"),
                }
            }
            default(Duration::from_millis(500)) => {},
        }
    }
}

fn publisher_loop(rx: &Receiver<Record>) {
    let mut sink = JsonLinesSink::new(io::stdout());
    for record in rx.iter() {
        if let Err(e) = sink.publish(&record) {
            log::warn!("publish failed, record dropped: {e}");
        }
    }
    if let Err(e) = sink.flush() {
        log::warn!("flush failed: {e}");
    }
}
