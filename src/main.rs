// CSZ link emulator binary
//
// The binary builds a CSZ scheduler from a JSON configuration (or a built-in demo table), feeds
// it from synthetic traffic generators, drives it through the link emulator at the configured
// line rate, and prints JSON statistics once per second until Ctrl+C or the run duration expires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use csz_qdisc::band::Band;
use csz_qdisc::clock::MonotonicClock;
use csz_qdisc::link::LinkDriver;
use csz_qdisc::packet::{Packet, MAX_PACKET_SIZE};
use csz_qdisc::{CszConfig, CszScheduler, FlowId, FlowParams, FlowSelector, Rate, ShaperConfig};

/// Command-line options parsed from program arguments.
struct CliOptions {
    /// JSON scheduler configuration; the demo table when absent.
    config: Option<String>,
    /// Stop after this long; run until Ctrl+C when absent.
    duration: Option<Duration>,
    /// Overrides the configured line rate, in bytes per second.
    link_rate: Option<u64>,
}

/// Parse command-line arguments into `CliOptions`.
///
/// Supports `--key=value` and `--key value` for:
/// - `--config`: path to a JSON scheduler configuration
/// - `--duration-secs`: run time in seconds
/// - `--link-rate`: line rate in bytes per second
fn parse_cli_options() -> CliOptions {
    let mut options = CliOptions {
        config: None,
        duration: None,
        link_rate: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let (key, value) = match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (arg.clone(), args.next()),
        };
        let Some(value) = value else {
            warn!(option = %key, "missing value");
            continue;
        };
        match key.as_str() {
            "--config" => options.config = Some(value),
            "--duration-secs" => match value.parse::<u64>() {
                Ok(secs) => options.duration = Some(Duration::from_secs(secs)),
                Err(_) => warn!(%value, "ignoring invalid --duration-secs"),
            },
            "--link-rate" => match value.parse::<u64>() {
                Ok(rate) => options.link_rate = Some(rate),
                Err(_) => warn!(%value, "ignoring invalid --link-rate"),
            },
            _ => warn!(option = %key, "unknown option"),
        }
    }
    options
}

/// Demo table: three guaranteed flows, the last one shaped, plus the default flow.
fn demo_config() -> CszConfig {
    CszConfig::default()
        .with_flow(1, FlowParams::new(Rate::from_ratio(4, 10), 256 * 1024))
        .with_flow(2, FlowParams::new(Rate::from_ratio(2, 10), 256 * 1024))
        .with_flow(
            3,
            FlowParams::new(Rate::from_ratio(2, 10), 128 * 1024).with_shaper(ShaperConfig {
                rate: 500_000,
                burst: 16 * 1024,
            }),
        )
}

/// Flood the link with a repeating mix of packet sizes on every demo selector.
///
/// The bounded channel provides back-pressure, so generators never outrun the link by more than
/// the channel capacity.
fn spawn_generator(
    tx: Sender<Packet>,
    selectors: Vec<FlowSelector>,
    running: Arc<AtomicBool>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("traffic-gen".to_string())
        .spawn(move || {
            const SIZES: [usize; 4] = [64, 512, 1024, MAX_PACKET_SIZE];
            let mut sequence = 0usize;
            while running.load(Ordering::Relaxed) {
                let selector = selectors[sequence % selectors.len()];
                let len = SIZES[(sequence / selectors.len()) % SIZES.len()];
                match tx.send_timeout(Packet::zeroed(selector, len), Duration::from_millis(100)) {
                    Ok(()) => sequence += 1,
                    Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => {}
                    Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => break,
                }
            }
        })
}

/// Count delivered bytes and sojourn time per flow slot.
fn spawn_sink(
    rx: Receiver<Packet>,
) -> std::io::Result<std::thread::JoinHandle<Vec<(u64, Duration)>>> {
    std::thread::Builder::new()
        .name("egress-sink".to_string())
        .spawn(move || {
            let mut per_flow = vec![(0u64, Duration::ZERO); 16];
            for packet in rx {
                let slot = &mut per_flow[packet.selector.flow_id().index()];
                slot.0 += packet.payload().len() as u64;
                slot.1 += packet.timestamp.elapsed();
            }
            per_flow
        })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = parse_cli_options();

    let mut config = match &options.config {
        Some(path) => CszConfig::from_path(path)?,
        None => demo_config(),
    };
    if let Some(link_rate) = options.link_rate {
        config.link_rate = link_rate;
    }
    let link_rate = config.link_rate;

    let mut selectors: Vec<FlowSelector> = config
        .guaranteed
        .iter()
        .filter_map(|flow| FlowId::new(flow.id).map(FlowSelector::Guaranteed))
        .collect();
    if config.default_flow.is_some() {
        selectors.extend(Band::ALL.into_iter().map(FlowSelector::Default));
    }
    if selectors.is_empty() {
        error!("configuration has no flows to generate traffic for");
        return Ok(());
    }

    let scheduler: CszScheduler<Packet> = CszScheduler::new(config, MonotonicClock::new())?;
    let qdisc = Arc::new(Mutex::new(scheduler));

    let (ingress_tx, ingress_rx) = crossbeam_channel::bounded(1024);
    let (egress_tx, egress_rx) = crossbeam_channel::unbounded();

    let driver = LinkDriver::new(qdisc.clone(), ingress_rx, egress_tx, link_rate)?;
    let running = driver.running();
    let link_stats = driver.stats();

    let shutdown = running.clone();
    ctrlc::set_handler(move || {
        shutdown.store(false, Ordering::Relaxed);
    })?;

    let generator = spawn_generator(ingress_tx, selectors, running.clone())?;
    let sink = spawn_sink(egress_rx)?;

    let rt = tokio::runtime::Runtime::new()?;
    let link = rt.spawn(driver.run());

    info!(link_rate, "running, press Ctrl+C to stop");
    let started = Instant::now();
    let mut last_report = Instant::now();
    while running.load(Ordering::Relaxed) {
        if options.duration.is_some_and(|limit| started.elapsed() >= limit) {
            running.store(false, Ordering::Relaxed);
            break;
        }
        if last_report.elapsed() >= Duration::from_secs(1) {
            let stats = qdisc.lock().stats();
            match stats.to_json() {
                Ok(json) => println!("{json}"),
                Err(e) => warn!("failed to encode statistics: {e}"),
            }
            last_report = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let final_link = rt.block_on(link)??;
    if generator.join().is_err() {
        warn!("traffic generator panicked");
    }
    qdisc.lock().reset();

    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
    info!(
        transmitted = final_link.transmitted_packets,
        rejected = final_link.rejected,
        received = link_stats.lock().received,
        "link stopped"
    );
    // The driver held the only egress sender, so the sink has drained.
    match sink.join() {
        Ok(per_flow) => {
            for (slot, (bytes, sojourn)) in per_flow.iter().enumerate() {
                if *bytes > 0 {
                    info!(
                        flow = slot,
                        throughput_bps = (*bytes as f64 / elapsed) as u64,
                        total_sojourn_ms = sojourn.as_millis() as u64,
                        "delivered"
                    );
                }
            }
        }
        Err(_) => warn!("egress sink panicked"),
    }
    Ok(())
}
