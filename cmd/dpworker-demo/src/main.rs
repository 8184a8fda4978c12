//! dpworker demo server
//!
//! Receives 48-byte request records over UDP, runs each as a preemptible
//! job, and echoes the record back to the sender once the job finishes.
//! The kernel socket stands in for a NIC queue: every datagram is wrapped
//! in an Ethernet/IPv4/UDP frame before it enters the engine.
//!
//! Usage:
//!     cargo build --release -p dpworker-demo
//!     ./target/release/dpworker-demo [port] [workers] [spin|kv]
//!
//! Tuning comes from the environment (DPW_TIME_SLICE_US, DPW_PREEMPTION,
//! DPW_PIN_WORKERS, DPW_LOG_LEVEL, ...). Ctrl-C prints counters and exits.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{signal, SigHandler, Signal};

use dpworker::{
    build_udp_frame, AppWork, EngineConfig, IpTuple, KvWork, Outcome, Runtime, RuntimeError,
    RuntimeStats, SpinWork, UdpTransport,
};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_sig: i32) {
    RUNNING.store(false, Ordering::Relaxed);
}

const FRAME_CAP: usize = 2048;
const KV_KEYS: u64 = 100_000;
const KV_VALUE_LEN: usize = 64;

fn app(name: &str) -> Option<Arc<dyn AppWork>> {
    match name {
        "spin" => Some(Arc::new(SpinWork::new())),
        "kv" => Some(Arc::new(KvWork::with_entries(KV_KEYS, KV_VALUE_LEN))),
        _ => None,
    }
}

fn print_stats(stats: &RuntimeStats, elapsed: Duration) {
    for (i, w) in stats.workers.iter().enumerate() {
        log::info!(
            "worker {}: envelopes={} finished={} preempted={} malformed={} replies={} send_failures={} panics={} deferred={}",
            i,
            w.envelopes,
            w.finished,
            w.preempted,
            w.malformed,
            w.replies,
            w.send_failures,
            w.panics,
            w.deferred
        );
    }
    let d = &stats.dispatch;
    let total = stats.total();
    let secs = elapsed.as_secs_f64().max(1e-9);
    log::info!(
        "dispatch: dispatched={} finished={} preempted={} slice_expiries={} dropped={}",
        d.dispatched,
        d.finished,
        d.preempted,
        d.slice_expiries,
        stats.dropped
    );
    log::info!(
        "total: {} requests in {:.1}s ({:.0} req/s)",
        total.finished,
        secs,
        total.finished as f64 / secs
    );
}

fn serve(port: u16, workers: usize, work: Arc<dyn AppWork>) -> Result<(), RuntimeError> {
    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let transport = match UdpTransport::bind(bind) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            log::error!("bind {} failed: {}", bind, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = transport.socket().set_read_timeout(Some(Duration::from_millis(100))) {
        log::warn!("set_read_timeout failed: {}", e);
    }

    let config = EngineConfig::from_env().num_workers(workers);
    let mut runtime = Runtime::start(config, work, transport.clone(), |_: usize, _: &Outcome| {})?;
    log::info!("dpworker-demo: listening on {} with {} workers", bind, workers);

    let local = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
    let mut datagram = [0u8; FRAME_CAP];
    let mut frame = [0u8; FRAME_CAP];
    let start = Instant::now();
    let mut class = 0u32;

    while RUNNING.load(Ordering::Relaxed) {
        let (n, peer) = match transport.socket().recv_from(&mut datagram) {
            Ok(r) => r,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) => {
                log::warn!("recv failed: {}", e);
                continue;
            }
        };
        let SocketAddr::V4(peer) = peer else {
            continue;
        };

        let tuple = IpTuple::from_addrs(peer, local);
        let len = match build_udp_frame(&tuple, &datagram[..n], &mut frame) {
            Ok(len) => len,
            Err(e) => {
                log::debug!("dropping datagram from {}: {}", peer, e);
                continue;
            }
        };
        match runtime.submit_frame(&frame[..len], class) {
            Ok(()) => class = class.wrapping_add(1),
            Err(e) => log::debug!("dropping request from {}: {}", peer, e),
        }
    }

    log::info!("dpworker-demo: shutting down");
    runtime.shutdown()?;
    print_stats(&runtime.stats(), start.elapsed());
    Ok(())
}

fn main() {
    dpworker::init_logging();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9000);
    let workers: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1);
    let app_name = args.get(3).map(String::as_str).unwrap_or("spin");

    let Some(work) = app(app_name) else {
        log::error!("unknown app '{}' (expected spin or kv)", app_name);
        std::process::exit(2);
    };

    // Safety: the handler only stores to an atomic
    unsafe {
        if let Err(e) = signal(Signal::SIGINT, SigHandler::Handler(handle_sigint)) {
            log::warn!("installing SIGINT handler failed: {}", e);
        }
        if let Err(e) = signal(Signal::SIGTERM, SigHandler::Handler(handle_sigint)) {
            log::warn!("installing SIGTERM handler failed: {}", e);
        }
    }

    if let Err(e) = serve(port, workers, work) {
        log::error!("dpworker-demo: {}", e);
        std::process::exit(1);
    }
}
