//! Broker daemon
//!
//! Usage:
//!   membus-broker [--socket /tmp/membus.sock] [--shm-dir /dev/shm]
//!
//! Logging follows RUST_LOG, defaulting to `membus=info`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use membus::broker::{Broker, BrokerConfig};
use membus::mux::MuxWaker;
use membus::shm::{RegionLayout, SlotKind};

#[derive(Parser, Debug)]
#[command(version, about = "Message broker for the robot process bus", long_about = None)]
struct Args {
    #[arg(long, default_value = membus::protocol::DEFAULT_SOCKET_PATH, help = "Unix socket to listen on")]
    socket: PathBuf,

    #[arg(long, default_value = membus::protocol::DEFAULT_SHM_DIR, help = "Directory for the shared region file")]
    shm_dir: PathBuf,

    #[arg(long, value_parser = parse_hex, help = "Fixed region id in hex (random if omitted)")]
    region_id: Option<u32>,

    #[arg(long, default_value_t = 1000, help = "Broker_Stats interval in milliseconds")]
    stats_interval_ms: u64,

    #[arg(long, help = "Give up on a member's auth exchange after this many milliseconds")]
    handshake_timeout_ms: Option<u64>,

    #[arg(long, help = "Bound blocking sends to this many milliseconds")]
    write_timeout_ms: Option<u64>,

    #[arg(long, help = "Camera slots as COUNT:BYTES")]
    camera_slots: Option<SlotArg>,

    #[arg(long, help = "Processed binary slots as COUNT:BYTES")]
    binary_slots: Option<SlotArg>,

    #[arg(long, help = "Top-down slots as COUNT:BYTES")]
    top_down_slots: Option<SlotArg>,
}

#[derive(Debug, Clone, Copy)]
struct SlotArg {
    count: u32,
    bytes: u32,
}

impl std::str::FromStr for SlotArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, bytes) = s
            .split_once(':')
            .ok_or_else(|| format!("expected COUNT:BYTES, got '{}'", s))?;
        Ok(Self {
            count: count.parse().map_err(|e| format!("bad slot count: {}", e))?,
            bytes: bytes.parse().map_err(|e| format!("bad slot size: {}", e))?,
        })
    }
}

fn parse_hex(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

impl Args {
    fn into_config(self) -> BrokerConfig {
        let mut layout = RegionLayout::default();
        for (kind, arg) in [
            (SlotKind::Camera, self.camera_slots),
            (SlotKind::ProcessedBinary, self.binary_slots),
            (SlotKind::TopDown, self.top_down_slots),
        ] {
            if let Some(arg) = arg {
                layout = layout.slots(kind, arg.count, arg.bytes);
            }
        }

        let mut config = BrokerConfig::with_socket(&self.socket)
            .shm_dir(&self.shm_dir)
            .layout(layout)
            .stats_interval(Duration::from_millis(self.stats_interval_ms));
        if let Some(id) = self.region_id {
            config = config.region_id(id);
        }
        if let Some(ms) = self.handshake_timeout_ms {
            config = config.handshake_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.write_timeout_ms {
            config = config.write_timeout(Duration::from_millis(ms));
        }
        config
    }
}

/// Set `stop` and wake the broker on SIGINT or SIGTERM
fn spawn_signal_thread(stop: Arc<AtomicBool>, waker: MuxWaker) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            runtime.block_on(async {
                let mut terminate =
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                        Ok(signal) => signal,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to install SIGTERM handler");
                            return;
                        }
                    };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Interrupt received"),
                    _ = terminate.recv() => tracing::info!("Terminate received"),
                }
            });
            stop.store(true, Ordering::Release);
            if let Err(e) = waker.wake() {
                tracing::error!(error = %e, "Failed to wake broker");
            }
        })?;
    Ok(())
}

fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("membus=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Args::parse().into_config();
    let mut broker = match Broker::bind(config) {
        Ok(broker) => broker,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start broker");
            std::process::exit(1);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    if let Err(e) = spawn_signal_thread(Arc::clone(&stop), broker.waker()) {
        tracing::error!(error = %e, "Failed to start signal handler");
        std::process::exit(1);
    }

    if let Err(e) = broker.run_until(|| stop.load(Ordering::Acquire)) {
        tracing::error!(error = %e, "Broker stopped on fatal error");
        drop(broker);
        std::process::exit(2);
    }
}
