// BWMAN LATENCY PROBE
// BACKGROUND THREAD THAT POLLS A WORKLOAD'S LATENCY ORACLE OVER TCP AND
// PUBLISHES THE FRESHEST VALUE THROUGH AN ATOMIC CELL. ONE PROBE PER
// ORACLE; THE CONTROLLER THREAD ONLY EVER READS.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::policy;

const POLL_PERIOD: Duration = policy::MONITOR_PERIOD;
const RETRY_PERIOD: Duration = Duration::from_millis(200);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

// HOW THE ORACLE REPORTS LATENCY ON THE WIRE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    // VALUE IS ALREADY IN THE SLO'S UNIT
    Micros,
    // NANOSECONDS, CONVERTED TO MILLISECONDS AND CEILED TO TWO DECIMALS
    NanosToMillis,
}

impl Unit {
    pub fn convert(&self, raw: f64) -> f64 {
        match self {
            Unit::Micros => raw,
            Unit::NanosToMillis => (raw / 1e6 * 100.0).ceil() / 100.0,
        }
    }
}

// f64 STORED AS BITS. SINGLE WRITER (PROBE THREAD), SINGLE READER
// (CONTROLLER), SO RELAXED ORDERING IS ENOUGH.
struct LatestCell(AtomicU64);

impl LatestCell {
    fn new() -> Self {
        Self(AtomicU64::new(0.0f64.to_bits()))
    }
    fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

struct ProbeShared {
    latest: LatestCell,
    samples: Mutex<Vec<f64>>,
    soft_violations: AtomicU64,
    hard_violations: AtomicU64,
}

pub struct ProbeStats {
    pub samples: Vec<f64>,
    pub soft_violations: u64,
    pub hard_violations: u64,
}

pub struct LatencyProbe {
    shared: Arc<ProbeShared>,
    target: f64,
}

impl LatencyProbe {
    // SPAWNS THE POLLING THREAD. THE THREAD EXITS WHEN shutdown FLIPS;
    // IT IS DETACHED AND OWNS NO STATE THE CONTROLLER NEEDS TO JOIN ON.
    pub fn spawn(
        server: &str,
        port: u16,
        unit: Unit,
        target: f64,
        slack_up: f64,
        shutdown: &'static AtomicBool,
    ) -> Self {
        let shared = Arc::new(ProbeShared {
            latest: LatestCell::new(),
            samples: Mutex::new(Vec::new()),
            soft_violations: AtomicU64::new(0),
            hard_violations: AtomicU64::new(0),
        });
        let worker = Arc::clone(&shared);
        let addr = format!("{}:{}", server, port);

        std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match poll_once(&addr, unit) {
                    Ok(latency) => {
                        worker.latest.store(latency);
                        if let Ok(mut samples) = worker.samples.lock() {
                            samples.push(latency);
                        }
                        if latency > 0.0 {
                            let slack = policy::slack(target, latency);
                            if slack <= slack_up {
                                worker.soft_violations.fetch_add(1, Ordering::Relaxed);
                            }
                            if latency > target {
                                worker.hard_violations.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        std::thread::sleep(POLL_PERIOD);
                    }
                    Err(_) => {
                        // KEEP THE PREVIOUS READING, BACK OFF, RETRY
                        std::thread::sleep(RETRY_PERIOD);
                    }
                }
            }
        });

        Self { shared, target }
    }

    // FRESHEST ORACLE READING; 0.0 MEANS NO DATA YET
    pub fn latest(&self) -> f64 {
        self.shared.latest.load()
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn stats(&self) -> ProbeStats {
        let samples = self
            .shared
            .samples
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        ProbeStats {
            samples,
            soft_violations: self.shared.soft_violations.load(Ordering::Relaxed),
            hard_violations: self.shared.hard_violations.load(Ordering::Relaxed),
        }
    }
}

// ONE CONNECT-READ-PARSE CYCLE AGAINST THE ORACLE. THE ORACLE WRITES A
// SHORT TEXT PAYLOAD WHOSE LAST WHITESPACE-SEPARATED TOKEN IS THE
// LATENCY FIGURE.
fn poll_once(addr: &str, unit: Unit) -> Result<f64> {
    let sockaddr = addr
        .to_socket_addrs()
        .with_context(|| format!("resolving {}", addr))?
        .next()
        .with_context(|| format!("no address for {}", addr))?;
    let mut stream = TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT)
        .with_context(|| format!("connecting to {}", addr))?;
    stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;

    let mut payload = String::new();
    stream.read_to_string(&mut payload)?;

    let token = match payload.split_whitespace().last() {
        Some(t) => t,
        None => bail!("empty oracle payload from {}", addr),
    };
    let raw: f64 = token
        .parse()
        .with_context(|| format!("unparseable oracle payload {:?}", token))?;
    Ok(unit.convert(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_convert_ceils_to_two_decimals() {
        assert!((Unit::NanosToMillis.convert(1_234_567.0) - 1.24).abs() < 1e-9);
        assert!((Unit::NanosToMillis.convert(1_000_000.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn micros_passes_through() {
        assert_eq!(Unit::Micros.convert(812.5), 812.5);
    }

    #[test]
    fn latest_cell_round_trips() {
        let cell = LatestCell::new();
        assert_eq!(cell.load(), 0.0);
        cell.store(1234.56);
        assert_eq!(cell.load(), 1234.56);
    }
}
