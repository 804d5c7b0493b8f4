// BWMAN DECISION LOG
// RECORDS ONE SNAPSHOT PER CONTROLLER DECISION. PRE-ALLOCATED RING
// BUFFER. NO HEAP ALLOCATION DURING MONITORING.
// WRAPS AROUND AT CAPACITY -- OLDEST ENTRIES OVERWRITTEN.

use std::io::Write;

use anyhow::{Context, Result};

use crate::probe::ProbeStats;

const MAX_RECORDS: usize = 8192;

pub const RESULTS_LOG: &str = "bwman_results_log.txt";
pub const HP_LATENCY_LOG: &str = "hp_latency_log.txt";
pub const BE_LATENCY_LOG: &str = "be_latency_log.txt";

#[derive(Clone)]
pub struct LogRecord {
    pub ts_ns:      u64,
    pub counter:    u64,
    pub ratio:      u32,
    pub mba_level:  u32,
    pub target_slo: f64,
    pub latency:    f64,
    pub slack:      f64,
    pub latency2:   f64,
    pub slack2:     f64,
    pub stall_hp:   f64,
    pub stall_be:   f64,
    pub action:     &'static str,
}

impl LogRecord {
    fn empty() -> Self {
        Self {
            ts_ns: 0,
            counter: 0,
            ratio: 0,
            mba_level: 0,
            target_slo: 0.0,
            latency: 0.0,
            slack: 0.0,
            latency2: 0.0,
            slack2: 0.0,
            stall_hp: 0.0,
            stall_be: 0.0,
            action: "",
        }
    }
}

pub struct DecisionLog {
    records: Vec<LogRecord>,
    head:    usize,
    len:     usize,
    counter: u64,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self {
            records: vec![LogRecord::empty(); MAX_RECORDS],
            head: 0,
            len: 0,
            counter: 0,
        }
    }

    // RECORD ONE DECISION. OVERWRITES OLDEST ENTRY WHEN FULL.
    pub fn record(&mut self, mut rec: LogRecord) {
        rec.ts_ns = now_ns();
        rec.counter = self.counter;
        self.counter += 1;
        self.records[self.head] = rec;
        self.head = (self.head + 1) % MAX_RECORDS;
        if self.len < MAX_RECORDS {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // ITERATE RECORDS IN CHRONOLOGICAL ORDER
    fn iter_chronological(&self) -> impl Iterator<Item = &LogRecord> {
        let start = if self.len < MAX_RECORDS { 0 } else { self.head };
        (0..self.len).map(move |i| &self.records[(start + i) % MAX_RECORDS])
    }

    // DUMP THE DECISION TIME SERIES AFTER EXECUTION
    pub fn dump(&self) {
        if self.len == 0 {
            return;
        }

        let mut iter = self.iter_chronological();
        let first = iter.next().unwrap();
        let base_ts = first.ts_ns;

        println!("\n{:<7} {:<9} {:<6} {:<5} {:<10} {:<8} {:<10} {:<8} {:<10} {:<10} {:<18}",
            "N", "TIME_S", "RATIO", "MBA", "LAT", "SLACK", "LAT2", "SLACK2",
            "STALL_HP", "STALL_BE", "ACTION");
        println!("{}", "-".repeat(106));

        print_row(first, 0.0);
        for r in iter {
            let elapsed_s = (r.ts_ns - base_ts) as f64 / 1_000_000_000.0;
            print_row(r, elapsed_s);
        }

        if self.len == MAX_RECORDS {
            println!("\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} RECORDS)", MAX_RECORDS);
        }
        println!("TOTAL RECORDS: {}", self.len);
    }

    // SUMMARY AFTER EXECUTION. PROBE STATS CARRY THE FULL SAMPLE
    // HISTORY; THE RING ONLY HOLDS DECISIONS.
    pub fn summary(&self, hp: &ProbeStats, be: Option<&ProbeStats>) {
        println!("\n{}", "=".repeat(50));
        println!("BWMAN SUMMARY");
        println!("{}", "=".repeat(50));

        if let Some(last) = self.iter_chronological().last() {
            println!("  FINAL RATIO:       {}", last.ratio);
            println!("  FINAL MBA LEVEL:   {}", last.mba_level);
        }
        println!("  DECISIONS:         {}", self.len);

        print_probe_summary("HP", hp);
        if let Some(be) = be {
            print_probe_summary("BE", be);
        }

        if self.len >= 2 {
            let records: Vec<&LogRecord> = self.iter_chronological().collect();
            let elapsed_ns = records.last().unwrap().ts_ns - records.first().unwrap().ts_ns;
            println!("  ELAPSED:           {:.1}s", elapsed_ns as f64 / 1_000_000_000.0);
        }
    }

    // APPEND THE RUN TO THE RESULTS LOG AND DUMP PER-SAMPLE LATENCIES.
    // CALLED ONCE AT SHUTDOWN.
    pub fn write_artifacts(&self, hp: &ProbeStats, be: Option<&ProbeStats>) -> Result<()> {
        let mut results = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(RESULTS_LOG)
            .with_context(|| format!("opening {}", RESULTS_LOG))?;
        let (ratio, mba) = self
            .iter_chronological()
            .last()
            .map(|r| (r.ratio, r.mba_level))
            .unwrap_or((0, 0));
        writeln!(
            results,
            "soft:\t{}\thard:\t{}\tratio:\t{}\tmba:\t{}\tsamples:\t{}",
            hp.soft_violations,
            hp.hard_violations,
            ratio,
            mba,
            hp.samples.len()
        )?;

        write_samples(HP_LATENCY_LOG, &hp.samples)?;
        if let Some(be) = be {
            write_samples(BE_LATENCY_LOG, &be.samples)?;
        }
        Ok(())
    }
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new()
    }
}

fn print_row(r: &LogRecord, elapsed_s: f64) {
    println!("{:<7} {:<9.1} {:<6} {:<5} {:<10.2} {:<8.3} {:<10.2} {:<8.3} {:<10.4} {:<10.4} {:<18}",
        r.counter, elapsed_s, r.ratio, r.mba_level, r.latency, r.slack,
        r.latency2, r.slack2, r.stall_hp, r.stall_be, r.action);
}

fn print_probe_summary(label: &str, stats: &ProbeStats) {
    println!("  {} SAMPLES:        {}", label, stats.samples.len());
    println!("  {} SOFT VIOLATIONS: {}", label, stats.soft_violations);
    println!("  {} HARD VIOLATIONS: {}", label, stats.hard_violations);
    if !stats.samples.is_empty() {
        let sum: f64 = stats.samples.iter().sum();
        let peak = stats.samples.iter().cloned().fold(f64::MIN, f64::max);
        println!("  {} AVG LATENCY:    {:.2}", label, sum / stats.samples.len() as f64);
        println!("  {} PEAK LATENCY:   {:.2}", label, peak);
    }
}

fn write_samples(path: &str, samples: &[f64]) -> Result<()> {
    let mut f = std::fs::File::create(path).with_context(|| format!("creating {}", path))?;
    for s in samples {
        writeln!(f, "{}", s)?;
    }
    Ok(())
}

fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(ratio: u32, action: &'static str) -> LogRecord {
        LogRecord {
            ts_ns: 0,
            counter: 0,
            ratio,
            mba_level: 100,
            target_slo: 1000.0,
            latency: 800.0,
            slack: 0.2,
            latency2: 0.0,
            slack2: 0.0,
            stall_hp: 0.01,
            stall_be: 0.4,
            action,
        }
    }

    #[test]
    fn record_appends() {
        let mut log = DecisionLog::new();
        assert_eq!(log.len(), 0);

        log.record(rec(50, "hold"));
        log.record(rec(60, "apply-ratio"));
        assert_eq!(log.len(), 2);
        assert_eq!(log.records[0].ratio, 50);
        assert_eq!(log.records[0].action, "hold");
        assert!(log.records[0].ts_ns > 0);
        // COUNTER IS MONOTONIC ACROSS WRAPS
        assert_eq!(log.records[0].counter, 0);
        assert_eq!(log.records[1].counter, 1);
    }

    #[test]
    fn ring_buffer_wraps() {
        let mut log = DecisionLog::new();
        for i in 0..MAX_RECORDS {
            log.record(rec(i as u32 % 101, "fill"));
        }
        assert_eq!(log.len(), MAX_RECORDS);
        assert_eq!(log.head, 0); // WRAPPED BACK TO START

        log.record(rec(99, "newest"));
        assert_eq!(log.len(), MAX_RECORDS);
        assert_eq!(log.head, 1);
        assert_eq!(log.records[0].action, "newest");

        let ordered: Vec<&'static str> =
            log.iter_chronological().map(|r| r.action).collect();
        assert_eq!(*ordered.last().unwrap(), "newest");
        assert_eq!(ordered.len(), MAX_RECORDS);
    }

    #[test]
    fn summary_no_panic_empty() {
        let log = DecisionLog::new();
        let stats = ProbeStats {
            samples: Vec::new(),
            soft_violations: 0,
            hard_violations: 0,
        };
        log.summary(&stats, None); // SHOULD NOT PANIC WITH 0 RECORDS
    }

    #[test]
    fn dump_no_panic() {
        let mut log = DecisionLog::new();
        log.record(rec(50, "apply_ratio-50"));
        log.record(rec(60, "apply_ratio-60"));
        log.dump(); // SHOULD NOT PANIC
    }
}
