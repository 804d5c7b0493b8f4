// BWMAN STALL-RATE SAMPLER
// READS STALLED-CYCLES-BACKEND PER MONITORED CORE THROUGH perf_event_open
// AND NORMALIZES BY ELAPSED TSC CYCLES. STALL RATE IS THE COARSE PROXY
// USED TO COMPARE MEMORY PRESSURE BEFORE AND AFTER AN ACTUATION.

use anyhow::{bail, Context, Result};

// perf_event_attr SUBSET, FIXED LAYOUT PER THE KERNEL ABI. ONLY THE
// FIELDS WE SET ARE NAMED; THE REST STAY ZEROED.
#[repr(C)]
#[derive(Clone, Copy)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    _reserved: u16,
    aux_sample_size: u32,
    _reserved2: u32,
    sig_data: u64,
}

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 7;
const PERF_FLAG_DISABLED: u64 = 1; // attr.flags BIT 0
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;

fn perf_event_open(attr: &PerfEventAttr, pid: libc::pid_t, cpu: libc::c_int) -> Result<libc::c_int> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            -1 as libc::c_int, // NO GROUP
            0 as libc::c_ulong,
        )
    };
    if fd < 0 {
        bail!(
            "perf_event_open failed on cpu {}: {} (check perf_event_paranoid)",
            cpu,
            std::io::Error::last_os_error()
        );
    }
    Ok(fd as libc::c_int)
}

fn read_tsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

struct StallCounter {
    fd: libc::c_int,
    cpu: u32,
}

impl StallCounter {
    fn open(cpu: u32) -> Result<Self> {
        let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
        attr.type_ = PERF_TYPE_HARDWARE;
        attr.size = std::mem::size_of::<PerfEventAttr>() as u32;
        attr.config = PERF_COUNT_HW_STALLED_CYCLES_BACKEND;
        attr.flags = PERF_FLAG_DISABLED;
        // CPU-WIDE COUNTER, NOT TASK-BOUND
        let fd = perf_event_open(&attr, -1, cpu as libc::c_int)?;
        Ok(Self { fd, cpu })
    }

    fn ioctl(&self, req: libc::c_ulong) -> Result<()> {
        let rc = unsafe { libc::ioctl(self.fd, req, 0) };
        if rc < 0 {
            bail!(
                "perf ioctl {:#x} failed on cpu {}: {}",
                req,
                self.cpu,
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }

    fn read_value(&self) -> Result<u64> {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            bail!(
                "short perf read on cpu {}: {}",
                self.cpu,
                std::io::Error::last_os_error()
            );
        }
        Ok(value)
    }
}

impl Drop for StallCounter {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

pub struct StallRateSampler {
    counters: Vec<StallCounter>,
    prev_stalls: Vec<u64>,
    prev_tsc: u64,
}

impl StallRateSampler {
    // ONE COUNTER PER MONITORED CORE. THE CONTROLLER NEEDS AT LEAST ONE
    // HP CORE AND ONE BE CORE TO COMPARE.
    pub fn new(cores: &[u32]) -> Result<Self> {
        if cores.len() < 2 {
            bail!("need at least two monitored cores, got {}", cores.len());
        }
        let mut counters = Vec::with_capacity(cores.len());
        for &cpu in cores {
            counters.push(
                StallCounter::open(cpu)
                    .with_context(|| format!("opening stall counter on core {}", cpu))?,
            );
        }
        let prev_stalls = vec![0; counters.len()];
        let mut sampler = Self {
            counters,
            prev_stalls,
            prev_tsc: read_tsc(),
        };
        for c in &sampler.counters {
            c.ioctl(PERF_EVENT_IOC_ENABLE)?;
        }
        // PRIME BASELINES SO THE FIRST SAMPLE COVERS A REAL WINDOW
        for (i, c) in sampler.counters.iter().enumerate() {
            sampler.prev_stalls[i] = c.read_value()?;
        }
        sampler.prev_tsc = read_tsc();
        Ok(sampler)
    }

    pub fn num_cores(&self) -> usize {
        self.counters.len()
    }

    // ONE STALL-RATE SNAPSHOT PER CORE SINCE THE PREVIOUS CALL. COUNTERS
    // ARE PAUSED DURING THE READ SO ALL CORES SEE THE SAME WINDOW.
    pub fn sample(&mut self) -> Result<Vec<f64>> {
        for c in &self.counters {
            c.ioctl(PERF_EVENT_IOC_DISABLE)?;
        }
        let tsc = read_tsc();
        let elapsed = tsc.saturating_sub(self.prev_tsc).max(1) as f64;

        let mut rates = Vec::with_capacity(self.counters.len());
        for (i, c) in self.counters.iter().enumerate() {
            let stalls = c.read_value()?;
            let delta = stalls.saturating_sub(self.prev_stalls[i]) as f64;
            rates.push(delta / elapsed);
            self.prev_stalls[i] = stalls;
        }
        self.prev_tsc = tsc;

        for c in &self.counters {
            c.ioctl(PERF_EVENT_IOC_ENABLE)?;
        }
        Ok(rates)
    }

    // TRIMMED MEAN OVER n SAMPLES TAKEN interval APART. THE FIRST SAMPLE
    // IS A WARM-UP AND IS DISCARDED.
    pub fn average(
        &mut self,
        n: usize,
        interval: std::time::Duration,
        trim: usize,
    ) -> Result<Vec<f64>> {
        validate_trim(n, trim)?;
        self.sample()?; // WARM-UP
        std::thread::sleep(interval);

        let cores = self.counters.len();
        let mut per_core: Vec<Vec<f64>> = vec![Vec::with_capacity(n); cores];
        for i in 0..n {
            let rates = self.sample()?;
            for (core, r) in rates.into_iter().enumerate() {
                per_core[core].push(r);
            }
            if i + 1 < n {
                std::thread::sleep(interval);
            }
        }
        Ok(per_core.iter().map(|s| trim_mean(s, trim)).collect())
    }
}

// AT LEAST ONE SAMPLE MUST SURVIVE THE TRIM ON BOTH SIDES
pub fn validate_trim(n: usize, trim: usize) -> Result<()> {
    if n == 0 || 2 * trim >= n {
        bail!("degenerate trim: n={} trim={}", n, trim);
    }
    Ok(())
}

// MEAN AFTER DROPPING trim LOWEST AND trim HIGHEST SAMPLES.
// CALLER GUARANTEES samples.len() > 2 * trim.
pub fn trim_mean(samples: &[f64], trim: usize) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let kept = &sorted[trim..sorted.len() - trim];
    kept.iter().sum::<f64>() / kept.len() as f64
}
