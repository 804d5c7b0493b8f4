// BWMAN ADAPTIVE CONTROLLER
// SINGLE STATE MACHINE DRIVING BOTH ACTUATORS. THE MONITOR LOOP READS
// THE LATENCY PROBES EVERY PERIOD; WHEN SLACK COLLAPSES IT THROTTLES
// THE BE WORKLOAD WITH MBA, STEERS PAGES TOWARD THE HP SIDE UNTIL THE
// SLO RECOVERS, THEN HANDS BANDWIDTH BACK TO BE ONE LEVEL AT A TIME.
//
// ALL CONTROLLER STATE LIVES IN ControllerState AND IS OWNED HERE.
// NOTHING IN THIS MODULE IS GLOBAL.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};

use crate::mba::MbaDriver;
use crate::placement::PagePlacementEngine;
use crate::policy::{self, ControllerConfig, EpisodeAction, Mode, Region};
use crate::probe::LatencyProbe;
use crate::record::{DecisionLog, LogRecord};
use crate::segments::MemorySegment;
use crate::stall::StallRateSampler;
use crate::weights::WeightTable;

// STALL AVERAGING: SAMPLES PER MEASUREMENT AND TAIL TRIM ON EACH SIDE
const STALL_SAMPLES: usize = 10;
const STALL_TRIM: usize = 2;

// WHETHER A RELEASE WALK RAN TO COMPLETION OR HAD TO UNDO ITS LAST STEP
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ReleaseOutcome {
    Complete,
    Reverted,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerState {
    pub ratio:     u32,
    pub mba_level: u32,
    pub latency:   f64,
    pub slack:     f64,
    pub latency2:  f64,
    pub slack2:    f64,
    pub stall_hp:  f64,
    pub stall_be:  f64,
    pub iter:      u64,
}

pub struct AdaptiveController<'a> {
    config:    ControllerConfig,
    state:     ControllerState,
    weights:   WeightTable,
    segments:  Vec<MemorySegment>,
    placement: PagePlacementEngine,
    mba:       Option<MbaDriver>,
    sampler:   StallRateSampler,
    probe:     LatencyProbe,
    probe2:    Option<LatencyProbe>,
    log:       DecisionLog,
    shutdown:  &'a AtomicBool,
}

impl<'a> AdaptiveController<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ControllerConfig,
        weights: WeightTable,
        segments: Vec<MemorySegment>,
        placement: PagePlacementEngine,
        mba: Option<MbaDriver>,
        sampler: StallRateSampler,
        probe: LatencyProbe,
        probe2: Option<LatencyProbe>,
        initial_ratio: u32,
        shutdown: &'a AtomicBool,
    ) -> Self {
        let mba_level = mba.as_ref().map(|m| m.current()).unwrap_or(policy::MBA_MAX);
        Self {
            config,
            state: ControllerState {
                ratio: initial_ratio,
                mba_level,
                latency: 0.0,
                slack: 0.0,
                latency2: 0.0,
                slack2: 0.0,
                stall_hp: 0.0,
                stall_be: 0.0,
                iter: 0,
            },
            weights,
            segments,
            placement,
            mba,
            sampler,
            probe,
            probe2,
            log: DecisionLog::new(),
            shutdown,
        }
    }

    pub fn final_state(&self) -> ControllerState {
        self.state
    }

    // TEAR THE CONTROLLER APART FOR THE SHUTDOWN PATH: THE LOG AND
    // PROBES OUTLIVE THE RUN, AND THE MBA DRIVER STILL NEEDS ITS RESET.
    pub fn into_parts(
        self,
    ) -> (
        DecisionLog,
        LatencyProbe,
        Option<LatencyProbe>,
        Option<MbaDriver>,
    ) {
        (self.log, self.probe, self.probe2, self.mba)
    }

    pub fn run(&mut self) -> Result<()> {
        match self.config.mode {
            Mode::FixedRatio => self.run_fixed_ratio(),
            Mode::Baseline => self.run_monitor_only(),
            Mode::MbaFloor => {
                self.apply_mba(policy::MBA_MIN)?;
                self.note("mba-floor");
                self.run_monitor_only()
            }
            Mode::Adaptive | Mode::PmOnly | Mode::MbaOnly => self.run_adaptive(),
        }
    }

    // --- MODE DRIVERS ---

    // MEASURE, PLACE AT THE REQUESTED RATIO, MEASURE AGAIN. USED FOR
    // OFFLINE CHARACTERIZATION OF A SINGLE OPERATING POINT.
    fn run_fixed_ratio(&mut self) -> Result<()> {
        self.measure_stalls()?;
        self.read_probes();
        self.note("before-placement");

        let table = self.weights.project_ratio(self.state.ratio)?;
        self.placement.place(&self.segments, &table)?;
        std::thread::sleep(self.config.settle_time);

        self.measure_stalls()?;
        self.read_probes();
        self.note("after-placement");
        Ok(())
    }

    // NO ACTUATION AT ALL. KEEPS THE DECISION LOG POPULATED SO RUNS ARE
    // COMPARABLE AGAINST THE ACTIVE MODES.
    fn run_monitor_only(&mut self) -> Result<()> {
        while !self.shutdown.load(Ordering::Relaxed) {
            self.read_probes();
            self.state.iter += 1;
            self.note_quiet("iteration");
            if self.state.iter % 50 == 0 {
                self.print_telemetry("observe");
            }
            std::thread::sleep(self.config.monitor_period);
        }
        Ok(())
    }

    fn run_adaptive(&mut self) -> Result<()> {
        while !self.shutdown.load(Ordering::Relaxed) {
            self.read_probes();
            self.state.iter += 1;
            self.note_quiet("iteration");

            if self.slo_violated() {
                self.note("slo-violation");
                self.adapt()?;
            } else if self.state.mba_level < policy::MBA_MAX
                && self.combined_region() == Region::Green
            {
                // RESIDUAL THROTTLE FROM AN EARLIER EPISODE WITH BOTH
                // WORKLOADS DEEP GREEN: HAND BANDWIDTH BACK
                self.note("mba-release-resume");
                self.release_mba()?;
            } else if self.state.iter % 50 == 0 {
                self.print_telemetry("observe");
            }
            std::thread::sleep(self.config.monitor_period);
        }
        Ok(())
    }

    // ONE ADAPTATION EPISODE. RUNS UNTIL THE SLO RECOVERS AND THE CAP IS
    // FULLY RELEASED, THE KNOBS ARE EXHAUSTED, OR SHUTDOWN.
    fn adapt(&mut self) -> Result<()> {
        match self.config.mode {
            Mode::PmOnly | Mode::MbaOnly => {
                if self.config.exhausted(self.state.ratio, self.state.mba_level) {
                    // NO KNOB LEFT TO TURN. KEEP MONITORING; DO NOT SPIN.
                    self.note("emergency-unrecoverable");
                    std::thread::sleep(self.config.settle_time);
                } else if self.config.mode == Mode::PmOnly {
                    self.migrate_toward_hp()?;
                } else {
                    self.search_optimal_mba()?;
                }
            }
            _ => {
                // CLAMP BE HARD FIRST SO HP RECOVERS FAST, THEN STEER
                // PAGES, THEN GIVE BANDWIDTH BACK.
                if self.config.can_throttle(self.state.ratio)
                    && self.state.mba_level != policy::MBA_MIN
                {
                    self.apply_mba(policy::MBA_MIN)?;
                    self.note("mba-clamp");
                    std::thread::sleep(self.config.settle_time);
                }
                self.run_episode()?;
            }
        }
        Ok(())
    }

    // THE EPISODE LOOP: RE-READ SLACKS EVERY PASS, MIGRATE ON DANGER,
    // RELEASE FROM GREEN, HOLD IN BETWEEN. ENDS WHEN THE CAP IS BACK AT
    // FULL BANDWIDTH (OR A RELEASE STEP HAD TO REVERT), SO THE BE
    // WORKLOAD IS NEVER LEFT THROTTLED WITHOUT A PATH OUT.
    fn run_episode(&mut self) -> Result<()> {
        while !self.shutdown.load(Ordering::Relaxed) {
            self.read_probes();
            self.state.iter += 1;
            self.note_quiet("iteration");

            let region = self.combined_region();
            match self
                .config
                .episode_step(region, self.state.ratio, self.state.mba_level)
            {
                EpisodeAction::Finished => return Ok(()),
                EpisodeAction::Emergency => {
                    self.note("emergency-unrecoverable");
                    return Ok(());
                }
                EpisodeAction::Migrate => self.migrate_toward_hp()?,
                EpisodeAction::Release => {
                    // A REVERTED WALK ENDS THE EPISODE; THE MONITOR LOOP
                    // RESUMES THE RELEASE ONCE SLACKS ARE GREEN AGAIN
                    if self.release_mba()? == ReleaseOutcome::Reverted {
                        return Ok(());
                    }
                }
                EpisodeAction::Hold => std::thread::sleep(self.config.monitor_period),
            }
        }
        Ok(())
    }

    // --- ACTUATION PRIMITIVES ---

    // STEP THE WEIGHT RATIO TOWARD THE HP SIDE UNTIL SLACK RECOVERS OR
    // THE RATIO IS EXHAUSTED. EACH STEP PLACES PAGES AND SETTLES.
    fn migrate_toward_hp(&mut self) -> Result<()> {
        if !self.config.enable_page_migration {
            return Ok(());
        }
        while !self.shutdown.load(Ordering::Relaxed) {
            let next = match policy::next_ratio_up(self.state.ratio, self.config.adaptation_step) {
                Some(r) => r,
                None => {
                    self.note("ratio-exhausted");
                    return Ok(());
                }
            };
            let table = self.weights.project_ratio(next)?;
            self.placement
                .place(&self.segments, &table)
                .with_context(|| format!("placing pages at ratio {}", next))?;
            self.state.ratio = next;
            self.note("apply-ratio");
            std::thread::sleep(self.config.settle_time);
            self.read_probes();

            // EITHER WORKLOAD CLIMBING BACK ABOVE THE SOFT THRESHOLD
            // ENDS THE WALK; BOTH ORACLES COUNT
            let hp = policy::slack_recovered(self.state.slack, self.state.latency, self.config.slack_up);
            let be = self.probe2.is_some()
                && policy::slack_recovered(self.state.slack2, self.state.latency2, self.config.slack_up);
            if hp || be {
                return Ok(());
            }
        }
        Ok(())
    }

    // BINARY SEARCH FOR THE HIGHEST MBA LEVEL THAT KEEPS HP WITHIN
    // TARGET * (1 + DELTA). USED BY THE MBA-ONLY MODE.
    fn search_optimal_mba(&mut self) -> Result<()> {
        if !self.config.enable_mba {
            return Ok(());
        }
        let bound = self.probe.target() * (1.0 + self.config.delta_hp);
        let mut previous = self.state.mba_level;
        let mut level = policy::MBA_SEARCH_START;

        while !self.shutdown.load(Ordering::Relaxed) {
            self.apply_mba(level)?;
            std::thread::sleep(self.config.settle_time);
            self.measure_stalls()?;
            self.read_probes();
            self.note("apply-mba");

            if self.state.latency == 0.0 {
                // ORACLE WENT SILENT MID-SEARCH. FALL BACK TO THE LAST
                // LEVEL THAT WAS DEFINITELY MEASURED.
                self.apply_mba(previous)?;
                self.note("mba-revert");
                return Ok(());
            }

            if self.state.latency <= bound {
                // HP IS WITHIN ITS RELAXED BOUND AT THIS LEVEL
                return Ok(());
            }
            // POSITIVE WHEN HP IS OVER TARGET, STEERING THE SEARCH TIGHTER
            let progress = self.state.latency - self.probe.target();
            match policy::mba_binary_search(level, progress) {
                Some(next) => {
                    previous = level;
                    level = next;
                }
                None => {
                    // SEARCH EXHAUSTED WITHOUT MEETING THE BOUND
                    self.apply_mba(previous)?;
                    self.note("mba-revert");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    // WALK THE MBA LEVEL BACK UP WHILE BOTH WORKLOADS KEEP COMFORTABLE
    // SLACK. ONE LEVEL AT A TIME WITH A SETTLE BETWEEN STEPS; ON THE
    // FIRST SLACK DIP, REVERT THE LAST STEP AND STOP.
    fn release_mba(&mut self) -> Result<ReleaseOutcome> {
        if !self.config.enable_mba || self.config.mba_floor_only {
            return Ok(ReleaseOutcome::Complete);
        }
        if self.state.ratio == 0 {
            // NOTHING LEFT ON THE BE SIDE TO PROTECT AGAINST
            if self.state.mba_level != policy::MBA_MAX {
                self.apply_mba(policy::MBA_MAX)?;
                self.note("mba-release-full");
            }
            return Ok(ReleaseOutcome::Complete);
        }

        while !self.shutdown.load(Ordering::Relaxed) {
            let current = self.state.mba_level;
            let next = match policy::next_release_level(current) {
                Some(l) => l,
                None => return Ok(ReleaseOutcome::Complete),
            };
            self.apply_mba(next)?;
            self.note("mba-release");
            std::thread::sleep(self.config.settle_time);
            self.read_probes();

            if self.combined_region() != Region::Green {
                self.apply_mba(current)?;
                self.note("mba-release-revert");
                return Ok(ReleaseOutcome::Reverted);
            }
        }
        Ok(ReleaseOutcome::Complete)
    }

    fn apply_mba(&mut self, level: u32) -> Result<()> {
        if let Some(mba) = self.mba.as_mut() {
            self.state.mba_level = mba.apply(level)?;
        }
        Ok(())
    }

    // --- SENSING ---

    fn read_probes(&mut self) {
        self.state.latency = self.probe.latest();
        self.state.slack = policy::slack(self.probe.target(), self.state.latency);
        match &self.probe2 {
            Some(p) => {
                self.state.latency2 = p.latest();
                self.state.slack2 = policy::slack(p.target(), self.state.latency2);
            }
            None => {
                self.state.latency2 = 0.0;
                self.state.slack2 = f64::INFINITY;
            }
        }
    }

    fn measure_stalls(&mut self) -> Result<()> {
        let rates = self
            .sampler
            .average(STALL_SAMPLES, self.config.monitor_period, STALL_TRIM)?;
        self.state.stall_hp = rates[0];
        self.state.stall_be = rates[1..].iter().sum::<f64>() / (rates.len() - 1) as f64;
        Ok(())
    }

    // A WORKLOAD WITH NO DATA YET (LATENCY 0) NEVER TRIGGERS ADAPTATION
    fn slo_violated(&self) -> bool {
        let hp = self.state.latency > 0.0 && self.state.slack < self.config.slack_up;
        let be = self.probe2.is_some()
            && self.state.latency2 > 0.0
            && self.state.slack2 < self.config.slack_up;
        hp || be
    }

    // WORST-CASE REGION ACROSS BOTH ORACLES. A MISSING SECONDARY ORACLE
    // COUNTS AS GREEN SO IT NEVER BLOCKS A RELEASE.
    fn combined_region(&self) -> Region {
        let hp = policy::classify(
            self.state.slack,
            self.state.latency,
            self.config.slack_up,
            self.config.slack_down_mba,
        );
        let be = match &self.probe2 {
            Some(_) => policy::classify(
                self.state.slack2,
                self.state.latency2,
                self.config.slack_up,
                self.config.slack_down_mba,
            ),
            None => Region::Green,
        };
        policy::combine(hp, be)
    }

    // RECORD WITHOUT CONSOLE OUTPUT. THE MONITOR LOOP RECORDS EVERY
    // ITERATION; PRINTING EVERY 20 MS WOULD DROWN THE TELEMETRY.
    fn note_quiet(&mut self, action: &'static str) {
        self.log.record(LogRecord {
            ts_ns: 0,
            counter: 0,
            ratio: self.state.ratio,
            mba_level: self.state.mba_level,
            target_slo: self.probe.target(),
            latency: self.state.latency,
            slack: self.state.slack,
            latency2: self.state.latency2,
            slack2: self.state.slack2,
            stall_hp: self.state.stall_hp,
            stall_be: self.state.stall_be,
            action,
        });
    }

    fn note(&mut self, action: &'static str) {
        self.note_quiet(action);
        self.print_telemetry(action);
    }

    fn print_telemetry(&self, action: &'static str) {
        println!("[CTRL]     {:<22} ratio={:<3} mba={:<3} lat={:<10.2} slack={:<7.3}",
            action, self.state.ratio, self.state.mba_level,
            self.state.latency, self.state.slack);
    }
}
