// BWMAN CONTROL POLICY
// PURE-RUST MODULE: ZERO SYSCALL DEPENDENCIES
// SHARED BETWEEN BINARY CRATE (controller.rs) AND LIB CRATE (tests)

use std::time::Duration;

use clap::ValueEnum;

// OPERATING-REGION THRESHOLDS
// SLACK = (TARGET - CURRENT) / TARGET. NEGATIVE SLACK = SLO VIOLATION.
// SLACK_UP IS THE DANGER BOUNDARY (TIGHTEN BELOW IT), SLACK_DOWN_MBA THE
// GREEN BOUNDARY (SAFE TO RELEASE THE BANDWIDTH CAP ABOVE IT).

pub const DEFAULT_SLACK_UP: f64       = 0.05;
pub const DEFAULT_SLACK_DOWN_MBA: f64 = 0.2;
pub const DEFAULT_DELTA_HP: f64       = 0.5;

// THE ADAPTATION STEP: ONE PAGE-MIGRATION ACTUATION MOVES THE REMOTE
// RATIO BY THIS MANY PERCENT.
pub const ADAPTATION_STEP: u32 = 10;

// HARDWARE AND OS EFFECTS OF AN ACTUATION ARE NOT INSTANTANEOUS.
pub const SETTLE_TIME: Duration     = Duration::from_secs(3);
pub const MONITOR_PERIOD: Duration  = Duration::from_millis(20);

// --- MBA LEVEL SET ---

// 70 AND 80 ARE INVALID HARDWARE STATES ON THE TARGET PLATFORM AND ARE
// NEVER APPLIED. 100 = UNTHROTTLED.
pub const VALID_MBA_LEVELS: [u32; 8] = [100, 90, 60, 50, 40, 30, 20, 10];

pub const MBA_MIN: u32 = 10;
pub const MBA_MAX: u32 = 100;
pub const MBA_SEARCH_START: u32 = 40;

pub fn is_valid_mba_level(level: u32) -> bool {
    VALID_MBA_LEVELS.contains(&level)
}

// FIXED MIDPOINT TABLE FOR THE BOUNDED BINARY SEARCH OVER THE LEVEL SET.
// progress > 0: LATENCY ABOVE TARGET, MOVE TOWARD LOWER CAPS.
// progress < 0: LATENCY BELOW TARGET, MOVE TOWARD HIGHER CAPS.
// None: SEARCH SPACE EXHAUSTED (CALLER REVERTS TO LAST KNOWN-GOOD).
pub fn mba_binary_search(current: u32, progress: f64) -> Option<u32> {
    if progress > 0.0 {
        match current {
            40 => Some(20),
            20 => Some(10),
            60 => Some(50),
            _ => None,
        }
    } else {
        match current {
            40 => Some(60),
            20 => Some(30),
            60 => Some(90),
            _ => None,
        }
    }
}

// NEXT LEVEL WHEN WALKING THE CAP BACK UP DURING RELEASE.
// STEPS OF 10, SKIPPING THE INVALID 70/80 STATES.
pub fn next_release_level(current: u32) -> Option<u32> {
    let mut next = current + 10;
    while next == 70 || next == 80 {
        next += 10;
    }
    if next > MBA_MAX {
        None
    } else {
        Some(next)
    }
}

// --- RATIO STEPPING ---

pub fn next_ratio_up(ratio: u32, step: u32) -> Option<u32> {
    if ratio >= 100 {
        None
    } else {
        Some((ratio + step).min(100))
    }
}

pub fn next_ratio_down(ratio: u32, step: u32) -> Option<u32> {
    if ratio == 0 {
        None
    } else {
        Some(ratio.saturating_sub(step))
    }
}

// --- SLACK ---

pub fn slack(target: f64, current: f64) -> f64 {
    (target - current) / target
}

// A WORKLOAD COUNTS AS RECOVERED ONLY ON REAL DATA: LATENCY 0 MEANS THE
// ORACLE HAS NOT REPORTED YET.
pub fn slack_recovered(slack: f64, latency: f64, slack_up: f64) -> bool {
    latency > 0.0 && slack > slack_up
}

// OPERATING REGION OF ONE MONITORING ITERATION.
// A REPORTED LATENCY OF 0 MEANS "NO DATA" AND NEVER CLASSIFIES AS GREEN.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Region {
    Danger,
    Hold,
    Green,
}

pub fn classify(slack: f64, latency: f64, slack_up: f64, slack_down_mba: f64) -> Region {
    if slack < slack_up {
        Region::Danger
    } else if latency > 0.0 && slack > slack_down_mba {
        Region::Green
    } else {
        Region::Hold
    }
}

// WORST REGION ACROSS BOTH WORKLOADS: TIGHTEN IF EITHER IS IN DANGER,
// RELEASE ONLY IF BOTH ARE GREEN.
pub fn combine(a: Region, b: Region) -> Region {
    use Region::*;
    match (a, b) {
        (Danger, _) | (_, Danger) => Danger,
        (Green, Green) => Green,
        _ => Hold,
    }
}

// --- DEPLOYABLE MODES ---

// ALL MODES SHARE THE SLACK COMPUTATION AND LOGGING CONTRACT; THEY DIFFER
// ONLY IN WHICH ACTUATORS ARE ENABLED.
#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
pub enum Mode {
    /// PAGE MIGRATION + MBA (THE FULL CONTROLLER)
    Adaptive,
    /// PAGE MIGRATION ONLY
    PmOnly,
    /// MBA BINARY SEARCH ONLY
    MbaOnly,
    /// APPLY THE MINIMUM MBA CAP ON VIOLATION, NOTHING ELSE
    MbaFloor,
    /// MEASURE AND LOG ONLY (CONTROL GROUP)
    Baseline,
    /// SINGLE FIXED-RATIO ACTUATION, THEN EXIT
    FixedRatio,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Mode::Adaptive => "adaptive",
            Mode::PmOnly => "pm-only",
            Mode::MbaOnly => "mba-only",
            Mode::MbaFloor => "mba-floor",
            Mode::Baseline => "baseline",
            Mode::FixedRatio => "fixed-ratio",
        }
    }
}

// ONE PARAMETERIZED CONTROLLER INSTEAD OF ONE LOOP BODY PER MODE.
#[derive(Clone, Copy, Debug)]
pub struct ControllerConfig {
    pub mode: Mode,
    pub enable_page_migration: bool,
    pub enable_mba: bool,
    pub mba_floor_only: bool,
    pub slack_up: f64,
    pub slack_down_mba: f64,
    pub delta_hp: f64,
    pub adaptation_step: u32,
    pub monitor_period: Duration,
    pub settle_time: Duration,
}

impl ControllerConfig {
    pub fn for_mode(mode: Mode) -> Self {
        let (pm, mba, floor) = match mode {
            Mode::Adaptive => (true, true, false),
            Mode::PmOnly => (true, false, false),
            Mode::MbaOnly => (false, true, false),
            Mode::MbaFloor => (false, true, true),
            Mode::Baseline => (false, false, false),
            Mode::FixedRatio => (true, false, false),
        };
        Self {
            mode,
            enable_page_migration: pm,
            enable_mba: mba,
            mba_floor_only: floor,
            slack_up: DEFAULT_SLACK_UP,
            slack_down_mba: DEFAULT_SLACK_DOWN_MBA,
            delta_hp: DEFAULT_DELTA_HP,
            adaptation_step: ADAPTATION_STEP,
            monitor_period: MONITOR_PERIOD,
            settle_time: SETTLE_TIME,
        }
    }

    // TIGHTENING OPTIONS LEFT GIVEN THE CURRENT RATIO. PAGE MIGRATION IS
    // EXHAUSTED AT RATIO 100. WITH PLACEMENT ENABLED, THROTTLING BE IS
    // POINTLESS WHEN NONE OF ITS PAGES SIT ON THE HP SIDE (RATIO 0);
    // WITHOUT PLACEMENT THE CAP IS THE ONLY KNOB AND ALWAYS APPLIES.
    pub fn can_migrate(&self, ratio: u32) -> bool {
        self.enable_page_migration && ratio < 100
    }

    pub fn can_throttle(&self, ratio: u32) -> bool {
        self.enable_mba && (ratio > 0 || !self.enable_page_migration)
    }

    // TIGHTENING IS EXHAUSTED WHEN MIGRATION HAS NO ROOM AND THE CAP IS
    // ALREADY AT ITS FLOOR (OR DISABLED). THE UNRECOVERABLE-EMERGENCY
    // BRANCH FIRES EXACTLY HERE.
    pub fn exhausted(&self, ratio: u32, mba_level: u32) -> bool {
        let throttle = self.can_throttle(ratio) && mba_level > MBA_MIN;
        !self.can_migrate(ratio) && !throttle
    }

    // ONE DECISION OF THE ADAPTATION EPISODE. THE EPISODE STAYS ALIVE
    // UNTIL THE CAP IS FULLY RELEASED: A HOLD-BAND READING KEEPS THE
    // CURRENT CONFIGURATION BUT DOES NOT END THE EPISODE WHILE THE BE
    // WORKLOAD IS STILL THROTTLED.
    pub fn episode_step(&self, region: Region, ratio: u32, mba_level: u32) -> EpisodeAction {
        match region {
            Region::Danger => {
                if self.exhausted(ratio, mba_level) {
                    EpisodeAction::Emergency
                } else if self.can_migrate(ratio) {
                    EpisodeAction::Migrate
                } else {
                    // CAP ALREADY APPLIED, NO MIGRATION ROOM: WAIT IT OUT
                    EpisodeAction::Hold
                }
            }
            Region::Green if mba_level < MBA_MAX => EpisodeAction::Release,
            Region::Hold if mba_level < MBA_MAX => EpisodeAction::Hold,
            _ => EpisodeAction::Finished,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EpisodeAction {
    // CAP FULLY RELEASED AND NO DANGER: BACK TO PLAIN MONITORING
    Finished,
    // NO KNOB LEFT TO TURN UNDER A PERSISTING VIOLATION
    Emergency,
    Migrate,
    Release,
    Hold,
}
