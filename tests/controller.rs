// BWMAN CONTROL-POLICY TESTS
// SLACK CLASSIFICATION, RATIO STEPPING, MBA SEARCH AND RELEASE WALKS,
// WEIGHT PROJECTION, PAGE ASSIGNMENT
//
// ALL TESTS USE PURE-RUST TYPES FROM bwman::policy, bwman::weights AND
// bwman::placement. ZERO SYSCALL DEPENDENCIES. RUN OFFLINE.

use bwman::placement::compute_node_assignment;
use bwman::policy::{
    classify, combine, is_valid_mba_level, mba_binary_search, next_ratio_up,
    next_release_level, slack, slack_recovered, ControllerConfig, EpisodeAction,
    Mode, Region, ADAPTATION_STEP, DEFAULT_SLACK_DOWN_MBA, DEFAULT_SLACK_UP,
    MBA_MAX, MBA_MIN, MBA_SEARCH_START, VALID_MBA_LEVELS,
};
use bwman::weights::{NodeWeight, WeightTable};

fn table_1w() -> WeightTable {
    // ONE WORKER NODE HOLDING 60% OF THE WEIGHT
    WeightTable::from_entries(
        vec![
            NodeWeight { node: 0, weight: 60.0 },
            NodeWeight { node: 1, weight: 40.0 },
        ],
        1,
    )
    .unwrap()
}

// --- SLO CLASSIFICATION ---

#[test]
fn violation_at_twenty_percent_over_target() {
    // TARGET 1000us, MEASURED 1200us: SLACK -0.2, UNAMBIGUOUS DANGER
    let s = slack(1000.0, 1200.0);
    assert!((s + 0.2).abs() < 1e-9);
    assert_eq!(
        classify(s, 1200.0, DEFAULT_SLACK_UP, DEFAULT_SLACK_DOWN_MBA),
        Region::Danger
    );
}

#[test]
fn partial_recovery_holds_configuration() {
    // MEASURED 900us AGAINST TARGET 1000us: SLACK 0.1 SITS BETWEEN THE
    // DANGER AND GREEN BOUNDARIES, SO NEITHER TIGHTEN NOR RELEASE
    let s = slack(1000.0, 900.0);
    assert_eq!(
        classify(s, 900.0, DEFAULT_SLACK_UP, DEFAULT_SLACK_DOWN_MBA),
        Region::Hold
    );
}

#[test]
fn release_requires_both_workloads_green() {
    let hp = classify(0.3, 700.0, DEFAULT_SLACK_UP, DEFAULT_SLACK_DOWN_MBA);
    let be = classify(0.1, 7.2, DEFAULT_SLACK_UP, DEFAULT_SLACK_DOWN_MBA);
    assert_eq!(hp, Region::Green);
    assert_eq!(be, Region::Hold);
    assert_eq!(combine(hp, be), Region::Hold);
    assert_eq!(combine(hp, Region::Green), Region::Green);
}

#[test]
fn silent_oracle_never_releases() {
    // LATENCY 0 MEANS NO DATA; RAW SLACK WOULD BE 1.0 (GREEN)
    let s = slack(1000.0, 0.0);
    assert_eq!(s, 1.0);
    assert_eq!(
        classify(s, 0.0, DEFAULT_SLACK_UP, DEFAULT_SLACK_DOWN_MBA),
        Region::Hold
    );
}

// --- RATIO STEPPING ---

#[test]
fn tightening_walks_ratio_to_exhaustion() {
    // FROM 40, EACH VIOLATION STEP MOVES ANOTHER 10% TOWARD HP
    let mut ratio = 40;
    let mut seen = Vec::new();
    while let Some(next) = next_ratio_up(ratio, ADAPTATION_STEP) {
        ratio = next;
        seen.push(ratio);
    }
    assert_eq!(seen, vec![50, 60, 70, 80, 90, 100]);
    assert_eq!(next_ratio_up(100, ADAPTATION_STEP), None);
}

#[test]
fn odd_ratio_clamps_at_hundred() {
    assert_eq!(next_ratio_up(95, ADAPTATION_STEP), Some(100));
}

// --- MBA SEARCH AND RELEASE ---

#[test]
fn search_reaches_floor_under_sustained_pressure() {
    // LATENCY STAYS OVER TARGET AT EVERY PROBED LEVEL: 40 -> 20 -> 10
    let mut level = MBA_SEARCH_START;
    let mut path = vec![level];
    while let Some(next) = mba_binary_search(level, 1.0) {
        level = next;
        path.push(level);
    }
    assert_eq!(path, vec![40, 20, 10]);
    assert_eq!(level, MBA_MIN);
}

#[test]
fn search_relaxes_when_under_target() {
    assert_eq!(mba_binary_search(40, -1.0), Some(60));
    assert_eq!(mba_binary_search(60, -1.0), Some(90));
    assert_eq!(mba_binary_search(90, -1.0), None);
}

#[test]
fn search_only_visits_valid_levels() {
    for &start in &VALID_MBA_LEVELS {
        for progress in [-1.0, 1.0] {
            if let Some(next) = mba_binary_search(start, progress) {
                assert!(is_valid_mba_level(next), "{} -> {}", start, next);
            }
        }
    }
}

#[test]
fn release_walk_reaches_full_bandwidth() {
    let mut level = MBA_MIN;
    let mut path = vec![level];
    while let Some(next) = next_release_level(level) {
        level = next;
        path.push(level);
    }
    // 70 AND 80 NEVER APPEAR
    assert_eq!(path, vec![10, 20, 30, 40, 50, 60, 90, 100]);
    assert_eq!(level, MBA_MAX);
}

// --- WEIGHT PROJECTION ---

#[test]
fn projection_preserves_total_weight() {
    let table = table_1w();
    for ratio in (0..=100).step_by(10) {
        let projected = table.project_ratio(ratio).unwrap();
        let sum: f64 = projected.iter().map(|e| e.weight).sum();
        assert!((sum - 100.0).abs() < 1e-6, "ratio {}: sum {}", ratio, sum);
    }
}

#[test]
fn projection_moves_aggregate_to_worker_side() {
    let table = table_1w();
    // AT RATIO 90 THE WORKER NODE CARRIES 90% OF THE WEIGHT
    let projected = table.project_ratio(90).unwrap();
    let worker: f64 = projected
        .iter()
        .filter(|e| table.is_worker(e.node))
        .map(|e| e.weight)
        .sum();
    assert!((worker - 90.0).abs() < 1e-6, "worker sum {}", worker);
}

#[test]
fn worker_aggregates_match_table() {
    let table = table_1w();
    assert!((table.sum_ww() - 60.0).abs() < 1e-9);
    assert!((table.sum_nww() - 40.0).abs() < 1e-9);
}

// --- PAGE ASSIGNMENT ---

#[test]
fn assignment_covers_every_page_at_all_ratios() {
    let table = table_1w();
    for ratio in (0..=100).step_by(10) {
        let projected = table.project_ratio(ratio).unwrap();
        let assignment = compute_node_assignment(1003, &projected);
        assert_eq!(assignment.len(), 1003, "ratio {}", ratio);
        assert!(
            assignment.iter().all(|&n| n <= 1),
            "ratio {}: unknown node",
            ratio
        );
    }
}

#[test]
fn full_ratio_concentrates_pages_on_worker() {
    let table = table_1w();
    let projected = table.project_ratio(100).unwrap();
    let assignment = compute_node_assignment(1000, &projected);
    assert!(assignment.iter().all(|&n| n == 0));
}

#[test]
fn assignment_is_deterministic() {
    let table = table_1w();
    let projected = table.project_ratio(50).unwrap();
    let a = compute_node_assignment(4096, &projected);
    let b = compute_node_assignment(4096, &projected);
    assert_eq!(a, b);
}

// --- MODE / KNOB EXHAUSTION ---

#[test]
fn emergency_only_when_both_knobs_exhausted() {
    let cfg = ControllerConfig::for_mode(Mode::Adaptive);
    // MID-RANGE RATIO: BOTH KNOBS AVAILABLE
    assert!(!cfg.exhausted(50, MBA_SEARCH_START));
    // RATIO 100 BUT CAP STILL ABOVE THE FLOOR: THROTTLE REMAINS
    assert!(!cfg.exhausted(100, MBA_SEARCH_START));
    // RATIO 100 WITH THE CAP ON THE FLOOR: NOTHING LEFT
    assert!(cfg.exhausted(100, MBA_MIN));
    // PM-ONLY AT RATIO 100: NOTHING LEFT REGARDLESS OF THE CAP
    let cfg = ControllerConfig::for_mode(Mode::PmOnly);
    assert!(cfg.exhausted(100, MBA_MAX));
}

// --- ADAPTATION EPISODE ---

#[test]
fn episode_traces_clamp_hold_then_release() {
    // TARGET 1000us. A 1200us READING OPENS AN EPISODE; A SUBSEQUENT
    // 900us READING LANDS IN THE HOLD BAND. WITH THE CAP STILL ON THE
    // FLOOR THE EPISODE MUST STAY ALIVE RATHER THAN STRAND BE AT 10%.
    let cfg = ControllerConfig::for_mode(Mode::Adaptive);

    let danger = classify(slack(1000.0, 1200.0), 1200.0, cfg.slack_up, cfg.slack_down_mba);
    assert_eq!(danger, Region::Danger);

    let hold = classify(slack(1000.0, 900.0), 900.0, cfg.slack_up, cfg.slack_down_mba);
    assert_eq!(hold, Region::Hold);
    assert_eq!(cfg.episode_step(hold, 50, MBA_MIN), EpisodeAction::Hold);

    // DEEP RECOVERY (500us, SLACK 0.5) WALKS THE CAP BACK UP
    let green = classify(slack(1000.0, 500.0), 500.0, cfg.slack_up, cfg.slack_down_mba);
    assert_eq!(green, Region::Green);
    assert_eq!(cfg.episode_step(green, 50, MBA_MIN), EpisodeAction::Release);

    // ONLY FULL BANDWIDTH ENDS THE EPISODE FROM THE HOLD BAND
    assert_eq!(cfg.episode_step(hold, 50, MBA_MAX), EpisodeAction::Finished);
}

#[test]
fn episode_escalates_to_emergency_at_full_ratio_and_floor() {
    let cfg = ControllerConfig::for_mode(Mode::Adaptive);
    let danger = Region::Danger;
    // ROOM TO MIGRATE OR CLAMP: NO EMERGENCY
    assert_eq!(cfg.episode_step(danger, 90, MBA_MIN), EpisodeAction::Migrate);
    assert_eq!(cfg.episode_step(danger, 100, MBA_SEARCH_START), EpisodeAction::Hold);
    // BOTH SPENT: SUSTAINED DANGER IS UNRECOVERABLE
    assert_eq!(cfg.episode_step(danger, 100, MBA_MIN), EpisodeAction::Emergency);
}

#[test]
fn migration_stops_when_either_workload_recovers() {
    // HP STILL TIGHT BUT THE SECONDARY WORKLOAD CLEARED ITS SOFT
    // THRESHOLD: THE WALK MUST END ON EITHER SIGNAL
    let hp = slack_recovered(0.02, 980.0, DEFAULT_SLACK_UP);
    let be = slack_recovered(0.10, 7.2, DEFAULT_SLACK_UP);
    assert!(!hp);
    assert!(be);
    assert!(hp || be);
    // A SILENT SECONDARY ORACLE NEVER COUNTS AS RECOVERED
    assert!(!slack_recovered(1.0, 0.0, DEFAULT_SLACK_UP));
}
