// BWMAN v1.3.0 -- NUMA BANDWIDTH CONTROLLER
// PROTECTS A HIGH-PRIORITY WORKLOAD'S TAIL-LATENCY SLO WHILE LETTING A
// BEST-EFFORT WORKLOAD USE EVERY SPARE BYTE OF MEMORY BANDWIDTH.
//
// TWO ACTUATORS: WEIGHTED NUMA PAGE PLACEMENT (move_pages) AND MEMORY
// BANDWIDTH ALLOCATION (resctrl). ONE CONTROLLER THREAD DRIVES BOTH;
// LATENCY PROBES RUN ON THEIR OWN THREADS AND SHARE ATOMICS ONLY.

mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use bwman::controller::AdaptiveController;
use bwman::mba::MbaDriver;
use bwman::placement::PagePlacementEngine;
use bwman::policy::{self, ControllerConfig, Mode};
use bwman::probe::{LatencyProbe, Unit};
use bwman::segments;
use bwman::stall::StallRateSampler;
use bwman::weights::WeightTable;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

// ORACLE WARM-UP: IGNORE READINGS AT OR BELOW THIS UNTIL THE WORKLOAD
// IS ACTUALLY SERVING
const WARMUP_FLOOR: f64 = 33.0;

#[derive(Parser)]
#[command(name = "bwman")]
#[command(about = "BWMAN -- SLO-AWARE NUMA BANDWIDTH CONTROLLER")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    // CONTROLLER MODE
    #[arg(long, value_enum, default_value_t = Mode::Adaptive)]
    mode: Mode,

    // WEIGHT TABLE FILE, ONE "weight,node" LINE PER NODE
    #[arg(long, default_value = "weights/weights_1w.txt")]
    weights: PathBuf,

    // NUMBER OF WORKER NODES (LOWEST-NUMBERED NODES)
    #[arg(long, default_value_t = 1)]
    workers: usize,

    // MONITORED CORES: FIRST IS HP, REST ARE BE
    #[arg(long, default_value = "0,10")]
    cores: String,

    // HP TAIL-LATENCY SLO TARGET
    #[arg(long, default_value_t = 1000.0)]
    target_slo: f64,

    // LATENCY ORACLE ENDPOINT FOR THE HP WORKLOAD
    #[arg(long, default_value = "127.0.0.1")]
    server: String,

    #[arg(long, default_value_t = 1234)]
    port: u16,

    // SECONDARY ORACLE PORT; 0 DISABLES THE SECONDARY WORKLOAD
    #[arg(long, default_value_t = 0)]
    port2: u16,

    // SECONDARY WORKLOAD SLO TARGET (ORACLE REPORTS NANOSECONDS)
    #[arg(long, default_value_t = 8.0)]
    target_slo2: f64,

    // INITIAL WEIGHT RATIO; ALSO THE OPERATING POINT FOR fixed-ratio
    #[arg(long, default_value_t = 0)]
    ratio: u32,

    // resctrl MB DOMAIN FOR THE BE SOCKET
    #[arg(long, default_value_t = 0)]
    mba_domain: u32,

    #[arg(long, default_value_t = policy::DEFAULT_SLACK_UP)]
    slack_up: f64,

    #[arg(long, default_value_t = policy::DEFAULT_SLACK_DOWN_MBA)]
    slack_down_mba: f64,

    #[arg(long, default_value_t = policy::DEFAULT_DELTA_HP)]
    delta_hp: f64,

    // DUMP FULL DECISION LOG ON EXIT
    #[arg(long)]
    dump_log: bool,
}

#[derive(Subcommand)]
enum Commands {
    // VERIFY KERNEL AND TOOLING PREREQUISITES, THEN EXIT
    Check,
}

fn parse_cores(spec: &str) -> Result<Vec<u32>> {
    let cores: Vec<u32> = spec
        .split(',')
        .map(|c| c.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("bad core list {:?}: {}", spec, e))?;
    if cores.len() < 2 {
        bail!("need at least one HP and one BE core, got {:?}", spec);
    }
    Ok(cores)
}

// BLOCK UNTIL THE HP ORACLE REPORTS REAL TRAFFIC. RATE-LIMITED LOG SO
// A SLOW-STARTING WORKLOAD DOES NOT FLOOD THE CONSOLE.
fn wait_for_warmup(probe: &LatencyProbe) -> Result<()> {
    let mut waits: u64 = 0;
    while probe.latest() <= WARMUP_FLOOR {
        if SHUTDOWN.load(Ordering::Relaxed) {
            bail!("shutdown requested during warm-up");
        }
        if waits % 50 == 0 {
            println!("[WARMUP]   waiting for HP oracle (latest={:.2})", probe.latest());
        }
        waits += 1;
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Check) = cli.command {
        return cli::check::run_check();
    }

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let cores = parse_cores(&cli.cores)?;
    let mut config = ControllerConfig::for_mode(cli.mode);
    config.slack_up = cli.slack_up;
    config.slack_down_mba = cli.slack_down_mba;
    config.delta_hp = cli.delta_hp;

    println!("BWMAN v1.3.0");
    println!("MODE:            {}", cli.mode.label());
    println!("CORES:           {:?} (HP={}, BE={:?})", cores, cores[0], &cores[1..]);
    println!("WEIGHTS:         {} ({} workers)", cli.weights.display(), cli.workers);
    println!("TARGET SLO:      {}", cli.target_slo);
    println!("ORACLE:          {}:{}", cli.server, cli.port);
    if cli.port2 != 0 {
        println!("ORACLE 2:        {}:{} (target {})", cli.server, cli.port2, cli.target_slo2);
    }
    println!("SLACK:           up={} down_mba={} delta_hp={}",
             config.slack_up, config.slack_down_mba, config.delta_hp);
    println!();

    let weights = WeightTable::load(&cli.weights, cli.workers)?;
    let placement = PagePlacementEngine::new();
    let sampler = StallRateSampler::new(&cores)?;

    let mba = if config.enable_mba {
        Some(MbaDriver::new(cli.mba_domain, &cores[1..])?)
    } else {
        None
    };

    let probe = LatencyProbe::spawn(
        &cli.server, cli.port, Unit::Micros,
        cli.target_slo, config.slack_up, &SHUTDOWN,
    );
    let probe2 = (cli.port2 != 0).then(|| {
        LatencyProbe::spawn(
            &cli.server, cli.port2, Unit::NanosToMillis,
            cli.target_slo2, config.slack_up, &SHUTDOWN,
        )
    });

    wait_for_warmup(&probe)?;
    println!("[WARMUP]   HP oracle live, waiting for BE segments");
    let published = segments::wait_for_segments(&SHUTDOWN, placement.page_size())?;
    println!("[SEGMENTS] {} segment(s) published", published.len());

    let mut controller = AdaptiveController::new(
        config, weights, published, placement, mba,
        sampler, probe, probe2, cli.ratio, &SHUTDOWN,
    );

    println!("BWMAN IS ACTIVE (CTRL+C TO EXIT)");
    let run_result = controller.run();

    println!("BWMAN IS SHUTTING DOWN");
    let final_state = controller.final_state();
    let (log, probe, probe2, mba) = controller.into_parts();

    if let Some(mut mba) = mba {
        mba.reset();
    }
    segments::destroy();
    let hp_stats = probe.stats();
    let be_stats = probe2.as_ref().map(|p| p.stats());

    if cli.dump_log {
        log.dump();
    }
    log.summary(&hp_stats, be_stats.as_ref());
    if let Err(e) = log.write_artifacts(&hp_stats, be_stats.as_ref()) {
        eprintln!("[LOG]      artifact write failed: {:#}", e);
    }

    println!("FINAL: ratio={} mba={}", final_state.ratio, final_state.mba_level);
    println!("BWMAN OUT.");
    run_result
}
