// PREREQUISITE CHECK -- VERIFIES THE MACHINE CAN RUN THE CONTROLLER
// BEFORE ANY ACTUATOR IS TOUCHED. NUMA TOPOLOGY, resctrl MOUNT, PERF
// ACCESS, KERNEL CONFIG.

use std::io::Read;
use std::path::Path;
use std::process::Command;

use anyhow::Result;

fn check_tool(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn check_kernel_config() -> bool {
    let file = match std::fs::File::open("/proc/config.gz") {
        Ok(f) => f,
        Err(_) => {
            println!("  /proc/config.gz       NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  /proc/config.gz       UNREADABLE (SKIPPED)");
        return true;
    }
    let mut ok = true;
    for flag in ["CONFIG_NUMA=y", "CONFIG_MIGRATION=y", "CONFIG_X86_CPU_RESCTRL=y"] {
        if config.contains(flag) {
            println!("  {:<22}OK", flag);
        } else {
            println!("  {:<22}NOT FOUND", flag);
            ok = false;
        }
    }
    ok
}

fn count_numa_nodes() -> usize {
    let dir = match std::fs::read_dir("/sys/devices/system/node") {
        Ok(d) => d,
        Err(_) => return 0,
    };
    dir.filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with("node") && name[4..].chars().all(|c| c.is_ascii_digit())
        })
        .count()
}

fn check_perf_paranoid() -> bool {
    match std::fs::read_to_string("/proc/sys/kernel/perf_event_paranoid") {
        Ok(s) => {
            let level: i32 = s.trim().parse().unwrap_or(3);
            // CPU-WIDE COUNTERS NEED <= 0 (OR CAP_PERFMON)
            if level <= 0 {
                println!("  perf_event_paranoid   OK ({})", level);
                true
            } else {
                println!("  perf_event_paranoid   {} -- need <= 0 or CAP_PERFMON", level);
                false
            }
        }
        Err(_) => {
            println!("  perf_event_paranoid   UNREADABLE");
            false
        }
    }
}

pub fn run_check() -> Result<()> {
    println!("BWMAN PREREQUISITE CHECK");
    println!();

    let mut ok = true;
    let tools = ["numactl", "perf"];
    for tool in &tools {
        if check_tool(tool) {
            println!("  {:<22}OK", tool);
        } else {
            println!("  {:<22}MISSING", tool);
            ok = false;
        }
    }
    println!();

    println!("KERNEL CONFIG:");
    if !check_kernel_config() {
        ok = false;
    }
    println!();

    println!("TOPOLOGY:");
    let nodes = count_numa_nodes();
    if nodes > 1 {
        println!("  NUMA nodes            OK ({})", nodes);
    } else {
        println!("  NUMA nodes            {} -- need at least 2", nodes);
        ok = false;
    }
    println!();

    println!("CONTROL PLANE:");
    if Path::new("/sys/fs/resctrl/schemata").exists() {
        println!("  /sys/fs/resctrl       MOUNTED");
    } else {
        println!("  /sys/fs/resctrl       NOT MOUNTED (mount -t resctrl resctrl /sys/fs/resctrl)");
        ok = false;
    }
    if !check_perf_paranoid() {
        ok = false;
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED -- SEE ABOVE");
        std::process::exit(1);
    }
    Ok(())
}
