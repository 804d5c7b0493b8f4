// BWMAN -- SLO-AWARE NUMA BANDWIDTH CONTROLLER
// PROTECTS THE TAIL-LATENCY SLO OF A HIGH-PRIORITY WORKLOAD WHILE
// MAXIMIZING THE MEMORY THROUGHPUT OF A CO-LOCATED BEST-EFFORT WORKLOAD.
//
// TWO KNOBS, ONE CONTROL LOOP:
//   PAGE PLACEMENT: WEIGHTED-INTERLEAVE MIGRATION OF BE PAGES ACROSS NODES
//   MBA:            HARDWARE BANDWIDTH CAP ON BE'S ALLOCATION CLASS
//
// PURE CONTROL LOGIC LIVES IN policy/weights/placement (TESTABLE OFFLINE).
// SYSCALL-TOUCHING MODULES (stall, mba, segments, probe) WRAP ONE KERNEL
// INTERFACE EACH.

pub mod controller;
pub mod mba;
pub mod placement;
pub mod policy;
pub mod probe;
pub mod record;
pub mod segments;
pub mod stall;
pub mod weights;
