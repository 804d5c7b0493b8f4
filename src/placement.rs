// BWMAN PAGE PLACEMENT ENGINE
// WEIGHTED, ORDER-PRESERVING INTERLEAVE OF BE'S PAGES ACROSS NUMA NODES,
// ENFORCED WITH ONE BATCHED move_pages CALL PER MEMORY SEGMENT.
//
// THE ENGINE NEVER INSPECTS MEMORY CONTENTS: IT ONLY KNOWS ADDRESS RANGES
// AND PAGE COUNTS. THE ASSIGNMENT IS COMPUTED ONCE PER SEGMENT PER
// ACTUATION AND IS DETERMINISTIC FOR A FIXED (SEGMENTS, TABLE) PAIR.

use anyhow::{bail, Result};

use crate::segments::MemorySegment;
use crate::weights::NodeWeight;

// move_pages FLAG: MOVE PAGES OWNED BY THE TARGET PROCESS
const MPOL_MF_MOVE: libc::c_int = 1 << 1;

// COMPUTE THE PER-PAGE NODE ASSIGNMENT FOR A WEIGHT TABLE SORTED
// ASCENDING BY WEIGHT.
//
// STARTING FROM THE LOWEST-WEIGHT NODE, ALLOCATE THAT NODE'S EXCLUSIVE
// SHARE OF THE REMAINING PAGE RANGE (ROUNDED UP, CLAMPED TO THE
// REMAINDER), PARTITIONED ROUND-ROBIN ACROSS THE NODES THAT STILL HOLD
// SHARE; THEN DROP THE NODE AND REPEAT ON THE SHRINKING REMAINDER.
// PRODUCES THE SAME DISTRIBUTION AS A CANONICAL WEIGHTED INTERLEAVE
// WITHOUT PER-PAGE LAZY EVALUATION.
pub fn compute_node_assignment(page_count: usize, table: &[NodeWeight]) -> Vec<u32> {
    // ANY PAGE NOT EXPLICITLY ASSIGNED DEFAULTS TO THE LOWEST-INDEX NODE
    let default_node = table.iter().map(|e| e.node).min().unwrap_or(0);
    let mut nodes = vec![default_node; page_count];

    let mut node_ids: Vec<u32> = table.iter().map(|e| e.node).collect();
    let mut consumed = 0.0; // WEIGHT ALREADY ALLOCATED AMONG REMAINING NODES
    let mut next_page = 0usize;

    for entry in table {
        if next_page == page_count {
            break;
        }
        let remaining_nodes = node_ids.len();
        let band = entry.weight - consumed;
        // THIS NODE'S EXCLUSIVE SHARE OF THE REMAINING RANGE, PAGE-ALIGNED
        // UPWARD SO NO PAGE IS DOUBLE-COUNTED
        let mut share =
            (remaining_nodes as f64 * band / 100.0 * page_count as f64).ceil() as usize;
        share = share.min(page_count - next_page);

        if share > 0 {
            for j in next_page..next_page + share {
                nodes[j] = node_ids[j % remaining_nodes];
            }
        }

        node_ids.remove(0);
        consumed = entry.weight;
        next_page += share;
    }

    nodes
}

pub struct PagePlacementEngine {
    page_size: usize,
}

impl PagePlacementEngine {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        Self { page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    // ENFORCE THE TABLE ON EVERY KNOWN SEGMENT. SEGMENTS ARE INDEPENDENT;
    // A FAILURE OTHER THAN "PAGE NOT PRESENT" IS FATAL BECAUSE PAGE
    // RESIDENCY WOULD BE UNKNOWN AFTERWARD.
    pub fn place(&self, segments: &[MemorySegment], table: &[NodeWeight]) -> Result<()> {
        for seg in segments {
            self.place_segment(seg, table)?;
        }
        Ok(())
    }

    fn place_segment(&self, seg: &MemorySegment, table: &[NodeWeight]) -> Result<()> {
        let page_count = seg.page_count(self.page_size);
        if page_count == 0 {
            return Ok(());
        }

        let assignment = compute_node_assignment(page_count, table);

        let pages: Vec<*mut libc::c_void> = (0..page_count)
            .map(|i| (seg.addr as usize + i * self.page_size) as *mut libc::c_void)
            .collect();
        let nodes: Vec<libc::c_int> = assignment.iter().map(|&n| n as libc::c_int).collect();
        let mut status: Vec<libc::c_int> = vec![-123; page_count];

        let rc = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                seg.pid as libc::c_long,
                page_count as libc::c_ulong,
                pages.as_ptr(),
                nodes.as_ptr(),
                status.as_mut_ptr(),
                MPOL_MF_MOVE,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            // A SEGMENT MAY HAVE PAGES NOT YET FAULTED IN
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            bail!("move_pages failed for pid {}: {}", seg.pid, err);
        }
        Ok(())
    }
}

impl Default for PagePlacementEngine {
    fn default() -> Self {
        Self::new()
    }
}
