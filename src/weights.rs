// BWMAN WEIGHT TABLE
// NODE -> WEIGHT MAPPING DEFINING BE'S UNTHROTTLED PAGE DISTRIBUTION.
// LOADED ONCE FROM A weight,node CSV FILE; NEVER MUTATED IN PLACE.
// RATIO PROJECTIONS PRODUCE A DERIVED WORKING COPY PER ACTUATION.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

// A MALFORMED WEIGHT TABLE MUST NOT SILENTLY MIS-PLACE MEMORY.
const SUM_TOLERANCE: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeWeight {
    pub node: u32,
    pub weight: f64,
}

#[derive(Clone, Debug)]
pub struct WeightTable {
    // SORTED ASCENDING BY WEIGHT
    entries: Vec<NodeWeight>,
    // THE `workers` LOWEST-NUMBERED NODES HOST THE WORKER SET
    workers: usize,
}

impl WeightTable {
    pub fn load(path: &Path, workers: usize) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("weight file {} not readable", path.display()))?;
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (w, n) = line
                .split_once(',')
                .with_context(|| format!("{}:{}: expected weight,node", path.display(), lineno + 1))?;
            let weight: f64 = w
                .trim()
                .parse()
                .with_context(|| format!("{}:{}: bad weight", path.display(), lineno + 1))?;
            let node: u32 = n
                .trim()
                .parse()
                .with_context(|| format!("{}:{}: bad node id", path.display(), lineno + 1))?;
            if !(0.0..=100.0).contains(&weight) {
                bail!("{}:{}: weight {} out of range", path.display(), lineno + 1, weight);
            }
            entries.push(NodeWeight { node, weight });
        }
        Self::from_entries(entries, workers)
    }

    pub fn from_entries(mut entries: Vec<NodeWeight>, workers: usize) -> Result<Self> {
        if entries.is_empty() {
            bail!("weight table is empty");
        }
        let nodes = entries.len();
        // SUPPORTED WORKER-NODE CONFIGURATIONS: 1, 2, 3, 4, OR ALL NODES
        if workers != nodes && !(1..=4).contains(&workers) {
            bail!("unsupported worker-node count {} for {} nodes", workers, nodes);
        }
        if workers > nodes {
            bail!("worker-node count {} exceeds node count {}", workers, nodes);
        }
        entries.sort_by(|a, b| a.weight.total_cmp(&b.weight));
        let sum: f64 = entries.iter().map(|e| e.weight).sum();
        if (sum - 100.0).abs() > SUM_TOLERANCE {
            bail!("weights sum to {:.2}, expected 100", sum);
        }
        Ok(Self { entries, workers })
    }

    pub fn entries(&self) -> &[NodeWeight] {
        &self.entries
    }

    pub fn num_nodes(&self) -> usize {
        self.entries.len()
    }

    pub fn is_worker(&self, node: u32) -> bool {
        (node as usize) < self.workers
    }

    pub fn all_workers(&self) -> bool {
        self.workers == self.entries.len()
    }

    // AGGREGATE WEIGHT OF THE WORKER NODES
    pub fn sum_ww(&self) -> f64 {
        self.entries
            .iter()
            .filter(|e| self.is_worker(e.node))
            .map(|e| e.weight)
            .sum()
    }

    // AGGREGATE WEIGHT OF THE NON-WORKER NODES
    pub fn sum_nww(&self) -> f64 {
        self.entries
            .iter()
            .filter(|e| !self.is_worker(e.node))
            .map(|e| e.weight)
            .sum()
    }

    // RECOMPUTE A TEMPORARY TABLE FOR A NON-DEFAULT PLACEMENT RATIO:
    // WORKER WEIGHTS SCALED TO AGGREGATE `ratio`, NON-WORKER WEIGHTS TO
    // AGGREGATE `100 - ratio`. A ZERO-WEIGHT SIDE IS BACKFILLED BY EVEN
    // SPREAD ACROSS THAT SIDE'S NODES.
    pub fn project_ratio(&self, ratio: u32) -> Result<Vec<NodeWeight>> {
        if ratio > 100 {
            bail!("ratio {} out of range", ratio);
        }
        // WITH EVERY NODE A WORKER THERE IS NO REMOTE SIDE TO PROJECT ONTO
        if self.all_workers() {
            return Ok(self.entries.clone());
        }
        let ratio = ratio as f64;
        let (sum_ww, sum_nww) = (self.sum_ww(), self.sum_nww());
        let n_ww = self.entries.iter().filter(|e| self.is_worker(e.node)).count();
        let n_nww = self.entries.len() - n_ww;

        let mut projected: Vec<NodeWeight> = self
            .entries
            .iter()
            .map(|e| {
                let weight = if self.is_worker(e.node) {
                    if sum_ww > 0.0 {
                        e.weight * ratio / sum_ww
                    } else {
                        ratio / n_ww as f64
                    }
                } else if sum_nww > 0.0 {
                    e.weight * (100.0 - ratio) / sum_nww
                } else {
                    (100.0 - ratio) / n_nww as f64
                };
                NodeWeight { node: e.node, weight }
            })
            .collect();

        projected.sort_by(|a, b| a.weight.total_cmp(&b.weight));
        let sum: f64 = projected.iter().map(|e| e.weight).sum();
        if (sum - 100.0).abs() > SUM_TOLERANCE {
            bail!("projected weights sum to {:.2}, expected 100", sum);
        }
        Ok(projected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_60_40() -> WeightTable {
        WeightTable::from_entries(
            vec![
                NodeWeight { node: 0, weight: 60.0 },
                NodeWeight { node: 1, weight: 40.0 },
            ],
            1,
        )
        .unwrap()
    }

    #[test]
    fn loads_sorted_ascending() {
        let t = table_60_40();
        assert_eq!(t.entries()[0].node, 1);
        assert_eq!(t.entries()[0].weight, 40.0);
        assert_eq!(t.entries()[1].node, 0);
    }

    #[test]
    fn worker_sums() {
        // weight file "60,0\n40,1" WITH 1 WORKER NODE (NODE 0)
        let t = table_60_40();
        assert_eq!(t.sum_ww(), 60.0);
        assert_eq!(t.sum_nww(), 40.0);
    }

    #[test]
    fn rejects_bad_sum() {
        let r = WeightTable::from_entries(
            vec![
                NodeWeight { node: 0, weight: 60.0 },
                NodeWeight { node: 1, weight: 30.0 },
            ],
            1,
        );
        assert!(r.is_err());
    }

    #[test]
    fn rejects_unsupported_worker_count() {
        let entries: Vec<NodeWeight> = (0..8)
            .map(|n| NodeWeight { node: n, weight: 12.5 })
            .collect();
        assert!(WeightTable::from_entries(entries.clone(), 5).is_err());
        assert!(WeightTable::from_entries(entries.clone(), 8).is_ok()); // ALL NODES
        assert!(WeightTable::from_entries(entries, 2).is_ok());
    }

    #[test]
    fn projection_sums_to_100_for_all_ratios() {
        let t = table_60_40();
        for ratio in (0..=100).step_by(5) {
            let p = t.project_ratio(ratio).unwrap();
            let sum: f64 = p.iter().map(|e| e.weight).sum();
            assert!((sum - 100.0).abs() <= 1.0, "ratio {}: sum {}", ratio, sum);
        }
    }

    #[test]
    fn projection_scales_each_side() {
        let t = table_60_40();
        let p = t.project_ratio(30).unwrap();
        let ww: f64 = p.iter().filter(|e| e.node == 0).map(|e| e.weight).sum();
        let nww: f64 = p.iter().filter(|e| e.node == 1).map(|e| e.weight).sum();
        assert!((ww - 30.0).abs() < 1e-9);
        assert!((nww - 70.0).abs() < 1e-9);
    }

    #[test]
    fn projection_boundaries() {
        let t = table_60_40();
        let p = t.project_ratio(0).unwrap();
        assert_eq!(p.iter().find(|e| e.node == 0).unwrap().weight, 0.0);
        assert_eq!(p.iter().find(|e| e.node == 1).unwrap().weight, 100.0);
        let p = t.project_ratio(100).unwrap();
        assert_eq!(p.iter().find(|e| e.node == 0).unwrap().weight, 100.0);
    }

    #[test]
    fn projection_resorted_ascending() {
        let t = table_60_40();
        let p = t.project_ratio(80).unwrap();
        for pair in p.windows(2) {
            assert!(pair[0].weight <= pair[1].weight);
        }
    }

    #[test]
    fn projection_backfills_zero_weight_side() {
        // ALL CANONICAL WEIGHT ON THE WORKER NODE; REMOTE SIDE STILL GETS
        // ITS SHARE SPREAD EVENLY WHEN PROJECTED
        let t = WeightTable::from_entries(
            vec![
                NodeWeight { node: 0, weight: 100.0 },
                NodeWeight { node: 1, weight: 0.0 },
            ],
            1,
        )
        .unwrap();
        let p = t.project_ratio(40).unwrap();
        assert!((p.iter().find(|e| e.node == 1).unwrap().weight - 60.0).abs() < 1e-9);
    }

    #[test]
    fn all_workers_returns_canonical() {
        let t = WeightTable::from_entries(
            vec![
                NodeWeight { node: 0, weight: 50.0 },
                NodeWeight { node: 1, weight: 50.0 },
            ],
            2,
        )
        .unwrap();
        let p = t.project_ratio(30).unwrap();
        assert_eq!(p, t.entries().to_vec());
    }
}
