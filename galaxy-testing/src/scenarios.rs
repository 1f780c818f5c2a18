use anyhow::{bail, Context};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use galaxy_core::ops::OpValue;
use galaxy_core::LineId;
use galaxy_engine::Op;

use crate::cluster::TestCluster;
use crate::network_sim::NetworkStats;

/// Random reads and writes against a fixed set of lines, issued one at a
/// time from random nodes. Every read must observe the latest write.
#[derive(Debug, Clone)]
pub struct Workload {
    pub name: String,
    pub lines: usize,
    pub operations: usize,
    pub write_ratio: f64,
    pub seed: u64,
}

impl Workload {
    pub fn new(name: impl Into<String>, lines: usize, operations: usize) -> Self {
        Self {
            name: name.into(),
            lines,
            operations,
            write_ratio: 0.3,
            seed: 7,
        }
    }

    pub fn with_write_ratio(mut self, ratio: f64) -> Self {
        self.write_ratio = ratio;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

#[derive(Debug)]
pub struct WorkloadResult {
    pub name: String,
    pub reads: usize,
    pub writes: usize,
    pub duration: Duration,
    pub average_latency: Duration,
    pub p95_latency: Duration,
    pub network_stats: NetworkStats,
}

impl WorkloadResult {
    pub fn operations(&self) -> usize {
        self.reads + self.writes
    }

    pub fn messages_per_operation(&self) -> f64 {
        if self.operations() == 0 {
            0.0
        } else {
            self.network_stats.messages_sent as f64 / self.operations() as f64
        }
    }
}

/// Runs `workload` on `cluster`, checking coherence of every line at the end.
pub fn run_workload(cluster: &TestCluster, workload: &Workload) -> anyhow::Result<WorkloadResult> {
    info!("Running workload: {}", workload.name);
    let mut rng = StdRng::seed_from_u64(workload.seed);
    let node_ids: Vec<i16> = cluster.node_ids().iter().map(|n| n.value()).collect();
    if node_ids.is_empty() || workload.lines == 0 {
        bail!("workload {} has nothing to run against", workload.name);
    }

    let mut latest: HashMap<LineId, Bytes> = HashMap::new();
    let mut lines = Vec::with_capacity(workload.lines);
    for n in 0..workload.lines {
        let creator = node_ids[n % node_ids.len()];
        let data = Bytes::from(format!("init-{}", n));
        let line = match cluster.expect_op(creator, Op::put(data.clone()))? {
            OpValue::Ref(line) => line,
            other => bail!("PUT on node {} returned {:?}", creator, other),
        };
        latest.insert(line, data);
        lines.push(line);
    }

    let start = Instant::now();
    let mut latencies = Vec::with_capacity(workload.operations);
    let (mut reads, mut writes) = (0, 0);
    for n in 0..workload.operations {
        let node = node_ids[rng.gen_range(0..node_ids.len())];
        let line = lines[rng.gen_range(0..lines.len())];
        let began = Instant::now();
        if rng.gen::<f64>() < workload.write_ratio {
            let data = Bytes::from(format!("w{}@{}", n, node));
            cluster
                .expect_op(node, Op::set(line, data.clone()))
                .with_context(|| format!("write #{} to {}", n, line))?;
            latest.insert(line, data);
            writes += 1;
        } else {
            let value = cluster
                .expect_op(node, Op::get(line))
                .with_context(|| format!("read #{} of {}", n, line))?;
            let expected = latest.get(&line);
            if value.data() != expected {
                bail!(
                    "node {} read {:?} from {}, expected {:?}",
                    node,
                    value.data(),
                    line,
                    expected
                );
            }
            reads += 1;
        }
        latencies.push(began.elapsed());
    }
    let duration = start.elapsed();

    cluster.run_until_quiet()?;
    for line in &lines {
        cluster.check_coherence(*line)?;
    }

    latencies.sort();
    let average_latency = if latencies.is_empty() {
        Duration::ZERO
    } else {
        latencies.iter().sum::<Duration>() / latencies.len() as u32
    };
    let p95_latency = latencies
        .get(latencies.len() * 95 / 100)
        .copied()
        .unwrap_or_default();
    debug!("{}: {} reads, {} writes in {:?}", workload.name, reads, writes, duration);

    Ok(WorkloadResult {
        name: workload.name.clone(),
        reads,
        writes,
        duration,
        average_latency,
        p95_latency,
        network_stats: cluster.network().get_stats(),
    })
}
