//! # Galaxy Testing
//!
//! In-memory clusters for exercising the coherence engine end to end: a
//! deterministic message bus with injectable loss, duplication and
//! partitions, recording collaborators, a scripted central server and a
//! `TestCluster` harness that wires them to one engine per node.
//!
//! ```rust
//! use bytes::Bytes;
//! use galaxy_engine::Op;
//! use galaxy_testing::TestCluster;
//!
//! # fn main() -> anyhow::Result<()> {
//! let cluster = TestCluster::new(3, false)?;
//! let line = cluster.expect_op(1, Op::put(Bytes::from_static(b"hello")))?;
//! let line = line.as_ref_id().expect("PUT returns the new id");
//! let value = cluster.expect_op(2, Op::get(line))?;
//! assert_eq!(value.data(), Some(&Bytes::from_static(b"hello")));
//! cluster.check_coherence(line)?;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod doubles;
pub mod fault_injection;
pub mod network_sim;
pub mod scenarios;
pub mod server;

pub use cluster::{ClusterNode, TestCluster};
pub use doubles::{
    BackupRecord, BusRefAllocator, IdSequence, ListenerEvent, RecordingBackup, RecordingListener,
};
pub use fault_injection::FaultType;
pub use network_sim::{Endpoint, NetworkConditions, NetworkSimulator, NetworkStats, SimulatedNetwork};
pub use scenarios::{run_workload, Workload, WorkloadResult};
pub use server::ScriptedServer;
