//! Arbor - replicated state core for a high-availability graph database.
//!
//! Arbor keeps a cluster of graph database servers in sync by replicating
//! transaction state deltas through the Raft consensus protocol. The
//! database feeds deltas into the core as transactions run; committed
//! batches are replicated to a majority and applied, in order, on every
//! server.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Arbor server                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Host integration: StateDeltaApplier | reset / no-op hooks  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Consensus: RaftServer | LogEntryBuffer | ReplicationLog    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: Coordination (peer-id-addressed RPC)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Durability: RaftStorage (term | vote | log)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use arbor::config::RaftConfig;
//! use arbor::delta::{StateDelta, StateDeltaApplier};
//! use arbor::raft::local::LocalCluster;
//! use arbor::raft::RaftServer;
//!
//! struct Applier;
//!
//! impl StateDeltaApplier for Applier {
//!     fn apply(&self, delta: &StateDelta) {
//!         println!("applying {:?}", delta);
//!     }
//! }
//!
//! fn main() -> arbor::Result<()> {
//!     let config = RaftConfig {
//!         server_id: 1,
//!         cluster_size: 1,
//!         durability_dir: "/tmp/arbor/1".into(),
//!         ..RaftConfig::default()
//!     };
//!
//!     let cluster = LocalCluster::new();
//!     let server = Arc::new(RaftServer::new(
//!         config,
//!         cluster.coordination(1),
//!         Arc::new(Applier),
//!         Box::new(|| {}),
//!         Box::new(|| {}),
//!     )?);
//!     cluster.register(1, Arc::clone(&server));
//!     server.start()?;
//!     // ... feed deltas through server.emplace(...)
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod delta;
pub mod error;
pub mod observability;
pub mod raft;
pub mod types;

pub use error::{ArborError, Result};
