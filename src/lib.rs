// Core modules for the cinderkv replicated key-value store
pub mod aof; // append-only log: append + replay + compaction
pub mod engine; // command execution (store + log + fan-out)
pub mod net; // listener setup, cancellable accept, client front end
pub mod protocol; // shared command codec + client request parsing
pub mod replication; // leader fan-out and follower link
pub mod shutdown; // cooperative cancellation token
pub mod storage; // TTL store engine + expiry sweep

// Re-export all public items from modules for easier access
pub use aof::*;
pub use engine::*;
pub use net::*;
pub use protocol::*;
pub use replication::*;
pub use shutdown::*;
pub use storage::*;

use std::time::Duration;

/// Default client-facing address
pub const DEFAULT_ADDR: &str = "0.0.0.0:7400";
/// Default append-only log path
pub const DEFAULT_AOF_PATH: &str = "cinderkv.aof";
/// Default interval between expiry sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Default interval between log compactions
pub const COMPACT_INTERVAL: Duration = Duration::from_secs(15);
