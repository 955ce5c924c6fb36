//! stdio-bridge: HTTP relay for line-delimited JSON-RPC subprocesses.
//!
//! A single child process (typically an MCP stdio server) is spawned at
//! startup. Each HTTP request body is written to its stdin as one line of
//! JSON and the matching reply from its stdout is returned as the response.

pub mod correlation;
pub mod error;
pub mod framing;
pub mod health;
pub mod service;
pub mod stats;
pub mod subprocess;
pub mod transport;

pub use correlation::{CorrelationMode, Correlator, RequestKey, Waiter};
pub use error::RelayError;
pub use health::{BRIDGE_VERSION, ExitInfo, HealthSnapshot, ProcessState, SubprocessStatus};
pub use service::{RelayConfig, RelayService};
pub use stats::{RelayStats, StatsSnapshot};
pub use subprocess::{
    ChannelError, MessageSink, SpawnError, SubprocessChannel, SubprocessConfig,
};
