//! Halyard node: peer switch, transaction gossip and process plumbing.
//!
//! The node wires together:
//! - the in-memory transaction pool and its gossip reactor
//! - the switch, which accepts and dials peers over TCP
//! - configuration, logging, metrics and graceful shutdown

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod shutdown;
pub mod switch;

pub use config::{NodeConfig, P2pConfig};
pub use error::NodeError;
pub use logging::{init_logging, LogFormat};
pub use metrics::NodeMetrics;
pub use node::Node;
pub use shutdown::ShutdownController;
pub use switch::{Switch, SwitchBuilder};
