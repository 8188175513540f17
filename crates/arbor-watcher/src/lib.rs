//! Change sources feeding the ingestion gateway
//!
//! Two interchangeable [`arbor_pipeline::PathWatcher`] implementations:
//! [`LocalWatcher`] watches the repository through `notify`, and
//! [`IngressClient`] subscribes to a remote watcher over WebSocket.

pub mod filter;
pub mod ingress;
pub mod local;


pub use filter::{IgnoreRules, scan_repository};
pub use ingress::{IngressClient, IngressMessage, IngressSettings, OutboundMessage, backoff_delay};
pub use local::LocalWatcher;
