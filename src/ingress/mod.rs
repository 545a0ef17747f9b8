//! Ingress Pipeline
//!
//! Decouples the transport's completion path from command execution.
//!
//! ## Modules
//!
//! - `ring`: Lock-free single-producer / single-consumer byte ring for bulk data
//! - `pipeline`: `Ingress` intake plus the command and bulk workers
//!
//! Ring overflow uses a drop-on-full policy: a bulk message that does not fit
//! in the free space is discarded whole and counted in
//! [`ProxyStats`](crate::connection::ProxyStats).

pub mod pipeline;
pub mod ring;

pub use pipeline::{BulkItem, Ingress, WorkItem};
pub use ring::{ring_buffer, RingConsumer, RingError, RingProducer, DEFAULT_RING_CAPACITY};
