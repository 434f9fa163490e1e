//! Observability vocabulary shared by every layer.
//!
//! Library code emits `tracing` events tagged with an `event` name from
//! [`events`] and a `component`. It never installs a global subscriber.

pub mod events;
pub mod fields;
