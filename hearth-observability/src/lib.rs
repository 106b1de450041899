//! Process-wide observability: the scribe (tracing initialization plus a
//! runtime-adjustable verbosity mask) and the statistics registries
//! consumed by the info endpoint.

pub mod scribe;
pub mod stats;

pub use scribe::Scribe;
pub use stats::Stats;
