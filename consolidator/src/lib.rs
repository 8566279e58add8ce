//! A bounded pool of metric accumulators with periodic flushing.
//!
//! Many producers push metrics into a fixed set of accumulators. Periodically
//! the whole set is drained, handed to a downstream sink and replaced with
//! fresh accumulators. A slow sink stalls the flush, never the producers'
//! memory: the pool is bounded and the sink channel is bounded. See
//! [`consolidator::MetricConsolidator`] for the protocol.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod accumulator;
pub mod config;
pub mod consolidator;
pub mod generator;
pub mod metric;
pub mod metric_map;
mod pool;

pub use accumulator::Accumulator;
pub use consolidator::{Handle, MetricConsolidator};
pub use metric::Metric;
pub use metric_map::MetricMap;
