//! # Butterfly-access
//!
//! Zone accessibility builder. Raw district and occupation codes become stable
//! segment indices, size terms and constants are computed once, and the
//! per-zone evaluation runs in fixed-size packets on a local thread pool or on
//! distributed nodes. Packet results are merged into one dense table indexed
//! by zone id. Path-level utilities are shared between workers through a
//! run-wide concurrent cache.

pub mod cache;
pub mod cli;
pub mod config;
pub mod evaluator;
pub mod executor;
pub mod inputs;
pub mod merge;
pub mod partition;
pub mod pipeline;
pub mod segments;
pub mod size_terms;
pub mod table;
pub mod zones;

pub use butterfly_common::{Error, Result};
pub use cache::{CacheSpec, UtilityCache, UtilityKey, PAIR_KEY_FACTOR};
pub use config::{AccessConfig, Properties, PropertySource};
pub use evaluator::{EvalContext, FnEvaluator, UtilityEvaluator};
pub use executor::{
    DistributedExecutor, JobTransport, LocalExecutor, LoopbackTransport, PacketResult,
    TaskExecutor,
};
pub use inputs::SharedInputs;
pub use merge::merge;
pub use partition::{calc_packet_ranges, WorkPacket};
pub use pipeline::{build_accessibilities, compute_accessibilities, RunContext};
pub use segments::{SchoolSegments, SegmentIndexer, SegmentTable, WorkSegments, UNIFIED_DISTRICT_OFFSET};
pub use table::AccessibilityTable;
pub use zones::ZoneSystem;
