//! Packet execution strategies
//!
//! Both strategies implement [`TaskExecutor`]: every packet is evaluated,
//! results come back in arbitrary order, and the first failure aborts the job
//! with no partial output.

pub mod bundle;
pub mod distributed;
pub mod local;

use butterfly_common::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::evaluator::{EvalContext, UtilityEvaluator};
use crate::inputs::SharedInputs;
use crate::partition::WorkPacket;

pub use bundle::{JobBundle, PacketTask, TaskOutcome, TaskReply};
pub use distributed::{DistributedExecutor, JobTransport, LoopbackTransport};
pub use local::LocalExecutor;

/// Utilities for one packet: `row_count × n_alternatives`, row-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketResult {
    pub packet_id: u32,
    pub start: usize,
    pub end: usize,
    pub n_alternatives: usize,
    pub values: Vec<f32>,
}

impl PacketResult {
    pub fn row_count(&self) -> usize {
        self.end - self.start + 1
    }

    /// Row for position `start + offset`
    pub fn row(&self, offset: usize) -> &[f32] {
        let from = offset * self.n_alternatives;
        &self.values[from..from + self.n_alternatives]
    }
}

/// Runs a set of packets to completion
pub trait TaskExecutor {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Evaluate every packet, blocking until all finish or one fails
    fn submit(&self, packets: &[WorkPacket], inputs: &SharedInputs) -> Result<Vec<PacketResult>>;
}

/// Evaluate the zones at positions `packet.start..=packet.end`
pub fn compute_packet(
    packet: &WorkPacket,
    zone_ids: &[u32],
    evaluator: &dyn UtilityEvaluator,
    ctx: &EvalContext<'_>,
) -> Result<PacketResult> {
    let n_alternatives = evaluator.n_alternatives();
    let zones = zone_ids.get(packet.start..=packet.end).ok_or_else(|| {
        Error::Configuration(format!(
            "packet {} [{}, {}] outside the {}-zone list",
            packet.id,
            packet.start,
            packet.end,
            zone_ids.len()
        ))
    })?;

    let mut values = Vec::with_capacity(zones.len() * n_alternatives);
    for &zone in zones {
        let row = evaluator.evaluate(zone, ctx)?;
        if row.len() != n_alternatives {
            return Err(Error::Computation {
                zone,
                message: format!(
                    "evaluator returned {} values, expected {n_alternatives}",
                    row.len()
                ),
            });
        }
        if let Some(bad) = row.iter().find(|v| !v.is_finite()) {
            return Err(Error::Computation {
                zone,
                message: format!("non-finite utility {bad}"),
            });
        }
        values.extend(row.into_iter().map(|v| v as f32));
    }

    debug!(
        "packet {} [{}, {}]: {} zones",
        packet.id,
        packet.start,
        packet.end,
        zones.len()
    );

    Ok(PacketResult {
        packet_id: packet.id,
        start: packet.start,
        end: packet.end,
        n_alternatives,
        values,
    })
}
