//! Job-scoped read-only inputs shared by every packet

use serde::{Deserialize, Serialize};

use crate::cache::CacheSpec;
use crate::size_terms::{ExpConstantTable, SizeTermTable};
use crate::zones::ZoneSystem;

/// Everything a worker needs besides its packet descriptor
///
/// Built once per job. Local workers borrow it; remote nodes receive it once
/// inside the job bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedInputs {
    pub zones: ZoneSystem,
    pub size_terms: SizeTermTable,
    pub exp_constants: ExpConstantTable,
    /// Dimensions for node-local utility caches
    pub cache_spec: CacheSpec,
}

impl SharedInputs {
    /// Ordered valid-zone list the packets index into
    pub fn zone_ids(&self) -> Vec<u32> {
        self.zones.zone_ids()
    }

    pub fn max_zone(&self) -> u32 {
        self.zones.max_zone()
    }
}

/// Small sparse zone system: ids `1, 3, 5, ...` on a line, one "jobs" segment
#[cfg(test)]
pub(crate) fn sample_inputs(n_zones: u32) -> SharedInputs {
    use crate::evaluator::{ConstantEvaluator, EvalContext};
    use crate::zones::Zone;

    let zones: Vec<Zone> = (0..n_zones)
        .map(|i| Zone {
            id: 2 * i + 1,
            x: f64::from(i),
            y: 0.0,
            gs_district: 1 + i % 3,
            hs_district: 10,
            attributes: vec![f64::from(i % 4)],
        })
        .collect();
    let zones = ZoneSystem::new(vec!["jobs".to_string()], zones).unwrap();

    let mut size_terms = SizeTermTable::new(vec!["jobs".to_string()], zones.max_zone());
    for zone in zones.zones() {
        size_terms.set(zone.id, 0, zone.attributes[0]).unwrap();
    }

    let constants =
        ConstantEvaluator::new(vec!["all".to_string()], vec![vec![0.0]; 4]).unwrap();
    let exp_constants = ExpConstantTable::compute(&constants, &EvalContext::new()).unwrap();

    let cache_spec = CacheSpec {
        max_zone: zones.max_zone(),
        max_tap: 0,
        segments: 1,
        periods: 1,
    };

    SharedInputs {
        zones,
        size_terms,
        exp_constants,
        cache_spec,
    }
}
