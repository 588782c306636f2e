//! In-process execution on a bounded rayon pool

use std::sync::Arc;

use butterfly_common::{Error, Result};
use log::info;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{compute_packet, PacketResult, TaskExecutor};
use crate::cache::UtilityCache;
use crate::evaluator::{EvalContext, UtilityEvaluator};
use crate::inputs::SharedInputs;
use crate::partition::WorkPacket;

/// Drains the packet list with a fixed number of worker threads
pub struct LocalExecutor {
    pool: ThreadPool,
    evaluator: Arc<dyn UtilityEvaluator>,
    cache: Arc<UtilityCache>,
}

impl LocalExecutor {
    pub fn new(
        threads: usize,
        evaluator: Arc<dyn UtilityEvaluator>,
        cache: Arc<UtilityCache>,
    ) -> Result<Self> {
        if threads == 0 {
            return Err(Error::Configuration(
                "local executor needs at least one thread".to_string(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("access-worker-{i}"))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build worker pool: {e}")))?;

        Ok(Self {
            pool,
            evaluator,
            cache,
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl TaskExecutor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit(&self, packets: &[WorkPacket], inputs: &SharedInputs) -> Result<Vec<PacketResult>> {
        info!(
            "Running {} packets on {} local threads",
            packets.len(),
            self.threads()
        );
        let zone_ids = inputs.zone_ids();
        let ctx = EvalContext::new()
            .with_inputs(inputs)
            .with_cache(&self.cache);
        let evaluator = self.evaluator.as_ref();

        self.pool.install(|| {
            packets
                .par_iter()
                .map(|packet| compute_packet(packet, &zone_ids, evaluator, &ctx))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::FnEvaluator;
    use crate::inputs::sample_inputs;
    use crate::partition::calc_packet_ranges;

    fn cache(inputs: &SharedInputs) -> Arc<UtilityCache> {
        Arc::new(UtilityCache::new(inputs.cache_spec).unwrap())
    }

    #[test]
    fn test_local_runs_every_packet() {
        let inputs = sample_inputs(25);
        let eval = Arc::new(FnEvaluator::new(["id"], |zone, _| Ok(vec![zone as f64])));
        let executor = LocalExecutor::new(3, eval, cache(&inputs)).unwrap();
        let packets = calc_packet_ranges(25, 4).unwrap();

        let mut results = executor.submit(&packets, &inputs).unwrap();
        results.sort_by_key(|r| r.start);

        assert_eq!(results.len(), 7);
        let ids = inputs.zone_ids();
        for result in &results {
            for offset in 0..result.row_count() {
                assert_eq!(result.row(offset), &[ids[result.start + offset] as f32]);
            }
        }
    }

    #[test]
    fn test_local_fails_fast() {
        let inputs = sample_inputs(30);
        let poisoned = inputs.zone_ids()[17];
        let eval = Arc::new(FnEvaluator::new(["id"], move |zone, _| {
            if zone == poisoned {
                Err(Error::Computation {
                    zone,
                    message: "boom".to_string(),
                })
            } else {
                Ok(vec![1.0])
            }
        }));
        let executor = LocalExecutor::new(2, eval, cache(&inputs)).unwrap();
        let packets = calc_packet_ranges(30, 10).unwrap();

        let err = executor.submit(&packets, &inputs).unwrap_err();
        assert!(matches!(err, Error::Computation { zone, .. } if zone == poisoned));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let inputs = sample_inputs(1);
        let eval = Arc::new(FnEvaluator::new(["id"], |_, _| Ok(vec![0.0])));
        assert!(matches!(
            LocalExecutor::new(0, eval, cache(&inputs)),
            Err(Error::Configuration(_))
        ));
    }
}
