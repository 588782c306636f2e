//! End-to-end accessibility runs through the public library API
//!
//! Inputs are built from an in-memory zone CSV the same way the `build`
//! command builds them from disk.

use std::sync::Arc;

use butterfly_access::config::CacheDims;
use butterfly_access::evaluator::{AttributeEvaluator, ConstantEvaluator, GravityEvaluator};
use butterfly_access::size_terms::{compute_size_terms, ExpConstantTable};
use butterfly_access::{
    compute_accessibilities, CacheSpec, DistributedExecutor, Error, EvalContext, FnEvaluator,
    LocalExecutor, LoopbackTransport, RunContext, SchoolSegments, SegmentIndexer, SharedInputs,
    UtilityCache, UtilityEvaluator, ZoneSystem,
};

/// Sparse zone ids 2, 5, 8, ... laid out on a 5-wide grid
fn zone_csv(n_zones: u32) -> String {
    let mut csv = String::from("zone,x,y,gs_district,hs_district,jobs,households\n");
    for i in 0..n_zones {
        let id = 2 + 3 * i;
        csv.push_str(&format!(
            "{id},{},{},{},{},{},{}\n",
            i % 5,
            i / 5,
            1 + i % 4,
            if i % 2 == 0 { 20 } else { 30 },
            (i * 7) % 11,
            (i * 3) % 5
        ));
    }
    csv
}

fn shared_inputs(n_zones: u32) -> SharedInputs {
    let zones = ZoneSystem::from_reader(zone_csv(n_zones).as_bytes()).unwrap();
    let segments = vec!["jobs".to_string(), "households".to_string()];
    let ctx = EvalContext::new().with_zones(&zones);

    let size_terms = compute_size_terms(
        &zones,
        segments.clone(),
        &AttributeEvaluator::new(segments),
        &ctx,
    )
    .unwrap();
    let constants = ConstantEvaluator::new(
        vec!["auto".into(), "transit".into()],
        vec![
            vec![0.0, -1.0],
            vec![0.0, -0.5],
            vec![0.0, 0.0],
            vec![0.5, 0.5],
        ],
    )
    .unwrap();
    let exp_constants = ExpConstantTable::compute(&constants, &ctx).unwrap();

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

fn gravity() -> Arc<dyn UtilityEvaluator> {
    Arc::new(GravityEvaluator::new(
        vec!["jobs".into(), "households".into()],
        0.4,
        3,
    ))
}

#[test]
fn test_local_and_distributed_tables_match() {
    let inputs = shared_inputs(47);
    let eval = gravity();

    let cache = Arc::new(UtilityCache::new(inputs.cache_spec).unwrap());
    let local = LocalExecutor::new(3, Arc::clone(&eval), Arc::clone(&cache)).unwrap();
    let local_table = compute_accessibilities(&local, &inputs, 10, 2).unwrap();

    let distributed =
        DistributedExecutor::new(LoopbackTransport::new(4, Arc::clone(&eval)).unwrap(), 2);
    let distributed_table = compute_accessibilities(&distributed, &inputs, 10, 2).unwrap();

    assert_eq!(local_table, distributed_table);
    assert_eq!(local_table.max_zone(), inputs.max_zone());
    assert!(!cache.is_empty());
}

#[test]
fn test_table_rows_follow_zone_ids() {
    let inputs = shared_inputs(12);
    let eval = Arc::new(FnEvaluator::new(["id", "double"], |zone, _| {
        Ok(vec![f64::from(zone), 2.0 * f64::from(zone)])
    }));
    let cache = Arc::new(UtilityCache::new(inputs.cache_spec).unwrap());
    let executor = LocalExecutor::new(2, eval, cache).unwrap();

    let table = compute_accessibilities(&executor, &inputs, 5, 2).unwrap();
    let valid = inputs.zone_ids();
    for zone in 0..=table.max_zone() {
        let row = table.row(zone).unwrap();
        if valid.contains(&zone) {
            assert_eq!(row, &[zone as f32, 2.0 * zone as f32][..]);
        } else {
            assert_eq!(row, &[0.0, 0.0][..], "zone {zone} is not in the zone file");
        }
    }
}

#[test]
fn test_one_failing_packet_fails_the_job() {
    let inputs = shared_inputs(30);
    // second of three packets of 10
    let poisoned = inputs.zone_ids()[14];
    let failing = move |zone: u32, _: &EvalContext<'_>| {
        if zone == poisoned {
            Err(Error::Computation {
                zone,
                message: "unreachable destination".to_string(),
            })
        } else {
            Ok(vec![1.0])
        }
    };

    let cache = Arc::new(UtilityCache::new(inputs.cache_spec).unwrap());
    let local = LocalExecutor::new(2, Arc::new(FnEvaluator::new(["v"], failing)), cache).unwrap();
    let err = compute_accessibilities(&local, &inputs, 10, 1).unwrap_err();
    assert!(err.is_computation());
    assert!(err.to_string().contains(&poisoned.to_string()));

    let transport = LoopbackTransport::new(3, Arc::new(FnEvaluator::new(["v"], failing))).unwrap();
    let distributed = DistributedExecutor::new(transport, 1);
    let err = compute_accessibilities(&distributed, &inputs, 10, 1).unwrap_err();
    match err {
        Error::Computation { zone, .. } => assert_eq!(zone, poisoned),
        other => panic!("expected a computation error, got {other}"),
    }
}

#[test]
fn test_school_segments_ignore_zone_order() {
    let zones = ZoneSystem::from_reader(zone_csv(20).as_bytes()).unwrap();
    let indexer = SegmentIndexer::default();

    let forward = SchoolSegments::build(&indexer, zones.districts()).unwrap();
    let reversed: Vec<_> = zones.districts().collect::<Vec<_>>().into_iter().rev().collect();
    let backward = SchoolSegments::build(&indexer, reversed).unwrap();

    assert_eq!(forward.table().names(), backward.table().names());
    assert_eq!(
        forward.table().index_to_name(),
        backward.table().index_to_name()
    );
    // preschool, 4 grade districts, 2 high districts, 2 university segments
    assert_eq!(forward.len(), 9);
}

#[test]
fn test_zone_id_beyond_pair_key_is_configuration_error() {
    let csv = "zone,x,y,gs_district,hs_district,jobs\n\
               7,0,0,1,20,3\n\
               100000,1,0,1,20,4\n";
    let zones = ZoneSystem::from_reader(csv.as_bytes()).unwrap();
    let dims = CacheDims {
        max_tap: 0,
        segments: 1,
        periods: 1,
    };

    let err = RunContext::new(&zones, dims).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "got {err}");
    assert!(err.to_string().contains("100000"));
}
