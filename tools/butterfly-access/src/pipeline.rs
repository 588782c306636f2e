//! Accessibility build pipeline
//!
//! Zones → segments and cache (`RunContext`) → size terms and constants →
//! packets → executor → merge → persisted table. The table is written only
//! after every packet succeeded.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use butterfly_common::{Error, Result};
use log::info;

use crate::cache::{CacheSpec, UtilityCache};
use crate::config::{AccessConfig, CacheDims, ExecutorKind};
use crate::evaluator::{
    AttributeEvaluator, ConstantEvaluator, EvalContext, GravityEvaluator, UtilityEvaluator,
};
use crate::executor::{DistributedExecutor, LocalExecutor, LoopbackTransport, TaskExecutor};
use crate::inputs::SharedInputs;
use crate::merge::merge;
use crate::partition::calc_packet_ranges;
use crate::segments::{SchoolSegments, SegmentIndexer, WorkSegments};
use crate::size_terms::{
    compute_school_size_terms, compute_size_terms, compute_worker_size_terms,
    school_segment_factors, ExpConstantTable, SegmentFactors, SizeTermTable,
};
use crate::table::AccessibilityTable;
use crate::zones::ZoneSystem;

/// Run-scoped state: segment maps and the shared utility cache
///
/// Created once per run and dropped with it; every worker of the run borrows
/// the same cache.
#[derive(Debug)]
pub struct RunContext {
    indexer: SegmentIndexer,
    school: SchoolSegments,
    work: WorkSegments,
    cache: Arc<UtilityCache>,
}

impl RunContext {
    pub fn new(zones: &ZoneSystem, dims: CacheDims) -> Result<Self> {
        let indexer = SegmentIndexer::default();
        let school = SchoolSegments::build(&indexer, zones.districts())?;
        let cache = UtilityCache::new(CacheSpec {
            max_zone: zones.max_zone(),
            max_tap: dims.max_tap,
            segments: dims.segments,
            periods: dims.periods,
        })?;

        Ok(Self {
            indexer,
            school,
            work: WorkSegments::new(),
            cache: Arc::new(cache),
        })
    }

    pub fn indexer(&self) -> &SegmentIndexer {
        &self.indexer
    }

    pub fn school(&self) -> &SchoolSegments {
        &self.school
    }

    pub fn work(&self) -> &WorkSegments {
        &self.work
    }

    pub fn cache(&self) -> &Arc<UtilityCache> {
        &self.cache
    }

    pub fn cache_spec(&self) -> CacheSpec {
        *self.cache.spec()
    }
}

/// Partition, execute and merge one accessibility job
pub fn compute_accessibilities(
    executor: &dyn TaskExecutor,
    inputs: &SharedInputs,
    packet_size: usize,
    n_alternatives: usize,
) -> Result<AccessibilityTable> {
    let zone_ids = inputs.zone_ids();
    let packets = calc_packet_ranges(zone_ids.len(), packet_size)?;
    info!(
        "{} zones in {} packets of up to {} ({} executor)",
        zone_ids.len(),
        packets.len(),
        packet_size,
        executor.name()
    );

    let results = executor.submit(&packets, inputs)?;
    merge(inputs.max_zone(), n_alternatives, &zone_ids, results)
}

/// Setup tables kept for downstream location choice models
#[derive(Debug, Default)]
pub struct ChoiceModelTerms {
    /// Per school segment, when `school.size_attributes` is configured
    pub school_size_terms: Option<SizeTermTable>,
    /// Needs `school.enrollment_attribute` as well
    pub school_factors: Option<SegmentFactors>,
    /// Per occupation segment, when `work.size_attributes` is configured
    pub worker_size_terms: Option<SizeTermTable>,
}

/// Outcome of [`build_accessibilities`]
#[derive(Debug)]
pub struct AccessResult {
    pub table: AccessibilityTable,
    /// Empty when the table was reused
    pub terms: ChoiceModelTerms,
    pub output_path: PathBuf,
    /// Table loaded from an existing output instead of recomputed
    pub reused: bool,
    pub n_zones: usize,
    pub n_packets: usize,
    pub executor: &'static str,
    pub cache_entries: usize,
    pub build_time_ms: u64,
}

/// Build (or reuse) the accessibility table described by `config`
pub fn build_accessibilities(config: &AccessConfig, reuse: bool) -> Result<AccessResult> {
    let start_time = Instant::now();

    if reuse && config.output_file.exists() {
        println!("Reusing {}...", config.output_file.display());
        let table = AccessibilityTable::read_csv(&config.output_file)?;
        if table.alternative_names() != config.size_attributes.as_slice() {
            return Err(Error::InvalidInput(format!(
                "{} has alternatives {:?}, configuration expects {:?}",
                config.output_file.display(),
                table.alternative_names(),
                config.size_attributes
            )));
        }
        println!("  ✓ {} rows", table.max_zone() as usize + 1);
        return Ok(AccessResult {
            output_path: config.output_file.clone(),
            reused: true,
            n_zones: 0,
            n_packets: 0,
            executor: "none",
            cache_entries: 0,
            build_time_ms: start_time.elapsed().as_millis() as u64,
            table,
            terms: ChoiceModelTerms::default(),
        });
    }

    println!("Loading zones...");
    let zones = ZoneSystem::read_csv(&config.zone_file)?;
    println!(
        "  ✓ {} zones (max id {}), {} attributes",
        zones.len(),
        zones.max_zone(),
        zones.attribute_names().len()
    );

    let run = RunContext::new(&zones, config.cache)?;
    println!(
        "  ✓ {} school segments, {} work segments",
        run.school().len(),
        run.work().table().len()
    );

    println!("Computing size terms...");
    let ctx = EvalContext::new().with_zones(&zones);
    let size_eval = AttributeEvaluator::new(config.size_attributes.clone());
    let size_terms = compute_size_terms(&zones, config.size_attributes.clone(), &size_eval, &ctx)?;
    println!("  ✓ {} segments", size_terms.n_segments());

    let mut terms = ChoiceModelTerms::default();
    if let Some(attrs) = &config.school_size_attributes {
        let school_eval = AttributeEvaluator::new(attrs.clone());
        let school_terms = compute_school_size_terms(&zones, run.school(), &school_eval, &ctx)?;
        println!("  ✓ school size terms over {} segments", school_terms.n_segments());
        if let Some(enrollment) = &config.enrollment_attribute {
            terms.school_factors = Some(school_segment_factors(
                &school_terms,
                run.school(),
                &zones,
                enrollment,
            )?);
            println!("  ✓ school segment factors");
        }
        terms.school_size_terms = Some(school_terms);
    }
    if let Some(attrs) = &config.work_size_attributes {
        let work_eval = AttributeEvaluator::new(attrs.clone());
        let work_terms = compute_worker_size_terms(&zones, run.work(), &work_eval, &ctx)?;
        println!("  ✓ work size terms over {} occupations", work_terms.n_segments());
        terms.worker_size_terms = Some(work_terms);
    }

    println!("Computing constants...");
    let constant_eval = ConstantEvaluator::new(config.modes.clone(), config.constants.clone())?;
    let exp_constants = ExpConstantTable::compute(&constant_eval, &ctx)?;
    println!("  ✓ {} modes", exp_constants.modes().len());

    let n_zones = zones.len();
    let inputs = SharedInputs {
        cache_spec: run.cache_spec(),
        zones,
        size_terms,
        exp_constants,
    };
    let evaluator: Arc<dyn UtilityEvaluator> = Arc::new(GravityEvaluator::new(
        config.size_attributes.clone(),
        config.decay,
        config.market_segment,
    ));
    let n_alternatives = evaluator.n_alternatives();

    let executor: Box<dyn TaskExecutor> = match config.executor {
        ExecutorKind::Local { threads } => Box::new(LocalExecutor::new(
            threads,
            Arc::clone(&evaluator),
            Arc::clone(run.cache()),
        )?),
        ExecutorKind::Distributed { nodes } => Box::new(DistributedExecutor::new(
            LoopbackTransport::new(nodes, Arc::clone(&evaluator))?,
            n_alternatives,
        )),
    };

    println!("Computing accessibilities ({})...", executor.name());
    let n_packets = calc_packet_ranges(n_zones, config.packet_size)?.len();
    let table = compute_accessibilities(
        executor.as_ref(),
        &inputs,
        config.packet_size,
        n_alternatives,
    )?
    .with_labels(config.index_label.clone(), config.size_attributes.clone())?;
    println!("  ✓ {} packets merged", n_packets);

    if let Some(parent) = config.output_file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    table.write_csv(&config.output_file)?;
    println!("  ✓ Wrote {}", config.output_file.display());

    Ok(AccessResult {
        table,
        terms,
        output_path: config.output_file.clone(),
        reused: false,
        n_zones,
        n_packets,
        executor: executor.name(),
        cache_entries: run.cache().len(),
        build_time_ms: start_time.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::FnEvaluator;
    use crate::inputs::sample_inputs;

    #[test]
    fn test_run_context_segments() {
        let inputs = sample_inputs(6);
        let run = RunContext::new(
            &inputs.zones,
            CacheDims {
                max_tap: 5,
                segments: 2,
                periods: 3,
            },
        )
        .unwrap();

        // gs districts 1..=3, one hs district
        assert_eq!(run.school().len(), 1 + 3 + 1 + 2);
        assert_eq!(run.work().table().len(), 6);
        assert_eq!(run.cache_spec().max_zone, inputs.max_zone());
        assert!(run.cache().is_empty());
    }

    #[test]
    fn test_compute_accessibilities_fills_valid_zones() {
        let inputs = sample_inputs(7);
        let eval = Arc::new(FnEvaluator::new(["id"], |zone, _| Ok(vec![f64::from(zone)])));
        let cache = Arc::new(UtilityCache::new(inputs.cache_spec).unwrap());
        let executor = LocalExecutor::new(2, eval, cache).unwrap();

        let table = compute_accessibilities(&executor, &inputs, 3, 1).unwrap();
        assert_eq!(table.max_zone(), 13);
        for zone in 0..=13u32 {
            let expected = if zone % 2 == 1 { zone as f32 } else { 0.0 };
            assert_eq!(table.get(zone, 0), Some(expected), "zone {zone}");
        }
    }

    fn write_run(dir: &std::path::Path) -> AccessConfig {
        let zones = "\
zone,x,y,gs_district,hs_district,jobs,households,pre,gs,hs,univ,univ_nt,enroll
1,0,0,3,20,10,5,1,2,3,0,0,0
4,2,0,0,21,4,2,0,1,1,5,1,100
8,2,1,0,21,3,9,2,2,2,1,0,50
";
        let config = r#"
[acc]
zone_file = "zones.csv"
output_file = "acc.csv"
threads = 2

[size]
attributes = ["jobs"]

[school]
size_attributes = ["pre", "gs", "hs", "univ", "univ_nt"]
enrollment_attribute = "enroll"

[work]
size_attributes = ["jobs", "jobs", "households", "jobs", "households", "jobs"]

[constants]
modes = ["all"]
market_0 = [0.0]
market_1 = [0.0]
market_2 = [0.0]
market_3 = [0.0]
"#;
        std::fs::write(dir.join("zones.csv"), zones).unwrap();
        std::fs::write(dir.join("access.toml"), config).unwrap();
        AccessConfig::load(dir.join("access.toml")).unwrap()
    }

    #[test]
    fn test_build_keeps_choice_model_terms() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_run(dir.path());
        let result = build_accessibilities(&config, false).unwrap();

        let school = result.terms.school_size_terms.as_ref().unwrap();
        let segment = |name: &str| {
            school
                .segment_names()
                .iter()
                .position(|n| n == name)
                .unwrap()
        };
        assert_eq!(school.get(1, segment("k-8_3")), 2.0);
        assert_eq!(school.get(4, segment("unified k-8_21")), 1.0);
        assert_eq!(school.get(4, segment("unified 9-12_21")), 1.0);
        assert_eq!(school.get(8, segment("preschool")), 2.0);

        let factors = result.terms.school_factors.as_ref().unwrap();
        assert_eq!(factors.get(1, segment("9-12_20")), 1.0);
        assert_eq!(factors.get(1, segment("univ typical")), 0.0);
        assert!((factors.get(4, segment("univ typical")) - 100.0 / 6.0).abs() < 1e-9);
        assert_eq!(factors.get(8, segment("univ non-typical")), 50.0);

        let work = result.terms.worker_size_terms.as_ref().unwrap();
        assert_eq!(work.n_segments(), 6);
        assert_eq!(work.get(8, 0), 3.0);
        assert_eq!(work.get(8, 2), 9.0);
        assert!(dir.path().join("acc.csv").exists());
    }

    #[test]
    fn test_reused_table_has_no_terms() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_run(dir.path());
        build_accessibilities(&config, false).unwrap();

        let reused = build_accessibilities(&config, true).unwrap();
        assert!(reused.reused);
        assert!(reused.terms.school_size_terms.is_none());
        assert!(reused.terms.worker_size_terms.is_none());
    }
}
