//! Size terms, school segment factors and exponentiated constants
//!
//! All three are computed once at setup, before packets are dispatched, and
//! are read-only afterwards.

use butterfly_common::{Error, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::evaluator::{EvalContext, UtilityEvaluator};
use crate::segments::{SchoolSegments, WorkSegments};
use crate::zones::ZoneSystem;

/// Number of market segments; constants carry one extra "total" row
pub const MARKET_SEGMENTS: usize = 3;

/// Alternatives returned by a school size term evaluator, in order
pub const SCHOOL_SIZE_ALTERNATIVES: [&str; 5] = [
    "preschool",
    "grade school",
    "high school",
    "univ typical",
    "univ non-typical",
];

/// Dense (zone, segment) → non-negative weight table over `[0, max_zone]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeTermTable {
    segment_names: Vec<String>,
    max_zone: u32,
    values: Vec<f64>,
    has_size_term: Vec<bool>,
}

impl SizeTermTable {
    pub fn new(segment_names: Vec<String>, max_zone: u32) -> Self {
        let rows = max_zone as usize + 1;
        Self {
            values: vec![0.0; rows * segment_names.len()],
            has_size_term: vec![false; rows],
            segment_names,
            max_zone,
        }
    }

    /// Store a weight; negative or non-finite weights are computation errors
    pub fn set(&mut self, zone: u32, segment: usize, value: f64) -> Result<()> {
        if zone > self.max_zone {
            return Err(Error::Lookup(format!(
                "zone {zone} beyond size term table (max {})",
                self.max_zone
            )));
        }
        let n = self.segment_names.len();
        if segment >= n {
            return Err(Error::Lookup(format!(
                "size term segment {segment} out of range ({n} segments)"
            )));
        }
        if !value.is_finite() || value < 0.0 {
            return Err(Error::Computation {
                zone,
                message: format!(
                    "size term for segment '{}' is {value}",
                    self.segment_names[segment]
                ),
            });
        }

        self.values[zone as usize * n + segment] = value;
        if value > 0.0 {
            self.has_size_term[zone as usize] = true;
        }
        Ok(())
    }

    /// Weight for a zone and segment, 0 outside the table
    pub fn get(&self, zone: u32, segment: usize) -> f64 {
        self.row(zone).get(segment).copied().unwrap_or(0.0)
    }

    pub fn row(&self, zone: u32) -> &[f64] {
        if zone > self.max_zone {
            return &[];
        }
        let n = self.segment_names.len();
        let start = zone as usize * n;
        &self.values[start..start + n]
    }

    pub fn has_size_term(&self, zone: u32) -> bool {
        self.has_size_term
            .get(zone as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn segment_names(&self) -> &[String] {
        &self.segment_names
    }

    pub fn n_segments(&self) -> usize {
        self.segment_names.len()
    }

    pub fn max_zone(&self) -> u32 {
        self.max_zone
    }

    pub fn segment_total(&self, segment: usize) -> f64 {
        (0..=self.max_zone).map(|z| self.get(z, segment)).sum()
    }
}

/// Evaluate every zone in parallel, checking the width of each result
fn evaluate_zones(
    zones: &ZoneSystem,
    evaluator: &dyn UtilityEvaluator,
    ctx: &EvalContext<'_>,
    width: usize,
) -> Result<Vec<(u32, Vec<f64>)>> {
    zones
        .zones()
        .par_iter()
        .map(|zone| {
            let values = evaluator.evaluate(zone.id, ctx)?;
            if values.len() != width {
                return Err(Error::Computation {
                    zone: zone.id,
                    message: format!("evaluator returned {} values, expected {width}", values.len()),
                });
            }
            Ok((zone.id, values))
        })
        .collect()
}

fn check_width(evaluator: &dyn UtilityEvaluator, expected: usize, what: &str) -> Result<()> {
    if evaluator.n_alternatives() != expected {
        return Err(Error::Configuration(format!(
            "{what} evaluator has {} alternatives, expected {expected}",
            evaluator.n_alternatives()
        )));
    }
    Ok(())
}

fn report_missing(table: &SizeTermTable, zones: &ZoneSystem, what: &str) {
    let missing = zones
        .zones()
        .iter()
        .filter(|z| !table.has_size_term(z.id))
        .count();
    if missing > 0 {
        warn!("{missing} of {} zones have no {what} size term", zones.len());
    }
}

/// General size terms: one evaluator alternative per segment
pub fn compute_size_terms(
    zones: &ZoneSystem,
    segment_names: Vec<String>,
    evaluator: &dyn UtilityEvaluator,
    ctx: &EvalContext<'_>,
) -> Result<SizeTermTable> {
    check_width(evaluator, segment_names.len(), "size term")?;

    let mut table = SizeTermTable::new(segment_names, zones.max_zone());
    for (zone, values) in evaluate_zones(zones, evaluator, ctx, table.n_segments())? {
        for (segment, value) in values.into_iter().enumerate() {
            table.set(zone, segment, value)?;
        }
    }

    report_missing(&table, zones, "general");
    info!(
        "Size terms: {} segments for {} zones",
        table.n_segments(),
        zones.len()
    );
    Ok(table)
}

/// Work location size terms, one alternative per occupation segment
pub fn compute_worker_size_terms(
    zones: &ZoneSystem,
    work: &WorkSegments,
    evaluator: &dyn UtilityEvaluator,
    ctx: &EvalContext<'_>,
) -> Result<SizeTermTable> {
    compute_size_terms(zones, work.table().names(), evaluator, ctx)
}

/// School location size terms
///
/// The evaluator returns the five [`SCHOOL_SIZE_ALTERNATIVES`]; grade and high
/// school values are stored under the zone's own district segment.
pub fn compute_school_size_terms(
    zones: &ZoneSystem,
    school: &SchoolSegments,
    evaluator: &dyn UtilityEvaluator,
    ctx: &EvalContext<'_>,
) -> Result<SizeTermTable> {
    check_width(evaluator, SCHOOL_SIZE_ALTERNATIVES.len(), "school size term")?;

    let mut table = SizeTermTable::new(school.table().names(), zones.max_zone());
    for (zone_id, values) in evaluate_zones(zones, evaluator, ctx, SCHOOL_SIZE_ALTERNATIVES.len())? {
        let zone = zones.zone(zone_id)?;
        let grade = school.grade_segment(zone.gs_district, zone.hs_district)?;
        let high = school.high_segment(zone.gs_district, zone.hs_district)?;

        table.set(zone_id, school.preschool(), values[0])?;
        table.set(zone_id, grade, values[1])?;
        table.set(zone_id, high, values[2])?;
        table.set(zone_id, school.univ_typical(), values[3])?;
        table.set(zone_id, school.univ_non_typical(), values[4])?;
    }

    report_missing(&table, zones, "school");
    debug!("School size terms over {} segments", table.n_segments());
    Ok(table)
}

/// Per (zone, school segment) scaling factors
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFactors {
    n_segments: usize,
    values: Vec<f64>,
}

impl SegmentFactors {
    pub fn get(&self, zone: u32, segment: usize) -> f64 {
        self.values
            .get(zone as usize * self.n_segments + segment)
            .copied()
            .unwrap_or(0.0)
    }
}

/// School segment factors
///
/// 1.0 for every non-university segment. For the university segments:
/// zone enrollment divided by the zone's total university size, or 0 when
/// that total is 0.
pub fn school_segment_factors(
    size_terms: &SizeTermTable,
    school: &SchoolSegments,
    zones: &ZoneSystem,
    enrollment_attribute: &str,
) -> Result<SegmentFactors> {
    let n_segments = size_terms.n_segments();
    let enrollment_index = zones.attribute_index(enrollment_attribute)?;
    let non_university = school.non_university_segments();
    let university = school.university_segments();

    let mut values = vec![0.0; (size_terms.max_zone() as usize + 1) * n_segments];
    for zone in zones.zones() {
        let row = &mut values[zone.id as usize * n_segments..(zone.id as usize + 1) * n_segments];
        for &segment in &non_university {
            row[segment] = 1.0;
        }

        let total: f64 = university.iter().map(|&s| size_terms.get(zone.id, s)).sum();
        let enrollment = zone.attributes[enrollment_index];
        for &segment in &university {
            row[segment] = if total == 0.0 { 0.0 } else { enrollment / total };
        }
    }

    Ok(SegmentFactors { n_segments, values })
}

/// Exponentiated mode constants: `(MARKET_SEGMENTS + 1) × modes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpConstantTable {
    modes: Vec<String>,
    values: Vec<f64>,
}

impl ExpConstantTable {
    /// Evaluate constants for market segments `0..=MARKET_SEGMENTS` and exponentiate
    pub fn compute(evaluator: &dyn UtilityEvaluator, ctx: &EvalContext<'_>) -> Result<Self> {
        let modes = evaluator.alternative_names().to_vec();
        let mut values = Vec::with_capacity((MARKET_SEGMENTS + 1) * modes.len());

        for market in 0..=MARKET_SEGMENTS {
            let row = evaluator.evaluate(0, &ctx.with_market_segment(market))?;
            if row.len() != modes.len() {
                return Err(Error::Configuration(format!(
                    "constant evaluator returned {} values for {} modes",
                    row.len(),
                    modes.len()
                )));
            }
            for (mode, constant) in modes.iter().zip(&row) {
                debug!(
                    "exp constant market={market} mode={mode}: exp({constant}) = {}",
                    constant.exp()
                );
            }
            values.extend(row.into_iter().map(f64::exp));
        }

        Ok(Self { modes, values })
    }

    pub fn modes(&self) -> &[String] {
        &self.modes
    }

    pub fn row(&self, market: usize) -> Result<&[f64]> {
        if market > MARKET_SEGMENTS {
            return Err(Error::Lookup(format!(
                "market segment {market} out of range (0..={MARKET_SEGMENTS})"
            )));
        }
        let n = self.modes.len();
        Ok(&self.values[market * n..(market + 1) * n])
    }

    pub fn get(&self, market: usize, mode: usize) -> Result<f64> {
        self.row(market)?
            .get(mode)
            .copied()
            .ok_or_else(|| Error::Lookup(format!("no constant for mode index {mode}")))
    }

    /// Sum of the exponentiated constants across modes
    pub fn total(&self, market: usize) -> Result<f64> {
        Ok(self.row(market)?.iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{AttributeEvaluator, ConstantEvaluator, FnEvaluator};
    use crate::segments::SegmentIndexer;

    fn zones() -> ZoneSystem {
        let input = "zone,x,y,gs_district,hs_district,jobs,retail,enrollment\n\
                     1,0,0,4,20,10,0,0\n\
                     2,1,0,0,21,0,0,300\n\
                     5,2,0,4,20,3,1,0\n";
        ZoneSystem::from_reader(input.as_bytes()).unwrap()
    }

    #[test]
    fn test_general_size_terms() {
        let zones = zones();
        let eval = AttributeEvaluator::new(vec!["jobs".into(), "retail".into()]);
        let ctx = EvalContext::new().with_zones(&zones);
        let table =
            compute_size_terms(&zones, vec!["jobs".into(), "retail".into()], &eval, &ctx).unwrap();

        assert_eq!(table.max_zone(), 5);
        assert_eq!(table.get(5, 0), 3.0);
        assert_eq!(table.row(5), &[3.0, 1.0]);
        assert!(table.has_size_term(1));
        assert!(!table.has_size_term(2));
        // Ids outside the valid set stay zero
        assert!(!table.has_size_term(3));
        assert_eq!(table.row(4), &[0.0, 0.0]);
        assert_eq!(table.segment_total(0), 13.0);
    }

    #[test]
    fn test_negative_size_term_is_computation_error() {
        let zones = zones();
        let eval = FnEvaluator::new(["a"], |zone, _| Ok(vec![if zone == 2 { -1.0 } else { 1.0 }]));
        let err = compute_size_terms(&zones, vec!["a".into()], &eval, &EvalContext::new())
            .unwrap_err();
        assert!(matches!(err, Error::Computation { zone: 2, .. }));
    }

    #[test]
    fn test_evaluator_width_checked() {
        let zones = zones();
        let eval = FnEvaluator::new(["a", "b"], |_, _| Ok(vec![1.0, 1.0]));
        let err =
            compute_size_terms(&zones, vec!["a".into()], &eval, &EvalContext::new()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_worker_size_terms_cover_occupations() {
        let zones = zones();
        let work = WorkSegments::new();
        let eval = FnEvaluator::new(work.table().names(), |zone, _| {
            Ok((0..6).map(|i| (zone * 10 + i) as f64).collect())
        });
        let table =
            compute_worker_size_terms(&zones, &work, &eval, &EvalContext::new()).unwrap();
        let retail = work.index_of_occupation(75).unwrap();
        assert_eq!(table.get(2, retail), 23.0);
    }

    #[test]
    fn test_school_size_terms_land_in_district_segments() {
        let zones = zones();
        let school = SchoolSegments::build(&SegmentIndexer::default(), zones.districts()).unwrap();
        let eval = FnEvaluator::new(SCHOOL_SIZE_ALTERNATIVES, |_, _| {
            Ok(vec![1.0, 2.0, 3.0, 4.0, 5.0])
        });
        let table = compute_school_size_terms(&zones, &school, &eval, &EvalContext::new()).unwrap();

        let k8_4 = school.table().index_of("k-8_4").unwrap();
        let unified_k8 = school.table().index_of("unified k-8_21").unwrap();
        let unified_hs = school.table().index_of("unified 9-12_21").unwrap();
        assert_eq!(table.get(1, k8_4), 2.0);
        assert_eq!(table.get(2, k8_4), 0.0);
        assert_eq!(table.get(2, unified_k8), 2.0);
        assert_eq!(table.get(2, unified_hs), 3.0);
        assert_eq!(table.get(5, school.univ_non_typical()), 5.0);
        assert_eq!(table.get(5, school.preschool()), 1.0);
    }

    #[test]
    fn test_school_segment_factors() {
        let zones = zones();
        let school = SchoolSegments::build(&SegmentIndexer::default(), zones.districts()).unwrap();
        let eval = FnEvaluator::new(SCHOOL_SIZE_ALTERNATIVES, |zone, _| {
            let univ = if zone == 2 { 100.0 } else { 0.0 };
            Ok(vec![1.0, 1.0, 1.0, univ, univ * 2.0])
        });
        let table = compute_school_size_terms(&zones, &school, &eval, &EvalContext::new()).unwrap();
        let factors = school_segment_factors(&table, &school, &zones, "enrollment").unwrap();

        for segment in school.non_university_segments() {
            assert_eq!(factors.get(1, segment), 1.0);
        }
        // Enrollment 300 over a university size of 300
        assert_eq!(factors.get(2, school.univ_typical()), 1.0);
        // Zero university size yields a zero factor
        assert_eq!(factors.get(1, school.univ_typical()), 0.0);
        assert_eq!(factors.get(5, school.univ_non_typical()), 0.0);
    }

    #[test]
    fn test_exp_constants() {
        let eval = ConstantEvaluator::new(
            vec!["auto".into(), "transit".into()],
            vec![
                vec![0.0, 0.0],
                vec![0.0, -1.0],
                vec![1.0, 0.0],
                vec![0.0, 2f64.ln()],
            ],
        )
        .unwrap();
        let table = ExpConstantTable::compute(&eval, &EvalContext::new()).unwrap();

        assert_eq!(table.get(0, 0).unwrap(), 1.0);
        assert!((table.get(1, 1).unwrap() - (-1f64).exp()).abs() < 1e-12);
        assert!((table.total(3).unwrap() - 3.0).abs() < 1e-12);
        assert!(matches!(table.row(4), Err(Error::Lookup(_))));
    }

    #[test]
    fn test_exp_constants_need_every_market_segment() {
        let eval = ConstantEvaluator::new(vec!["auto".into()], vec![vec![0.0]; 3]).unwrap();
        assert!(matches!(
            ExpConstantTable::compute(&eval, &EvalContext::new()),
            Err(Error::Lookup(_))
        ));
    }
}
