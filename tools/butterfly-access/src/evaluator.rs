//! Utility evaluator interface and the reference evaluators used by the CLI
//!
//! An evaluator maps a zone to one value per alternative. It must be
//! deterministic and safe to call from many workers at once; everything it may
//! read is passed in through [`EvalContext`].

use std::fmt;

use butterfly_common::{Error, Result};

use crate::cache::{UtilityCache, UtilityKey};
use crate::inputs::SharedInputs;
use crate::zones::ZoneSystem;

/// Read-only state visible to an evaluation
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalContext<'a> {
    /// Market segment row for constant evaluation (`0..=3`, 3 = total)
    pub market_segment: Option<usize>,
    pub zones: Option<&'a ZoneSystem>,
    /// Job inputs (size terms, constants) during packet execution
    pub inputs: Option<&'a SharedInputs>,
    pub cache: Option<&'a UtilityCache>,
}

impl<'a> EvalContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_market_segment(mut self, market_segment: usize) -> Self {
        self.market_segment = Some(market_segment);
        self
    }

    pub fn with_zones(mut self, zones: &'a ZoneSystem) -> Self {
        self.zones = Some(zones);
        self
    }

    pub fn with_inputs(mut self, inputs: &'a SharedInputs) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_cache(mut self, cache: &'a UtilityCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Zone system from the context or from the job inputs
    pub fn zone_system(&self) -> Option<&'a ZoneSystem> {
        self.zones.or_else(|| self.inputs.map(|i| &i.zones))
    }
}

/// External utility evaluator
pub trait UtilityEvaluator: Send + Sync {
    /// Alternative names, in output order
    fn alternative_names(&self) -> &[String];

    fn n_alternatives(&self) -> usize {
        self.alternative_names().len()
    }

    /// One utility per alternative for `zone`
    fn evaluate(&self, zone: u32, ctx: &EvalContext<'_>) -> Result<Vec<f64>>;
}

/// Adapts a closure into an evaluator
pub struct FnEvaluator<F> {
    names: Vec<String>,
    f: F,
}

impl<F> FnEvaluator<F>
where
    F: Fn(u32, &EvalContext<'_>) -> Result<Vec<f64>> + Send + Sync,
{
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>, f: F) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            f,
        }
    }
}

impl<F> fmt::Debug for FnEvaluator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnEvaluator")
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

impl<F> UtilityEvaluator for FnEvaluator<F>
where
    F: Fn(u32, &EvalContext<'_>) -> Result<Vec<f64>> + Send + Sync,
{
    fn alternative_names(&self) -> &[String] {
        &self.names
    }

    fn evaluate(&self, zone: u32, ctx: &EvalContext<'_>) -> Result<Vec<f64>> {
        (self.f)(zone, ctx)
    }
}

/// Reads named zone attributes as alternatives
#[derive(Debug, Clone)]
pub struct AttributeEvaluator {
    columns: Vec<String>,
}

impl AttributeEvaluator {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }
}

impl UtilityEvaluator for AttributeEvaluator {
    fn alternative_names(&self) -> &[String] {
        &self.columns
    }

    fn evaluate(&self, zone: u32, ctx: &EvalContext<'_>) -> Result<Vec<f64>> {
        let zones = ctx.zone_system().ok_or_else(|| Error::Computation {
            zone,
            message: "attribute evaluator needs a zone system".to_string(),
        })?;
        self.columns
            .iter()
            .map(|column| zones.attribute(zone, column))
            .collect()
    }
}

/// Configured mode constants per market segment
#[derive(Debug, Clone)]
pub struct ConstantEvaluator {
    modes: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl ConstantEvaluator {
    /// `rows[m]` holds one constant per mode for market segment `m`
    pub fn new(modes: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        if let Some((m, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != modes.len()) {
            return Err(Error::Configuration(format!(
                "market segment {m} has {} constants for {} modes",
                row.len(),
                modes.len()
            )));
        }
        Ok(Self { modes, rows })
    }
}

impl UtilityEvaluator for ConstantEvaluator {
    fn alternative_names(&self) -> &[String] {
        &self.modes
    }

    fn evaluate(&self, _zone: u32, ctx: &EvalContext<'_>) -> Result<Vec<f64>> {
        let market = ctx.market_segment.ok_or_else(|| {
            Error::Configuration("constant evaluation needs a market segment".to_string())
        })?;
        self.rows
            .get(market)
            .cloned()
            .ok_or_else(|| Error::Lookup(format!("no constants for market segment {market}")))
    }
}

/// Size-weighted gravity accessibility
///
/// For origin `o` and size segment `s`:
/// `ln(1 + Σ_d size[d][s] · C · exp(-decay · dist(o, d)))` where `C` is the
/// total exponentiated constant of the configured market segment. The
/// per-pair impedance goes through the utility cache when one is present.
#[derive(Debug, Clone)]
pub struct GravityEvaluator {
    names: Vec<String>,
    decay: f64,
    market_segment: usize,
    cache_segment: u32,
    period: u32,
}

impl GravityEvaluator {
    pub fn new(names: Vec<String>, decay: f64, market_segment: usize) -> Self {
        Self {
            names,
            decay,
            market_segment,
            cache_segment: 0,
            period: 0,
        }
    }

    /// Cache slot used for the origin/destination impedance
    pub fn with_cache_slot(mut self, segment: u32, period: u32) -> Self {
        self.cache_segment = segment;
        self.period = period;
        self
    }

    fn impedance(&self, ctx: &EvalContext<'_>, zones: &ZoneSystem, o: u32, d: u32) -> Result<f64> {
        let compute = || -> Result<Vec<f32>> {
            let dist = zones.distance(o, d)?;
            Ok(vec![(-self.decay * dist) as f32])
        };
        let value = match ctx.cache {
            Some(cache) => {
                let key = UtilityKey::new(self.cache_segment, self.period, o, d);
                cache.get_or_compute(key, compute)?[0]
            }
            None => compute()?[0],
        };
        Ok(f64::from(value))
    }
}

impl UtilityEvaluator for GravityEvaluator {
    fn alternative_names(&self) -> &[String] {
        &self.names
    }

    fn evaluate(&self, zone: u32, ctx: &EvalContext<'_>) -> Result<Vec<f64>> {
        let inputs = ctx.inputs.ok_or_else(|| Error::Computation {
            zone,
            message: "gravity evaluator needs job inputs".to_string(),
        })?;
        let size_terms = &inputs.size_terms;
        if size_terms.n_segments() != self.names.len() {
            return Err(Error::Computation {
                zone,
                message: format!(
                    "{} size segments for {} alternatives",
                    size_terms.n_segments(),
                    self.names.len()
                ),
            });
        }
        let constant = inputs.exp_constants.total(self.market_segment)?;

        let mut acc = vec![0.0; self.names.len()];
        for dest in inputs.zones.zones() {
            if !size_terms.has_size_term(dest.id) {
                continue;
            }
            let weight = constant * self.impedance(ctx, &inputs.zones, zone, dest.id)?.exp();
            for (segment, sum) in acc.iter_mut().enumerate() {
                *sum += size_terms.get(dest.id, segment) * weight;
            }
        }

        Ok(acc.into_iter().map(f64::ln_1p).collect())
    }
}
