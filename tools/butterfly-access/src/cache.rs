//! Run-wide concurrent utility cache
//!
//! Path-level utilities (transit paths keyed by segment, period and an
//! origin/destination pair) are expensive to compute and requested many times
//! by different workers. The cache makes each one visible to every worker after
//! the first computation.
//!
//! Each (segment, period) combination owns one sharded [`DashMap`] keyed by the
//! encoded pair `origin * PAIR_KEY_FACTOR + destination`. Writes are
//! first-writer-wins: a later `put` for an existing key leaves the stored value
//! in place and returns it, so concurrent producers of the same deterministic
//! value never disagree.
//!
//! Dense walk/drive access (zone → tap) and egress (tap → zone) utilities
//! live next to the pair maps as write-once cells, one per zone × tap pair.
//! They are shared across segments and periods.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use butterfly_common::{Error, Result};
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};

/// Multiplier used to pack an origin/destination pair into one key
pub const PAIR_KEY_FACTOR: u64 = 100_000;

/// Upper bound on `segments × periods` pair maps
pub const MAX_CACHE_SLOTS: u64 = 4_096;

/// Dimensions of a run's cache, fixed before any worker starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    pub max_zone: u32,
    pub max_tap: u32,
    /// Number of access/egress segments
    pub segments: u32,
    /// Number of time periods
    pub periods: u32,
}

impl CacheSpec {
    pub fn validate(&self) -> Result<()> {
        if u64::from(self.max_zone) >= PAIR_KEY_FACTOR {
            return Err(Error::Configuration(format!(
                "max zone {} does not fit the pair key (must be < {PAIR_KEY_FACTOR})",
                self.max_zone
            )));
        }
        if u64::from(self.max_tap) >= PAIR_KEY_FACTOR {
            return Err(Error::Configuration(format!(
                "max tap {} does not fit the pair key (must be < {PAIR_KEY_FACTOR})",
                self.max_tap
            )));
        }
        if self.segments == 0 || self.periods == 0 {
            return Err(Error::Configuration(format!(
                "cache needs at least one segment and one period (got {} x {})",
                self.segments, self.periods
            )));
        }
        self.slot_count()?;
        Ok(())
    }

    /// Number of (segment, period) pair maps
    pub fn slot_count(&self) -> Result<usize> {
        let slots = u64::from(self.segments) * u64::from(self.periods);
        if slots > MAX_CACHE_SLOTS {
            return Err(Error::Configuration(format!(
                "{} segments x {} periods exceeds {MAX_CACHE_SLOTS} cache slots",
                self.segments, self.periods
            )));
        }
        Ok(slots as usize)
    }

    /// Largest id accepted on either side of a pair
    fn max_endpoint(&self) -> u32 {
        self.max_zone.max(self.max_tap)
    }
}

/// Cache key for one path-level utility vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UtilityKey {
    pub segment: u32,
    pub period: u32,
    pub origin: u32,
    pub destination: u32,
}

impl UtilityKey {
    pub fn new(segment: u32, period: u32, origin: u32, destination: u32) -> Self {
        Self {
            segment,
            period,
            origin,
            destination,
        }
    }

    /// Encoded origin/destination pair
    pub fn pair_key(&self) -> u64 {
        u64::from(self.origin) * PAIR_KEY_FACTOR + u64::from(self.destination)
    }
}

/// Mode used to reach or leave a tap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Walk,
    Drive,
}

/// Which end of the transit trip a dense cell belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// Zone → tap, rows by zone
    Access,
    /// Tap → zone, rows by tap
    Egress,
}

type Cell = OnceLock<Arc<[f32]>>;

/// `rows × width` write-once cells; a row is allocated on its first write
#[derive(Debug)]
struct DenseStore {
    rows: Vec<OnceLock<Box<[Cell]>>>,
    width: usize,
}

impl DenseStore {
    fn new(rows: usize, width: usize) -> Self {
        Self {
            rows: (0..rows).map(|_| OnceLock::new()).collect(),
            width,
        }
    }

    fn in_range(&self, row: usize, col: usize) -> bool {
        row < self.rows.len() && col < self.width
    }

    fn get(&self, row: usize, col: usize) -> Option<Arc<[f32]>> {
        self.rows.get(row)?.get()?.get(col)?.get().cloned()
    }

    fn cell(&self, row: usize, col: usize) -> Option<&Cell> {
        let width = self.width;
        self.rows
            .get(row)?
            .get_or_init(|| (0..width).map(|_| OnceLock::new()).collect())
            .get(col)
    }
}

/// Walk/drive access and egress stores
#[derive(Debug)]
struct DenseStores {
    walk_access: DenseStore,
    drive_access: DenseStore,
    walk_egress: DenseStore,
    drive_egress: DenseStore,
}

impl DenseStores {
    fn new(zones: usize, taps: usize) -> Self {
        Self {
            walk_access: DenseStore::new(zones, taps),
            drive_access: DenseStore::new(zones, taps),
            walk_egress: DenseStore::new(taps, zones),
            drive_egress: DenseStore::new(taps, zones),
        }
    }

    fn store(&self, mode: AccessMode, leg: Leg) -> &DenseStore {
        match (mode, leg) {
            (AccessMode::Walk, Leg::Access) => &self.walk_access,
            (AccessMode::Drive, Leg::Access) => &self.drive_access,
            (AccessMode::Walk, Leg::Egress) => &self.walk_egress,
            (AccessMode::Drive, Leg::Egress) => &self.drive_egress,
        }
    }
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Shared, concurrently readable and writable utility cache
#[derive(Debug)]
pub struct UtilityCache {
    spec: CacheSpec,
    paths: Vec<DashMap<u64, Arc<[f32]>>>,
    dense: DenseStores,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl UtilityCache {
    pub fn new(spec: CacheSpec) -> Result<Self> {
        spec.validate()?;

        let combos = spec.slot_count()?;
        let zones = spec.max_zone as usize + 1;
        let taps = spec.max_tap as usize + 1;
        debug!(
            "Utility cache: {} segments x {} periods, {} zones, {} taps",
            spec.segments, spec.periods, zones, taps
        );

        Ok(Self {
            spec,
            paths: (0..combos).map(|_| DashMap::new()).collect(),
            dense: DenseStores::new(zones, taps),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn spec(&self) -> &CacheSpec {
        &self.spec
    }

    fn slot(&self, segment: u32, period: u32) -> Result<usize> {
        if segment >= self.spec.segments || period >= self.spec.periods {
            return Err(Error::Lookup(format!(
                "cache has no segment {segment} / period {period} (configured {} x {})",
                self.spec.segments, self.spec.periods
            )));
        }
        Ok(segment as usize * self.spec.periods as usize + period as usize)
    }

    fn map_for(&self, key: &UtilityKey) -> Result<&DashMap<u64, Arc<[f32]>>> {
        let slot = self.slot(key.segment, key.period)?;
        let bound = self.spec.max_endpoint();
        if key.origin > bound || key.destination > bound {
            return Err(Error::Lookup(format!(
                "pair {} -> {} outside cache bound {bound}",
                key.origin, key.destination
            )));
        }
        Ok(&self.paths[slot])
    }

    /// Cached utilities for a key, if already computed
    pub fn get(&self, key: &UtilityKey) -> Result<Option<Arc<[f32]>>> {
        let found = self
            .map_for(key)?
            .get(&key.pair_key())
            .map(|entry| Arc::clone(entry.value()));
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(found)
    }

    /// Store utilities for a key and return the visible value
    ///
    /// If another writer got there first its value is kept and returned.
    pub fn put(&self, key: UtilityKey, value: impl Into<Arc<[f32]>>) -> Result<Arc<[f32]>> {
        let entry = self
            .map_for(&key)?
            .entry(key.pair_key())
            .or_insert_with(|| value.into());
        Ok(Arc::clone(entry.value()))
    }

    /// Return the cached value or compute, store and return it
    ///
    /// `compute` runs without holding any shard lock; two workers racing on the
    /// same key may both compute, and the first stored value wins.
    pub fn get_or_compute<F>(&self, key: UtilityKey, compute: F) -> Result<Arc<[f32]>>
    where
        F: FnOnce() -> Result<Vec<f32>>,
    {
        if let Some(value) = self.get(&key)? {
            return Ok(value);
        }
        let value = compute()?;
        self.put(key, value)
    }

    /// Row and column of a (zone, tap) pair in the store for `leg`
    fn dense_position(
        &self,
        mode: AccessMode,
        leg: Leg,
        zone: u32,
        tap: u32,
    ) -> Result<(usize, usize)> {
        let (row, col) = match leg {
            Leg::Access => (zone as usize, tap as usize),
            Leg::Egress => (tap as usize, zone as usize),
        };
        if !self.dense.store(mode, leg).in_range(row, col) {
            return Err(Error::Lookup(format!(
                "{mode:?} {leg:?} pair zone {zone} / tap {tap} outside max zone {} / max tap {}",
                self.spec.max_zone, self.spec.max_tap
            )));
        }
        Ok((row, col))
    }

    /// Stored access or egress utilities for a zone/tap pair
    pub fn dense(
        &self,
        mode: AccessMode,
        leg: Leg,
        zone: u32,
        tap: u32,
    ) -> Result<Option<Arc<[f32]>>> {
        let (row, col) = self.dense_position(mode, leg, zone, tap)?;
        Ok(self.dense.store(mode, leg).get(row, col))
    }

    /// Set a zone/tap cell once; later writes return the first value
    pub fn put_dense(
        &self,
        mode: AccessMode,
        leg: Leg,
        zone: u32,
        tap: u32,
        value: impl Into<Arc<[f32]>>,
    ) -> Result<Arc<[f32]>> {
        let (row, col) = self.dense_position(mode, leg, zone, tap)?;
        let cell = self.dense.store(mode, leg).cell(row, col).ok_or_else(|| {
            Error::Lookup(format!("{leg:?} cell zone {zone} / tap {tap} missing"))
        })?;
        Ok(Arc::clone(cell.get_or_init(|| value.into())))
    }

    /// Number of pair entries across all (segment, period) maps
    pub fn len(&self) -> usize {
        self.paths.iter().map(DashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
