//! Segment indexing for destination-choice size terms
//!
//! Raw categorical codes discovered at runtime (school districts, occupation
//! codes) are turned into stable, dense segment indices. Indices depend only on
//! the *set* of codes observed: codes are deduped and sorted before indexing, so
//! shuffling the zone→code assignment never changes the result.
//!
//! ## Unified districts
//!
//! A zone whose grade-school district is `0` belongs to a unified district. Its
//! code is shifted by [`UNIFIED_DISTRICT_OFFSET`] so that unified district 3
//! (`1_000_003`) and plain district 3 (`3`) index separately. The offset is
//! stripped only for the display name (`"unified k-8_3"` vs `"k-8_3"`).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use butterfly_common::{Error, Result};

/// Offset marking a unified-district code
pub const UNIFIED_DISTRICT_OFFSET: u32 = 1_000_000;

/// School segment group labels
pub const PRESCHOOL_LABEL: &str = "preschool";
pub const GRADE_SCHOOL_LABEL: &str = "k-8";
pub const UNIFIED_GRADE_SCHOOL_LABEL: &str = "unified k-8";
pub const HIGH_SCHOOL_LABEL: &str = "9-12";
pub const UNIFIED_HIGH_SCHOOL_LABEL: &str = "unified 9-12";
pub const UNIV_TYPICAL_LABEL: &str = "univ typical";
pub const UNIV_NON_TYPICAL_LABEL: &str = "univ non-typical";

/// Occupation codes and labels for work location segments, in index order
pub const WORK_OCCUPATIONS: [(u32, &str); 6] = [
    (71, "Management"),
    (72, "Professional"),
    (74, "Services"),
    (75, "Retail"),
    (76, "Manual"),
    (77, "Military"),
];

/// Labels used to name segments built from raw codes
#[derive(Debug, Clone, Copy)]
pub struct CodeLabels<'a> {
    /// Label for plain codes (`"<plain>_<code>"`)
    pub plain: &'a str,
    /// Label for offset codes (`"<unified>_<code - offset>"`)
    pub unified: &'a str,
}

/// One segment: dense index plus display name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub name: String,
    /// Raw code the segment was built from, `None` for fixed segments
    pub code: Option<u32>,
}

/// Ordered segment list with bidirectional name↔index maps
#[derive(Debug, Clone, Default)]
pub struct SegmentTable {
    segments: Vec<Segment>,
    name_to_index: HashMap<String, usize>,
    /// Raw code lookup for tables built from a single code family
    codes: CodeIndex,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment with the next free index
    fn push(&mut self, name: String, code: Option<u32>) -> Result<usize> {
        if self.name_to_index.contains_key(&name) {
            return Err(Error::Configuration(format!(
                "segment name '{name}' registered twice"
            )));
        }
        let index = self.segments.len();
        self.name_to_index.insert(name.clone(), index);
        self.segments.push(Segment { index, name, code });
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments in index order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segment names in index order
    pub fn names(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.name_to_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::unknown_name("segment", name, &self.names()))
    }

    pub fn name_of(&self, index: usize) -> Result<&str> {
        self.segments
            .get(index)
            .map(|s| s.name.as_str())
            .ok_or_else(|| Error::Lookup(format!("no segment with index {index}")))
    }

    /// Segment index for a raw code
    pub fn index_of_code(&self, code: u32) -> Result<usize> {
        self.codes.get(code)
    }

    pub fn codes(&self) -> &CodeIndex {
        &self.codes
    }

    pub fn name_to_index(&self) -> &HashMap<String, usize> {
        &self.name_to_index
    }

    /// Index → name map, ordered by index
    pub fn index_to_name(&self) -> BTreeMap<usize, String> {
        self.segments
            .iter()
            .map(|s| (s.index, s.name.clone()))
            .collect()
    }
}

/// Raw code → segment index lookup for one code family
#[derive(Debug, Clone, Default)]
pub struct CodeIndex {
    kind: String,
    by_code: BTreeMap<u32, usize>,
}

impl CodeIndex {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            by_code: BTreeMap::new(),
        }
    }

    /// Segment index for a raw code; fails fast for codes never registered
    pub fn get(&self, code: u32) -> Result<usize> {
        self.by_code.get(&code).copied().ok_or_else(|| {
            Error::Lookup(format!("{} code {} has no segment", self.kind, code))
        })
    }

    /// Registered codes, ascending
    pub fn codes(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_code.keys().copied()
    }

    /// Segment indices in code order
    pub fn segment_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.by_code.values().copied()
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

/// Assigns segment indices to runtime-discovered codes
#[derive(Debug, Clone, Copy)]
pub struct SegmentIndexer {
    offset: u32,
}

impl Default for SegmentIndexer {
    fn default() -> Self {
        Self {
            offset: UNIFIED_DISTRICT_OFFSET,
        }
    }
}

impl SegmentIndexer {
    pub fn with_offset(offset: u32) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Grade-school and high-school district codes for a zone
    ///
    /// A zero grade-school district means the zone belongs to a unified
    /// district: both codes become `offset + hs_district`.
    pub fn district_codes(&self, gs_district: u32, hs_district: u32) -> Result<(u32, u32)> {
        if gs_district != 0 {
            return Ok((gs_district, hs_district));
        }
        let unified = self.offset.checked_add(hs_district).ok_or_else(|| {
            Error::Configuration(format!(
                "unified district {hs_district} overflows offset {}",
                self.offset
            ))
        })?;
        Ok((unified, unified))
    }

    /// Display name for a raw code, with the offset stripped
    pub fn segment_name(&self, code: u32, labels: CodeLabels<'_>) -> String {
        if code >= self.offset {
            format!("{}_{}", labels.unified, code - self.offset)
        } else {
            format!("{}_{}", labels.plain, code)
        }
    }

    /// Build a segment table from a zone→code assignment
    ///
    /// `reserved` names take indices `0..reserved.len()`; the deduped, sorted
    /// codes follow in ascending order.
    pub fn build_segments<I>(
        &self,
        reserved: &[&str],
        assignment: I,
        labels: CodeLabels<'_>,
    ) -> Result<SegmentTable>
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut table = SegmentTable::new();
        for name in reserved {
            table.push((*name).to_string(), None)?;
        }
        let codes: BTreeSet<u32> = assignment.into_iter().map(|(_, code)| code).collect();
        table.codes = self.append_codes(&mut table, labels.plain, &codes, labels)?;
        Ok(table)
    }

    /// Append one segment per code, in ascending code order
    fn append_codes(
        &self,
        table: &mut SegmentTable,
        kind: &str,
        codes: &BTreeSet<u32>,
        labels: CodeLabels<'_>,
    ) -> Result<CodeIndex> {
        let mut index = CodeIndex::new(kind);
        for &code in codes {
            let segment = table.push(self.segment_name(code, labels), Some(code))?;
            index.by_code.insert(code, segment);
        }
        Ok(index)
    }
}

/// School location choice segments
///
/// Layout: preschool at index 0, grade-school districts, high-school
/// districts, then the two university segments.
#[derive(Debug, Clone)]
pub struct SchoolSegments {
    table: SegmentTable,
    grade: CodeIndex,
    high: CodeIndex,
    indexer: SegmentIndexer,
    preschool: usize,
    univ_typical: usize,
    univ_non_typical: usize,
}

impl SchoolSegments {
    /// Build from `(zone, gs_district, hs_district)` triples
    pub fn build<I>(indexer: &SegmentIndexer, districts: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, u32, u32)>,
    {
        let mut grade_codes = BTreeSet::new();
        let mut high_codes = BTreeSet::new();
        for (zone, gs, hs) in districts {
            if gs >= indexer.offset() || hs >= indexer.offset() {
                return Err(Error::Configuration(format!(
                    "zone {zone}: district codes must be below {}",
                    indexer.offset()
                )));
            }
            let (gs_code, hs_code) = indexer.district_codes(gs, hs)?;
            grade_codes.insert(gs_code);
            high_codes.insert(hs_code);
        }

        let mut table = SegmentTable::new();
        let preschool = table.push(PRESCHOOL_LABEL.to_string(), None)?;
        let grade = indexer.append_codes(
            &mut table,
            "grade school district",
            &grade_codes,
            CodeLabels {
                plain: GRADE_SCHOOL_LABEL,
                unified: UNIFIED_GRADE_SCHOOL_LABEL,
            },
        )?;
        let high = indexer.append_codes(
            &mut table,
            "high school district",
            &high_codes,
            CodeLabels {
                plain: HIGH_SCHOOL_LABEL,
                unified: UNIFIED_HIGH_SCHOOL_LABEL,
            },
        )?;
        let univ_typical = table.push(UNIV_TYPICAL_LABEL.to_string(), None)?;
        let univ_non_typical = table.push(UNIV_NON_TYPICAL_LABEL.to_string(), None)?;

        Ok(Self {
            table,
            grade,
            high,
            indexer: *indexer,
            preschool,
            univ_typical,
            univ_non_typical,
        })
    }

    pub fn table(&self) -> &SegmentTable {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn preschool(&self) -> usize {
        self.preschool
    }

    pub fn univ_typical(&self) -> usize {
        self.univ_typical
    }

    pub fn univ_non_typical(&self) -> usize {
        self.univ_non_typical
    }

    pub fn grade_districts(&self) -> &CodeIndex {
        &self.grade
    }

    pub fn high_districts(&self) -> &CodeIndex {
        &self.high
    }

    /// Grade-school segment for a zone's raw district pair
    pub fn grade_segment(&self, gs_district: u32, hs_district: u32) -> Result<usize> {
        self.grade
            .get(self.indexer.district_codes(gs_district, hs_district)?.0)
    }

    /// High-school segment for a zone's raw district pair
    pub fn high_segment(&self, gs_district: u32, hs_district: u32) -> Result<usize> {
        self.high
            .get(self.indexer.district_codes(gs_district, hs_district)?.1)
    }

    pub fn university_segments(&self) -> [usize; 2] {
        [self.univ_typical, self.univ_non_typical]
    }

    /// Preschool plus every district segment
    pub fn non_university_segments(&self) -> Vec<usize> {
        std::iter::once(self.preschool)
            .chain(self.grade.segment_indices())
            .chain(self.high.segment_indices())
            .collect()
    }

    /// Segments excluded from shadow price adjustment (preschool only)
    pub fn no_shadow_price_segments(&self) -> BTreeSet<usize> {
        BTreeSet::from([self.preschool])
    }
}

/// Work location choice segments keyed by occupation code
#[derive(Debug, Clone)]
pub struct WorkSegments {
    table: SegmentTable,
}

impl Default for WorkSegments {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkSegments {
    pub fn new() -> Self {
        let mut table = SegmentTable::new();
        table.codes = CodeIndex::new("occupation");
        for (index, (code, name)) in WORK_OCCUPATIONS.iter().enumerate() {
            table.name_to_index.insert((*name).to_string(), index);
            table.segments.push(Segment {
                index,
                name: (*name).to_string(),
                code: Some(*code),
            });
            table.codes.by_code.insert(*code, index);
        }
        Self { table }
    }

    pub fn table(&self) -> &SegmentTable {
        &self.table
    }

    pub fn index_of_occupation(&self, code: u32) -> Result<usize> {
        self.table.index_of_code(code)
    }
}
