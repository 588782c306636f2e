//! Zone universe loaded from a delimited zone file
//!
//! Required columns: `zone,x,y,gs_district,hs_district`. Every other column is
//! kept as a named numeric attribute (households, employment by occupation,
//! enrollment, ...) for evaluators to read.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use butterfly_common::{Error, Result};
use csv::StringRecord;
use serde::{Deserialize, Serialize};

use crate::segments::UNIFIED_DISTRICT_OFFSET;

const REQUIRED_COLUMNS: [&str; 5] = ["zone", "x", "y", "gs_district", "hs_district"];

/// One zone record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub gs_district: u32,
    pub hs_district: u32,
    /// Values in the order of [`ZoneSystem::attribute_names`]
    pub attributes: Vec<f64>,
}

/// Sorted set of valid zones; ids are a sparse subset of `[0, max_zone]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSystem {
    attribute_names: Vec<String>,
    zones: Vec<Zone>,
}

impl ZoneSystem {
    /// Build from unordered records, validating ids and district codes
    pub fn new(attribute_names: Vec<String>, mut zones: Vec<Zone>) -> Result<Self> {
        zones.sort_by_key(|z| z.id);

        for pair in zones.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(Error::InvalidInput(format!(
                    "zone {} listed more than once",
                    pair[0].id
                )));
            }
        }
        for zone in &zones {
            if zone.attributes.len() != attribute_names.len() {
                return Err(Error::InvalidInput(format!(
                    "zone {} has {} attributes, expected {}",
                    zone.id,
                    zone.attributes.len(),
                    attribute_names.len()
                )));
            }
            if zone.gs_district >= UNIFIED_DISTRICT_OFFSET
                || zone.hs_district >= UNIFIED_DISTRICT_OFFSET
            {
                return Err(Error::Configuration(format!(
                    "zone {}: district codes must be below {UNIFIED_DISTRICT_OFFSET}",
                    zone.id
                )));
            }
        }

        Ok(Self {
            attribute_names,
            zones,
        })
    }

    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::from_reader(file)
            .map_err(|e| match e {
                Error::InvalidInput(msg) => {
                    Error::InvalidInput(format!("{}: {msg}", path.display()))
                }
                other => other,
            })
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = csv
            .headers()
            .map_err(|e| Error::InvalidInput(format!("zone header: {e}")))?
            .clone();

        let mut required = [0usize; REQUIRED_COLUMNS.len()];
        for (slot, name) in required.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| Error::InvalidInput(format!("missing zone column '{name}'")))?;
        }
        let attribute_columns: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| !required.contains(i))
            .map(|(i, h)| (i, h.to_string()))
            .collect();

        let mut zones = Vec::new();
        for (line, record) in csv.records().enumerate() {
            let record =
                record.map_err(|e| Error::InvalidInput(format!("zone row {}: {e}", line + 1)))?;
            let row = line + 1;
            let int = |col: usize| parse_field::<u32>(&record, &headers, col, row, "an integer");
            let float = |col: usize| parse_field::<f64>(&record, &headers, col, row, "a number");

            zones.push(Zone {
                id: int(required[0])?,
                x: float(required[1])?,
                y: float(required[2])?,
                gs_district: int(required[3])?,
                hs_district: int(required[4])?,
                attributes: attribute_columns
                    .iter()
                    .map(|(col, _)| float(*col))
                    .collect::<Result<_>>()?,
            });
        }

        let names = attribute_columns.into_iter().map(|(_, name)| name).collect();
        Self::new(names, zones)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Highest valid zone id, 0 for an empty system
    pub fn max_zone(&self) -> u32 {
        self.zones.last().map_or(0, |z| z.id)
    }

    /// Zones in ascending id order
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Ordered valid-zone list
    pub fn zone_ids(&self) -> Vec<u32> {
        self.zones.iter().map(|z| z.id).collect()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.zones.binary_search_by_key(&id, |z| z.id).is_ok()
    }

    pub fn zone(&self, id: u32) -> Result<&Zone> {
        self.zones
            .binary_search_by_key(&id, |z| z.id)
            .map(|i| &self.zones[i])
            .map_err(|_| Error::Lookup(format!("zone {id} is not in the zone system")))
    }

    pub fn attribute_names(&self) -> &[String] {
        &self.attribute_names
    }

    pub fn attribute_index(&self, name: &str) -> Result<usize> {
        self.attribute_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::unknown_name("zone attribute", name, &self.attribute_names))
    }

    pub fn attribute(&self, id: u32, name: &str) -> Result<f64> {
        let index = self.attribute_index(name)?;
        Ok(self.zone(id)?.attributes[index])
    }

    /// `(zone, gs_district, hs_district)` for every zone
    pub fn districts(&self) -> impl Iterator<Item = (u32, u32, u32)> + '_ {
        self.zones
            .iter()
            .map(|z| (z.id, z.gs_district, z.hs_district))
    }

    /// Straight-line distance between two zone centroids
    pub fn distance(&self, from: u32, to: u32) -> Result<f64> {
        let a = self.zone(from)?;
        let b = self.zone(to)?;
        Ok((a.x - b.x).hypot(a.y - b.y))
    }
}

fn parse_field<T: FromStr>(
    record: &StringRecord,
    headers: &StringRecord,
    col: usize,
    row: usize,
    expected: &str,
) -> Result<T> {
    let raw = record
        .get(col)
        .ok_or_else(|| Error::InvalidInput(format!("zone row {row} is missing column {col}")))?;
    raw.parse().map_err(|_| {
        Error::InvalidInput(format!(
            "zone row {row}: '{raw}' in column '{}' is not {expected}",
            headers.get(col).unwrap_or("?")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONES: &str = "\
zone,x,y,gs_district,hs_district,households,enrollment
3,0.0,0.0,1,10,120,0
1,3.0,4.0,0,11,80,500
7,6.0,8.0,2,10,0,25.5
";

    #[test]
    fn test_read_zone_csv() {
        let zones = ZoneSystem::from_reader(ZONES.as_bytes()).unwrap();
        assert_eq!(zones.len(), 3);
        assert_eq!(zones.zone_ids(), vec![1, 3, 7]);
        assert_eq!(zones.max_zone(), 7);
        assert_eq!(zones.attribute_names(), &["households", "enrollment"]);
        assert_eq!(zones.attribute(7, "enrollment").unwrap(), 25.5);
        assert_eq!(zones.zone(1).unwrap().gs_district, 0);
        assert!(!zones.contains(2));
    }

    #[test]
    fn test_distance() {
        let zones = ZoneSystem::from_reader(ZONES.as_bytes()).unwrap();
        assert_eq!(zones.distance(3, 1).unwrap(), 5.0);
        assert_eq!(zones.distance(1, 1).unwrap(), 0.0);
        assert!(matches!(zones.distance(3, 4), Err(Error::Lookup(_))));
    }

    #[test]
    fn test_missing_column_rejected() {
        let input = "zone,x,y,gs_district\n1,0,0,1\n";
        let err = ZoneSystem::from_reader(input.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("hs_district"));
    }

    #[test]
    fn test_duplicate_zone_rejected() {
        let input = "zone,x,y,gs_district,hs_district\n1,0,0,1,1\n1,1,1,1,1\n";
        assert!(matches!(
            ZoneSystem::from_reader(input.as_bytes()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_offset_district_rejected() {
        let input = "zone,x,y,gs_district,hs_district\n1,0,0,1000001,1\n";
        assert!(matches!(
            ZoneSystem::from_reader(input.as_bytes()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_bad_number_reports_column() {
        let input = "zone,x,y,gs_district,hs_district,jobs\n1,0,0,1,1,many\n";
        let err = ZoneSystem::from_reader(input.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("'jobs'"));
    }

    #[test]
    fn test_unknown_attribute_suggests() {
        let zones = ZoneSystem::from_reader(ZONES.as_bytes()).unwrap();
        let err = zones.attribute(1, "househlds").unwrap_err();
        assert!(err.to_string().contains("did you mean 'households'"));
    }
}
