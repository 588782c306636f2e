//! Merge packet results into one dense zone-indexed table

use butterfly_common::{Error, Result};
use log::debug;

use crate::executor::PacketResult;
use crate::table::AccessibilityTable;

/// Assemble packet results into an [`AccessibilityTable`] over `[0, max_zone]`
///
/// Row `p - start` of the packet covering position `p` lands at zone
/// `zones[p]`. Results may arrive in any order, but together they must cover
/// every position of `zones` exactly once. Zones absent from `zones` keep
/// all-zero rows.
pub fn merge(
    max_zone: u32,
    n_alternatives: usize,
    zones: &[u32],
    mut results: Vec<PacketResult>,
) -> Result<AccessibilityTable> {
    results.sort_by_key(|r| r.start);

    let mut table = AccessibilityTable::zeros(max_zone, n_alternatives);
    let mut next = 0usize;
    for result in &results {
        if result.start != next || result.end < result.start || result.end >= zones.len() {
            return Err(Error::Distribution(format!(
                "packet {} covers [{}, {}] but position {next} is next of {}",
                result.packet_id,
                result.start,
                result.end,
                zones.len()
            )));
        }
        if result.n_alternatives != n_alternatives
            || result.values.len() != result.row_count() * n_alternatives
        {
            return Err(Error::Distribution(format!(
                "packet {} has {} values for {} rows of {} alternatives (expected {n_alternatives})",
                result.packet_id,
                result.values.len(),
                result.row_count(),
                result.n_alternatives
            )));
        }

        for (offset, &zone) in zones[result.start..=result.end].iter().enumerate() {
            let row = table.row_mut(zone).ok_or_else(|| {
                Error::Lookup(format!("zone {zone} exceeds max zone {max_zone}"))
            })?;
            row.copy_from_slice(result.row(offset));
        }
        next = result.end + 1;
    }

    if next != zones.len() {
        return Err(Error::Distribution(format!(
            "results cover {next} of {} positions",
            zones.len()
        )));
    }

    debug!(
        "Merged {} packets into {} rows x {} alternatives",
        results.len(),
        max_zone as usize + 1,
        n_alternatives
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(packet_id: u32, start: usize, end: usize, values: Vec<f32>) -> PacketResult {
        PacketResult {
            packet_id,
            start,
            end,
            n_alternatives: 2,
            values,
        }
    }

    #[test]
    fn test_out_of_order_results_land_by_zone() {
        let zones = [1, 4, 5, 9];
        let results = vec![
            result(2, 2, 3, vec![5.0, 5.5, 9.0, 9.5]),
            result(1, 0, 1, vec![1.0, 1.5, 4.0, 4.5]),
        ];
        let table = merge(10, 2, &zones, results).unwrap();

        assert_eq!(table.row(1).unwrap(), &[1.0, 1.5]);
        assert_eq!(table.row(4).unwrap(), &[4.0, 4.5]);
        assert_eq!(table.row(9).unwrap(), &[9.0, 9.5]);
        for absent in [0, 2, 3, 6, 7, 8, 10] {
            assert_eq!(table.row(absent).unwrap(), &[0.0, 0.0], "zone {absent}");
        }
    }

    #[test]
    fn test_missing_packet_rejected() {
        let zones = [1, 2, 3, 4];
        let results = vec![result(1, 0, 1, vec![0.0; 4])];
        assert!(matches!(
            merge(4, 2, &zones, results),
            Err(Error::Distribution(_))
        ));
    }

    #[test]
    fn test_overlap_rejected() {
        let zones = [1, 2, 3];
        let results = vec![
            result(1, 0, 1, vec![0.0; 4]),
            result(2, 1, 2, vec![0.0; 4]),
        ];
        assert!(matches!(
            merge(3, 2, &zones, results),
            Err(Error::Distribution(_))
        ));
    }

    #[test]
    fn test_row_count_mismatch_rejected() {
        let zones = [1, 2];
        let results = vec![result(1, 0, 1, vec![0.0; 3])];
        assert!(matches!(
            merge(2, 2, &zones, results),
            Err(Error::Distribution(_))
        ));
    }

    #[test]
    fn test_empty_zone_list_gives_zero_table() {
        let table = merge(3, 1, &[], Vec::new()).unwrap();
        assert_eq!(table.max_zone(), 3);
        assert_eq!(table.row(2).unwrap(), &[0.0]);
    }
}
