use std::collections::HashSet;

use comps_core::{NaturalKey, NormalizedRecord};

/// One record per natural key; the first one seen wins.
pub fn dedupe(records: Vec<NormalizedRecord>) -> Vec<NormalizedRecord> {
    let mut seen: HashSet<NaturalKey> = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| seen.insert(record.natural_key()))
        .collect()
}
