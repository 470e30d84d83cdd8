use std::time::Duration;

use async_trait::async_trait;
use comps_core::{canonical_address, Loose, RawRecord, ScrapeQuery, SourceTier};
use sha2::{Digest, Sha256};

use crate::{AdapterError, AdapterOutput, SourceAdapter};

pub const HEURISTIC_CAVEAT: &str =
    "heuristic: records are synthetic estimates generated from query parameters, not observed market data";

pub const DEFAULT_HEURISTIC_RESULTS: usize = 5;

const STREETS: &[&str] = &[
    "Maple", "Cedar", "Willow", "Hickory", "Magnolia", "Poplar", "Chestnut", "Sycamore", "Laurel",
    "Dogwood",
];
const SUFFIXES: &[&str] = &["St", "Ave", "Blvd", "Dr", "Ln", "Rd", "Ct", "Pl"];
const NAME_STEMS: &[&str] = &[
    "Parkside", "Riverview", "Summit", "Heritage", "Stonegate", "Brookhaven", "Lakeshore",
    "Ashford",
];
const NAME_KINDS: &[&str] = &["Apartments", "Commons", "Flats", "Residences", "Lofts", "Village"];

/// Local stand-in used when no real source produced anything. Output is a pure
/// function of the query, so re-running a job writes the same natural keys.
#[derive(Debug, Clone)]
pub struct HeuristicAdapter {
    name: String,
    max_results: usize,
    timeout: Option<Duration>,
}

impl Default for HeuristicAdapter {
    fn default() -> Self {
        Self::new("heuristic")
    }
}

impl HeuristicAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_results: DEFAULT_HEURISTIC_RESULTS,
            timeout: None,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn generate(&self, query: &ScrapeQuery) -> Vec<RawRecord> {
        let anchor = canonical_address(&query.address);
        if anchor.is_empty() {
            return Vec::new();
        }
        let seed = hex::encode(Sha256::digest(anchor.as_bytes()));
        (0..self.max_results)
            .map(|index| self.synthesize(query, &seed, index))
            .collect()
    }

    fn synthesize(&self, query: &ScrapeQuery, seed: &str, index: usize) -> RawRecord {
        let b = Sha256::digest(format!("{seed}:{index}").as_bytes());
        let word = |i: usize| u16::from_be_bytes([b[i], b[i + 1]]) as u32;
        let pick = |list: &[&'static str], i: usize| list[b[i] as usize % list.len()];

        let street_no = 100 + word(0) % 9_000;
        let address = format!("{street_no} {} {}", pick(STREETS, 2), pick(SUFFIXES, 3));
        let name = format!("{} {}", pick(NAME_STEMS, 4), pick(NAME_KINDS, 5));

        let units = 40 + word(6) % 360;
        let year_built = 1965 + (b[8] as u32 % 58);
        let rent_pu = (900 + word(9) % 1_600) as f64;
        let avg_sqft = 650.0 + (word(11) % 600) as f64;
        let rent_psf = (rent_pu / avg_sqft * 100.0).round() / 100.0;
        let occupancy = 88.0 + (b[13] % 110) as f64 / 10.0;
        let concession = (b[14] % 50) as f64 / 10.0;

        RawRecord {
            name: Some(name),
            address: Some(address),
            units: Some(Loose::Number(units as f64)),
            year_built: Some(Loose::Number(year_built as f64)),
            rent_psf: Some(Loose::Number(rent_psf)),
            rent_pu: Some(Loose::Number(rent_pu)),
            occupancy_pct: Some(Loose::Text(format!("{occupancy:.1}%"))),
            concession_pct: Some(Loose::Text(format!("{concession:.1}%"))),
            amenities: query.amenities.clone(),
            notes: Some(format!(
                "Synthetic {} comparable within {} miles of {}",
                query.asset_type.to_lowercase(),
                query.radius_mi,
                query.address.trim()
            )),
            source: Some(self.name.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SourceAdapter for HeuristicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Heuristic
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn search(&self, query: &ScrapeQuery) -> Result<AdapterOutput, AdapterError> {
        Ok(AdapterOutput::new(self.generate(query)).with_caveat(HEURISTIC_CAVEAT))
    }
}
