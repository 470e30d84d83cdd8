//! RawRecord -> NormalizedRecord. Total: unparsable fields are dropped, never raised.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::{Loose, NormalizedRecord, RawRecord};

/// Street-suffix, directional and unit words collapsed to USPS-style abbreviations.
const ADDRESS_ABBREVIATIONS: &[(&str, &str)] = &[
    ("street", "st"),
    ("str", "st"),
    ("avenue", "ave"),
    ("av", "ave"),
    ("boulevard", "blvd"),
    ("road", "rd"),
    ("drive", "dr"),
    ("lane", "ln"),
    ("court", "ct"),
    ("place", "pl"),
    ("parkway", "pkwy"),
    ("highway", "hwy"),
    ("circle", "cir"),
    ("terrace", "ter"),
    ("square", "sq"),
    ("trail", "trl"),
    ("north", "n"),
    ("south", "s"),
    ("east", "e"),
    ("west", "w"),
    ("suite", "ste"),
    ("apartment", "apt"),
];

/// Canonical amenity tag and the phrases that imply it.
const AMENITY_VOCABULARY: &[(&str, &[&str])] = &[
    ("pool", &["pool", "pools", "swimming"]),
    ("gym", &["gym", "fitness", "fitness center", "workout"]),
    ("parking", &["parking", "garage", "carport", "covered parking"]),
    ("balcony", &["balcony", "balconies", "patio"]),
    ("laundry", &["laundry", "washer", "w d", "in unit laundry"]),
    ("pet-friendly", &["pet friendly", "pets allowed", "pet", "pets", "dog park"]),
    ("elevator", &["elevator", "elevators"]),
    ("concierge", &["concierge", "doorman"]),
    ("rooftop", &["rooftop", "roof deck", "sky deck"]),
    ("clubhouse", &["clubhouse", "club house"]),
    ("business-center", &["business center", "coworking", "co working"]),
    ("ev-charging", &["ev charging", "electric vehicle charging"]),
    ("storage", &["storage", "storage units"]),
    ("gated", &["gated", "controlled access"]),
];

/// Pure and total: the single boundary where untrusted shape becomes trusted shape.
pub fn normalize(raw: &RawRecord) -> NormalizedRecord {
    let name = clean_text(raw.name.as_deref());
    let address = clean_text(raw.address.as_deref());
    let city = clean_text(raw.city.as_deref());
    let state = clean_text(raw.state.as_deref());
    let zip = clean_text(raw.zip.as_deref());
    let notes = clean_text(raw.notes.as_deref());

    let units = raw
        .units
        .as_ref()
        .and_then(parse_number)
        .map(f64::round)
        .filter(|n| (1.0..=100_000.0).contains(n))
        .map(|n| n as u32);
    let year_built = raw
        .year_built
        .as_ref()
        .and_then(parse_number)
        .map(f64::round)
        .filter(|n| (1700.0..=2100.0).contains(n))
        .map(|n| n as i32);
    let rent_psf = raw.rent_psf.as_ref().and_then(parse_number).filter(|n| *n > 0.0);
    let rent_pu = raw.rent_pu.as_ref().and_then(parse_number).filter(|n| *n > 0.0);
    let occupancy_pct = raw.occupancy_pct.as_ref().and_then(parse_occupancy);
    let concession_pct = raw.concession_pct.as_ref().and_then(parse_percent);

    let amenities = extract_amenities(&raw.amenities, notes.as_deref());

    let canonical_address = match address.as_deref() {
        Some(street) => canonical_address(&compose_full_address(
            street,
            city.as_deref(),
            state.as_deref(),
            zip.as_deref(),
        )),
        None => String::new(),
    };

    let mut plan = unit_plan(units, rent_psf, rent_pu);
    if plan.is_empty() {
        if let Some(notes) = notes.as_deref() {
            plan = notes_signature(notes);
        }
    }

    NormalizedRecord {
        name,
        address,
        city,
        state,
        zip,
        units,
        year_built,
        rent_psf,
        rent_pu,
        occupancy_pct,
        concession_pct,
        amenities,
        notes,
        source: clean_text(raw.source.as_deref()),
        source_url: clean_text(raw.source_url.as_deref()),
        canonical_address,
        unit_plan: plan,
    }
}

/// Lowercase, strip punctuation, collapse whitespace, abbreviate suffix words.
/// Comma-separated segments are preserved.
pub fn canonical_address(text: &str) -> String {
    text.to_lowercase()
        .split(',')
        .map(|segment| {
            segment
                .chars()
                .map(|c| if c.is_alphanumeric() || c == '#' { c } else { ' ' })
                .collect::<String>()
                .split_whitespace()
                .map(abbreviate)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn abbreviate(token: &str) -> &str {
    ADDRESS_ABBREVIATIONS
        .iter()
        .find(|(long, _)| *long == token)
        .map(|(_, short)| *short)
        .unwrap_or(token)
}

fn compose_full_address(
    street: &str,
    city: Option<&str>,
    state: Option<&str>,
    zip: Option<&str>,
) -> String {
    let mut full = street.to_string();
    // Segments after the street line; matching is on whole segments or tokens.
    let locality = |full: &str| -> Vec<String> {
        full.split(',')
            .skip(1)
            .map(|segment| segment.trim().to_lowercase())
            .filter(|segment| !segment.is_empty())
            .collect()
    };
    let has_token = |segments: &[String], needle: &str| {
        let needle = needle.to_lowercase();
        segments
            .iter()
            .any(|segment| segment.split_whitespace().any(|t| t == needle))
    };

    if let Some(city) = city {
        let city_lower = city.to_lowercase();
        if !locality(&full).iter().any(|segment| *segment == city_lower) {
            full.push_str(", ");
            full.push_str(city);
        }
    }
    if let Some(state) = state {
        if !has_token(&locality(&full), state) {
            full.push_str(", ");
            full.push_str(state);
        }
    }
    if let Some(zip) = zip {
        if !has_token(&locality(&full), zip) {
            full.push(' ');
            full.push_str(zip);
        }
    }
    full
}

/// `150u|$1.95psf|$1800pu`, built from the fields that are present.
pub fn unit_plan(units: Option<u32>, rent_psf: Option<f64>, rent_pu: Option<f64>) -> String {
    let mut parts = Vec::with_capacity(3);
    if let Some(units) = units {
        parts.push(format!("{units}u"));
    }
    if let Some(psf) = rent_psf {
        parts.push(format!("${psf:.2}psf"));
    }
    if let Some(pu) = rent_pu {
        parts.push(format!("${pu:.0}pu"));
    }
    parts.join("|")
}

fn notes_signature(notes: &str) -> String {
    let normalized = notes
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("notes#{}", &digest[..8])
}

fn clean_text(value: Option<&str>) -> Option<String> {
    let trimmed = value?.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Accepts numbers and strings with currency symbols, thousands separators and units.
pub fn parse_number(value: &Loose) -> Option<f64> {
    match value {
        Loose::Number(n) => n.is_finite().then_some(*n),
        Loose::Text(text) => first_number(text),
    }
}

fn first_number(text: &str) -> Option<f64> {
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars().filter(|c| *c != ',' && *c != '_') {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if current.chars().any(|c| c.is_ascii_digit()) {
            break;
        }
        current.clear();
        seen_dot = false;
    }
    current.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Percentages are taken as given on the 0-100 scale, with or without a `%` sign.
pub fn parse_percent(value: &Loose) -> Option<f64> {
    let pct = (parse_number(value)? * 100.0).round() / 100.0;
    (0.0..=100.0).contains(&pct).then_some(pct)
}

/// Like [`parse_percent`], but an unsigned decimal fraction strictly between 0
/// and 1 (`0.95`) is read as a ratio. Occupancy below 1% is not a real reading.
pub fn parse_occupancy(value: &Loose) -> Option<f64> {
    let is_fraction = match value {
        Loose::Number(n) => *n > 0.0 && *n < 1.0,
        Loose::Text(text) => {
            !text.contains('%')
                && parse_number(value).is_some_and(|n| n > 0.0 && n < 1.0)
        }
    };
    if is_fraction {
        let n = parse_number(value)?;
        return parse_percent(&Loose::Number(n * 100.0));
    }
    parse_percent(value)
}

fn phrase_text(text: &str) -> String {
    let words = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    format!(" {} ", words.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn vocabulary_tag(phrase: &str) -> Option<&'static str> {
    let padded = phrase_text(phrase);
    AMENITY_VOCABULARY
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| padded.trim() == *k))
        .map(|(tag, _)| *tag)
}

/// Explicit tags are lowercased (and mapped onto the vocabulary when they match
/// it); notes are scanned for vocabulary phrases. The union is deduplicated.
pub fn extract_amenities(explicit: &[String], notes: Option<&str>) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    for tag in explicit {
        let lowered = tag.trim().to_lowercase();
        if lowered.is_empty() {
            continue;
        }
        match vocabulary_tag(&lowered) {
            Some(canonical) => tags.insert(canonical.to_string()),
            None => tags.insert(lowered),
        };
    }
    if let Some(notes) = notes {
        let padded = phrase_text(notes);
        for (tag, keywords) in AMENITY_VOCABULARY {
            if keywords.iter().any(|k| padded.contains(&format!(" {k} "))) {
                tags.insert((*tag).to_string());
            }
        }
    }
    tags
}
