//! Validation, derived fields, and change detection for extracted products.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

use crate::extract::RawProduct;
use crate::fingerprint::{ChangedField, Fingerprint};

/// Sentinel recorded when the source has no vendor for a product.
pub const UNKNOWN_VENDOR: &str = "Unknown";

/// Substring marking placeholder titles that should never reach the catalog.
pub const TEST_TITLE_MARKER: &str = "test";

/// Products with fewer total units than this on hand are flagged for review.
pub const MIN_TOTAL_INVENTORY: i64 = 10;

/// One product after normalization and rule evaluation, ready to persist.
#[derive(Debug, Clone)]
pub struct ProductRecord {
    /// Stable identifier with the source GID prefix stripped.
    pub id: String,
    /// Product title as extracted.
    pub title: String,
    /// URL handle; empty when the source omits it.
    pub handle: String,
    /// Vendor, defaulted to [`UNKNOWN_VENDOR`] when the source has none.
    pub vendor: String,
    /// Description, defaulted to the empty string.
    pub description: String,
    /// Source-side modification time, carried for watermark computation.
    pub updated_at: Option<DateTime<Utc>>,
    /// Sum of variant quantities; missing quantities count as zero.
    pub total_inventory: i64,
    /// Whether any variant lacks a price.
    pub price_missing: bool,
    /// Whether at least one validation rule flagged this record.
    pub needs_fixing: bool,
    /// Variant list serialized to one opaque round-trippable JSON string.
    pub variants_json: String,
    /// Content fingerprint over (title, description, vendor).
    pub fingerprint: Fingerprint,
    /// Wall-clock transform time; informational, excluded from the fingerprint.
    pub processed_at: DateTime<Utc>,
}

/// Strips the `/`-delimited source prefix and surrounding whitespace from an id.
pub fn normalize_id(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .rsplit('/')
        .next()
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

/// Normalizes, derives, and flags a whole extracted batch.
///
/// Pure: a malformed record is default-filled, never a failure. Every record
/// in the input appears in the output exactly once.
pub fn enrich(batch: &[RawProduct]) -> Vec<ProductRecord> {
    let processed_at = Utc::now();
    batch
        .iter()
        .map(|raw| enrich_one(raw, processed_at))
        .collect()
}

fn enrich_one(raw: &RawProduct, processed_at: DateTime<Utc>) -> ProductRecord {
    let vendor = raw
        .vendor
        .clone()
        .unwrap_or_else(|| UNKNOWN_VENDOR.to_string());
    let description = raw.description.clone().unwrap_or_default();
    let total_inventory: i64 = raw
        .variants
        .iter()
        .map(|variant| variant.inventory_quantity.unwrap_or(0))
        .sum();
    let price_missing = raw
        .variants
        .iter()
        .any(|variant| variant.price.as_deref().map(str::trim).map_or(true, str::is_empty));
    let needs_fixing = vendor == UNKNOWN_VENDOR
        || description.is_empty()
        || title_has_test_marker(&raw.title)
        || total_inventory < MIN_TOTAL_INVENTORY
        || price_missing;
    let fingerprint = Fingerprint::compute(&raw.title, &description, &vendor);

    ProductRecord {
        id: normalize_id(&raw.id),
        title: raw.title.clone(),
        handle: raw.handle.clone().unwrap_or_default(),
        vendor,
        description,
        updated_at: raw.updated_at,
        total_inventory,
        price_missing,
        needs_fixing,
        variants_json: serde_json::to_string(&raw.variants).unwrap_or_default(),
        fingerprint,
        processed_at,
    }
}

// Evaluated per record, never against the batch as a whole.
fn title_has_test_marker(title: &str) -> bool {
    title.to_lowercase().contains(TEST_TITLE_MARKER)
}

/// Splits an enriched batch into (valid, needs-fixing) partitions.
pub fn partition(records: Vec<ProductRecord>) -> (Vec<ProductRecord>, Vec<ProductRecord>) {
    records.into_iter().partition(|record| !record.needs_fixing)
}

/// Field-level difference between a product and its previously stored fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    /// Normalized id of the changed product.
    pub id: String,
    /// Current title, for human-readable reporting.
    pub title: String,
    /// Components whose digests differ from the stored fingerprint.
    pub changed: Vec<ChangedField>,
}

impl fmt::Display for ChangeNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<String> = self.changed.iter().map(ChangedField::to_string).collect();
        write!(
            f,
            "product {} ({}): {}",
            self.id,
            self.title,
            fields.join(", ")
        )
    }
}

/// Compares each record against its stored fingerprint, if any.
///
/// Reporting only; persistence decisions never depend on the result. Records
/// without a stored fingerprint are new and skip comparison; an unparsable
/// stored fingerprint counts as "no history" rather than aborting the batch.
pub fn detect_changes(
    records: &[ProductRecord],
    prior: &HashMap<String, String>,
) -> Vec<ChangeNotice> {
    let mut notices = Vec::new();
    for record in records {
        let Some(stored) = prior.get(&record.id) else {
            continue;
        };
        let Some(previous) = Fingerprint::parse(stored) else {
            eprintln!(
                "ignoring unparsable stored fingerprint for product {}",
                record.id
            );
            continue;
        };
        let changed = record.fingerprint.diff(&previous);
        if !changed.is_empty() {
            notices.push(ChangeNotice {
                id: record.id.clone(),
                title: record.title.clone(),
                changed,
            });
        }
    }
    notices
}
