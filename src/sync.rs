//! Run orchestration: extract, transform, load, then advance the watermark.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::extract::{extract_since, max_updated_at, ProductCatalog};
use crate::store::{MergeOutcome, ProductStore};
use crate::transform::{detect_changes, enrich, partition, ChangeNotice};
use crate::watermark::WatermarkStore;

/// Where the store lives and which schema owns the destination tables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Postgres connection string.
    pub database_url: String,
    /// Schema holding the two destination tables.
    pub schema: String,
}

/// Terminal state of one successful sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Records were extracted, loaded, and the watermark considered for advance.
    Completed,
    /// The source had nothing newer than the watermark; nothing was written.
    NoNewRecords,
}

/// What one run saw and did, phase by phase.
#[derive(Debug)]
pub struct SyncReport {
    /// Watermark the extraction window started from.
    pub watermark_before: DateTime<Utc>,
    /// Watermark persisted by this run, when one was.
    pub watermark_after: Option<DateTime<Utc>>,
    /// Products extracted from the source.
    pub extracted: usize,
    /// Records that passed every validation rule.
    pub valid: usize,
    /// Records flagged for fixing.
    pub invalid: usize,
    /// Field-level changes detected against stored fingerprints.
    pub changes: Vec<ChangeNotice>,
    /// How the valid sub-batch landed, when one was loaded.
    pub valid_merge: Option<MergeOutcome>,
    /// How the needs-fixing sub-batch landed, when one was loaded.
    pub invalid_merge: Option<MergeOutcome>,
    /// Terminal state of the run.
    pub outcome: SyncOutcome,
}

impl SyncReport {
    /// Prints the run summary in one block.
    pub fn render(&self) {
        println!("--- Sync Summary ---");
        println!(
            "watermark before: {}",
            self.watermark_before
                .to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        match self.watermark_after {
            Some(timestamp) => println!(
                "watermark after: {}",
                timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            None => println!("watermark after: (unchanged)"),
        }
        println!("products extracted: {}", self.extracted);
        println!("valid records: {}", self.valid);
        println!("records needing fixes: {}", self.invalid);
        println!("changed records: {}", self.changes.len());
        if let Some(outcome) = &self.valid_merge {
            println!("valid_records load: {outcome}");
        }
        if let Some(outcome) = &self.invalid_merge {
            println!("needs_fixing_records load: {outcome}");
        }
    }
}

/// Drives one full sync run against `catalog`.
///
/// Sequences extraction, enrichment, change detection, and the two sub-batch
/// loads, then advances the watermark — and only then. An empty extraction or
/// any failure leaves both the store contents and the watermark exactly as a
/// re-run expects to find them: the next run re-extracts the same window and
/// the keyed merge absorbs the overlap.
pub async fn run_sync<C: ProductCatalog>(
    catalog: &C,
    store_config: &StoreConfig,
    watermark: &WatermarkStore,
) -> Result<SyncReport> {
    let watermark_before = watermark.read();

    let batch = extract_since(catalog, watermark_before)
        .await
        .context("extraction aborted")?;
    println!("Total products extracted: {}", batch.len());
    if batch.is_empty() {
        return Ok(SyncReport {
            watermark_before,
            watermark_after: None,
            extracted: 0,
            valid: 0,
            invalid: 0,
            changes: Vec::new(),
            valid_merge: None,
            invalid_merge: None,
            outcome: SyncOutcome::NoNewRecords,
        });
    }

    let mut store = ProductStore::connect(&store_config.database_url, &store_config.schema).await?;
    let valid_table = store.valid_table()?;
    let needs_fixing_table = store.needs_fixing_table()?;
    store.ensure_table(&valid_table).await?;
    store.ensure_table(&needs_fixing_table).await?;

    let records = enrich(&batch);
    let ids: Vec<String> = records.iter().map(|record| record.id.clone()).collect();
    let prior = store.fetch_fingerprints(&ids).await?;
    let changes = detect_changes(&records, &prior);
    for notice in &changes {
        println!("{notice}");
    }

    let (valid, invalid) = partition(records);
    println!(
        "Transformed {} products: {} valid, {} needing fixes",
        batch.len(),
        valid.len(),
        invalid.len()
    );

    let valid_merge = store
        .merge_batch(&valid_table, &needs_fixing_table, &valid)
        .await
        .context("failed to load valid records")?;
    if valid_merge.is_degraded() {
        eprintln!("valid_records: {valid_merge}");
    }
    let invalid_merge = store
        .merge_batch(&needs_fixing_table, &valid_table, &invalid)
        .await
        .context("failed to load needs-fixing records")?;
    if invalid_merge.is_degraded() {
        eprintln!("needs_fixing_records: {invalid_merge}");
    }

    let watermark_after = match max_updated_at(&batch) {
        Some(newest) => {
            watermark
                .write(newest)
                .context("failed to persist watermark")?;
            Some(newest)
        }
        None => None,
    };

    Ok(SyncReport {
        watermark_before,
        watermark_after,
        extracted: batch.len(),
        valid: valid.len(),
        invalid: invalid.len(),
        changes,
        valid_merge: Some(valid_merge),
        invalid_merge: Some(invalid_merge),
        outcome: SyncOutcome::Completed,
    })
}
