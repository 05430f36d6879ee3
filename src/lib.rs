#![warn(missing_docs)]
//! Core library for the shopsync incremental catalog pipeline.

pub mod client;
pub mod extract;
pub mod fingerprint;
pub mod store;
pub mod sync;
pub mod transform;
pub mod watermark;

pub use client::{ClientConfig, ShopifyClient};
pub use extract::{
    extract_since, max_updated_at, updated_after_filter, ProductCatalog, ProductsPage, RawProduct,
    RawVariant, PAGE_SIZE,
};
pub use fingerprint::{ChangedField, Fingerprint};
pub use store::{MergeOutcome, ProductStore, TableRef, NEEDS_FIXING_TABLE, VALID_TABLE};
pub use sync::{run_sync, StoreConfig, SyncOutcome, SyncReport};
pub use transform::{
    detect_changes, enrich, normalize_id, partition, ChangeNotice, ProductRecord, UNKNOWN_VENDOR,
};
pub use watermark::WatermarkStore;
