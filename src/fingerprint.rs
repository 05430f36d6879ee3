//! Content fingerprints used to detect which product fields changed between syncs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Per-field content digests for one product.
///
/// A fingerprint is a pure function of (title, description, vendor); two
/// products with identical text always produce byte-identical fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Digest of the product title.
    pub title: String,
    /// Digest of the description (empty string when the source has none).
    pub description: String,
    /// Digest of the vendor (empty string when the source has none).
    pub vendor: String,
}

impl Fingerprint {
    /// Computes the three component digests over the given text fields.
    pub fn compute(title: &str, description: &str, vendor: &str) -> Self {
        Self {
            title: digest_component(title),
            description: digest_component(description),
            vendor: digest_component(vendor),
        }
    }

    /// Serializes the fingerprint into the single-string form kept in the store.
    pub fn to_stored(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses a stored fingerprint; `None` when the stored text is not one.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Lists the components whose digests differ from `prior`.
    pub fn diff(&self, prior: &Self) -> Vec<ChangedField> {
        let mut changed = Vec::new();
        if self.title != prior.title {
            changed.push(ChangedField::Title);
        }
        if self.description != prior.description {
            changed.push(ChangedField::Description);
        }
        if self.vendor != prior.vendor {
            changed.push(ChangedField::Vendor);
        }
        changed
    }
}

/// A fingerprint component that no longer matches its stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangedField {
    /// The title digest differs.
    Title,
    /// The description digest differs.
    Description,
    /// The vendor digest differs.
    Vendor,
}

impl fmt::Display for ChangedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Title => write!(f, "title changed"),
            Self::Description => write!(f, "description changed"),
            Self::Vendor => write!(f, "vendor changed"),
        }
    }
}

fn digest_component(text: &str) -> String {
    let hash = Sha256::digest(text.as_bytes());
    format!("sha256:{}", hex::encode(hash))
}
