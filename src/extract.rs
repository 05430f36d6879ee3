//! Cursor-paginated extraction of products updated since the watermark.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Products requested per page; matches the `first:` argument in [`PRODUCTS_QUERY`].
pub const PAGE_SIZE: usize = 50;

/// Admin GraphQL query for one page of products updated after the watermark.
pub const PRODUCTS_QUERY: &str = r#"
query GetProducts($cursor: String, $query: String) {
  products(first: 50, after: $cursor, query: $query) {
    pageInfo {
      hasNextPage
      endCursor
    }
    edges {
      node {
        id
        title
        handle
        vendor
        description
        updatedAt
        variants(first: 100) {
          edges {
            node {
              price
              inventoryQuantity
            }
          }
        }
      }
    }
  }
}
"#;

/// One inventory variant as returned by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVariant {
    /// Unit price as a decimal string; `None` when the source has no price.
    #[serde(default)]
    pub price: Option<String>,
    /// Units on hand; `None` when the source does not track the quantity.
    #[serde(default, rename = "inventoryQuantity")]
    pub inventory_quantity: Option<i64>,
}

/// One product exactly as extracted, before normalization.
#[derive(Debug, Clone)]
pub struct RawProduct {
    /// Source identifier, still carrying the `gid://` prefix.
    pub id: String,
    /// Product title; empty when the source omits it.
    pub title: String,
    /// URL handle, carried through as opaque text.
    pub handle: Option<String>,
    /// Vendor name; `None` when unset at the source.
    pub vendor: Option<String>,
    /// Long-form description; `None` when unset at the source.
    pub description: Option<String>,
    /// Source-side modification time; feeds only the watermark.
    pub updated_at: Option<DateTime<Utc>>,
    /// Ordered variant list, already unwrapped from the connection shape.
    pub variants: Vec<RawVariant>,
}

/// One page of extraction output plus the cursor state needed to continue.
#[derive(Debug, Clone)]
pub struct ProductsPage {
    /// Records on this page, in source order.
    pub records: Vec<RawProduct>,
    /// Whether the source reports another page after this one.
    pub has_next_page: bool,
    /// Opaque cursor to request the next page with.
    pub end_cursor: Option<String>,
}

/// Remote catalog capable of serving watermark-filtered product pages.
///
/// The sync pipeline takes this as a value so tests can script pages without
/// a network; [`crate::client::ShopifyClient`] is the production impl.
#[allow(async_fn_in_trait)]
pub trait ProductCatalog {
    /// Fetches one page of products updated strictly after `since`.
    async fn products_page(
        &self,
        since: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<ProductsPage>;
}

/// Renders the watermark as the source's search filter argument.
pub fn updated_after_filter(since: DateTime<Utc>) -> String {
    format!(
        "updated_at:>'{}'",
        since.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Accumulates every product updated after `since`, page by page.
///
/// Stops when the source reports no further pages or returns an empty page
/// (nothing newer than the watermark). Any transport failure aborts the whole
/// extraction; a partial page set is never handed downstream.
pub async fn extract_since<C: ProductCatalog>(
    catalog: &C,
    since: DateTime<Utc>,
) -> Result<Vec<RawProduct>> {
    let mut all_products = Vec::new();
    let mut cursor: Option<String> = None;

    println!(
        "Extracting products updated after {}...",
        since.to_rfc3339_opts(SecondsFormat::Secs, true)
    );

    loop {
        let page = catalog.products_page(since, cursor.as_deref()).await?;
        if page.records.is_empty() {
            break;
        }
        all_products.extend(page.records);
        println!("Fetched {} products so far...", all_products.len());
        if !page.has_next_page {
            break;
        }
        cursor = page.end_cursor;
    }

    Ok(all_products)
}

/// Explicit max of `updated_at` across the batch.
///
/// The source's page ordering is never trusted for watermark computation.
pub fn max_updated_at(batch: &[RawProduct]) -> Option<DateTime<Utc>> {
    batch.iter().filter_map(|product| product.updated_at).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use chrono::TimeZone;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    struct ScriptedCatalog {
        pages: RefCell<VecDeque<Result<ProductsPage>>>,
        seen_cursors: RefCell<Vec<Option<String>>>,
    }

    impl ScriptedCatalog {
        fn new(pages: Vec<Result<ProductsPage>>) -> Self {
            Self {
                pages: RefCell::new(pages.into()),
                seen_cursors: RefCell::new(Vec::new()),
            }
        }
    }

    impl ProductCatalog for ScriptedCatalog {
        async fn products_page(
            &self,
            _since: DateTime<Utc>,
            cursor: Option<&str>,
        ) -> Result<ProductsPage> {
            self.seen_cursors
                .borrow_mut()
                .push(cursor.map(str::to_string));
            match self.pages.borrow_mut().pop_front() {
                Some(page) => page,
                None => bail!("catalog asked for more pages than scripted"),
            }
        }
    }

    fn product(id: &str, updated_at: Option<DateTime<Utc>>) -> RawProduct {
        RawProduct {
            id: id.to_string(),
            title: format!("Product {id}"),
            handle: None,
            vendor: Some("Acme".to_string()),
            description: Some("desc".to_string()),
            updated_at,
            variants: Vec::new(),
        }
    }

    fn page(ids: &[&str], has_next_page: bool, end_cursor: Option<&str>) -> ProductsPage {
        ProductsPage {
            records: ids.iter().map(|id| product(id, None)).collect(),
            has_next_page,
            end_cursor: end_cursor.map(str::to_string),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn accumulates_across_pages_and_threads_cursors() {
        let catalog = ScriptedCatalog::new(vec![
            Ok(page(&["gid://1", "gid://2"], true, Some("cur-a"))),
            Ok(page(&["gid://3"], false, Some("cur-b"))),
        ]);

        let batch = extract_since(&catalog, DateTime::UNIX_EPOCH)
            .await
            .expect("extraction succeeds");

        assert_eq!(batch.len(), 3);
        assert_eq!(batch[2].id, "gid://3");
        assert_eq!(
            *catalog.seen_cursors.borrow(),
            vec![None, Some("cur-a".to_string())]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_first_page_returns_empty_batch() {
        let catalog = ScriptedCatalog::new(vec![Ok(page(&[], true, Some("unused")))]);

        let batch = extract_since(&catalog, DateTime::UNIX_EPOCH)
            .await
            .expect("empty page is not an error");

        assert!(batch.is_empty());
        assert_eq!(*catalog.seen_cursors.borrow(), vec![None]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transport_error_aborts_and_discards_partial_pages() {
        let catalog = ScriptedCatalog::new(vec![
            Ok(page(&["gid://1"], true, Some("cur-a"))),
            Err(anyhow::anyhow!("connection reset")),
        ]);

        let result = extract_since(&catalog, DateTime::UNIX_EPOCH).await;

        assert!(result.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stops_when_source_reports_no_next_page() {
        let catalog = ScriptedCatalog::new(vec![Ok(page(&["gid://1"], false, None))]);

        let batch = extract_since(&catalog, DateTime::UNIX_EPOCH)
            .await
            .expect("single page");

        assert_eq!(batch.len(), 1);
        assert_eq!(*catalog.seen_cursors.borrow(), vec![None]);
    }

    #[test]
    fn max_updated_at_takes_explicit_max_regardless_of_order() {
        let newest = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let batch = vec![
            product("gid://1", Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap())),
            product("gid://2", Some(newest)),
            product("gid://3", None),
            product("gid://4", Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())),
        ];
        assert_eq!(max_updated_at(&batch), Some(newest));
    }

    #[test]
    fn max_updated_at_is_none_when_no_record_carries_a_timestamp() {
        let batch = vec![product("gid://1", None)];
        assert_eq!(max_updated_at(&batch), None);
        assert_eq!(max_updated_at(&[]), None);
    }

    #[test]
    fn filter_renders_strictly_after_clause() {
        let since = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 0).unwrap();
        assert_eq!(
            updated_after_filter(since),
            "updated_at:>'2024-03-09T12:30:00Z'"
        );
    }

    #[test]
    fn variants_round_trip_through_serde() {
        let variants = vec![
            RawVariant {
                price: Some("19.99".to_string()),
                inventory_quantity: Some(4),
            },
            RawVariant {
                price: None,
                inventory_quantity: None,
            },
        ];
        let serialized = serde_json::to_string(&variants).expect("serialize");
        let parsed: Vec<RawVariant> = serde_json::from_str(&serialized).expect("parse");
        assert_eq!(parsed, variants);
    }
}
