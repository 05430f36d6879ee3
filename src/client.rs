//! Shopify Admin GraphQL transport.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::extract::{
    updated_after_filter, ProductCatalog, ProductsPage, RawProduct, RawVariant, PRODUCTS_QUERY,
};

const ACCESS_TOKEN_HEADER: &str = "x-shopify-access-token";

/// Credentials and addressing for one Shopify store.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Store name, the `<name>` part of `<name>.myshopify.com`.
    pub store_name: String,
    /// Admin API access token.
    pub access_token: String,
    /// Admin API version segment, e.g. `2024-01`.
    pub api_version: String,
}

impl ClientConfig {
    /// Bundles the three credential values.
    pub fn new(
        store_name: impl Into<String>,
        access_token: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            store_name: store_name.into(),
            access_token: access_token.into(),
            api_version: api_version.into(),
        }
    }

    /// Admin GraphQL endpoint for this store.
    pub fn endpoint(&self) -> String {
        format!(
            "https://{}.myshopify.com/admin/api/{}/graphql.json",
            self.store_name.trim(),
            self.api_version.trim()
        )
    }
}

/// HTTP client for the Admin GraphQL API.
///
/// Built once and handed to the extractor; nothing in the pipeline reaches
/// for process-wide transport state.
pub struct ShopifyClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ShopifyClient {
    /// Builds an authorized client; fails when credentials are blank.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        anyhow::ensure!(
            !config.store_name.trim().is_empty(),
            "missing Shopify store name"
        );
        anyhow::ensure!(
            !config.access_token.trim().is_empty(),
            "missing Shopify access token"
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCESS_TOKEN_HEADER,
            HeaderValue::from_str(config.access_token.trim())
                .context("invalid Shopify access token")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build Shopify HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint(),
        })
    }

    /// Sends one GraphQL query and returns the parsed `data` payload.
    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: PageVariables<'_>,
    ) -> Result<T> {
        let request = GraphQlRequest { query, variables };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to call Shopify at {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("Shopify returned {}: {}", status, body);
        }

        let envelope: GraphQlResponse<T> = response
            .json()
            .await
            .context("failed to parse Shopify response")?;
        if let Some(errors) = envelope.errors {
            if !errors.is_empty() {
                let messages: Vec<&str> =
                    errors.iter().map(|error| error.message.as_str()).collect();
                bail!("Shopify rejected the query: {}", messages.join("; "));
            }
        }
        envelope
            .data
            .ok_or_else(|| anyhow!("Shopify response carried no data"))
    }
}

impl ProductCatalog for ShopifyClient {
    async fn products_page(
        &self,
        since: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<ProductsPage> {
        let variables = PageVariables {
            cursor,
            query: updated_after_filter(since),
        };
        let data: ProductsData = self.execute(PRODUCTS_QUERY, variables).await?;
        let connection = data.products;
        Ok(ProductsPage {
            records: connection
                .edges
                .into_iter()
                .map(|edge| edge.node.into())
                .collect(),
            has_next_page: connection.page_info.has_next_page,
            end_cursor: connection.page_info.end_cursor,
        })
    }
}

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: PageVariables<'a>,
}

#[derive(Serialize)]
struct PageVariables<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
    query: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProductsData {
    products: ProductsConnection,
}

#[derive(Debug, Deserialize)]
struct ProductsConnection {
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
    edges: Vec<ProductEdge>,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    #[serde(rename = "endCursor", default)]
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProductEdge {
    node: ProductNode,
}

#[derive(Debug, Deserialize)]
struct ProductNode {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    handle: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "updatedAt")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    variants: Option<VariantConnection>,
}

#[derive(Debug, Deserialize)]
struct VariantConnection {
    edges: Vec<VariantEdge>,
}

#[derive(Debug, Deserialize)]
struct VariantEdge {
    node: RawVariant,
}

impl From<ProductNode> for RawProduct {
    fn from(node: ProductNode) -> Self {
        Self {
            id: node.id,
            title: node.title,
            handle: node.handle,
            vendor: node.vendor,
            description: node.description,
            updated_at: node.updated_at,
            variants: node
                .variants
                .map(|connection| {
                    connection
                        .edges
                        .into_iter()
                        .map(|edge| edge.node)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_assembles_from_trimmed_parts() {
        let config = ClientConfig::new(" my-shop ", "token", " 2024-01 ");
        assert_eq!(
            config.endpoint(),
            "https://my-shop.myshopify.com/admin/api/2024-01/graphql.json"
        );
    }

    #[test]
    fn blank_credentials_are_rejected() {
        let no_name = ClientConfig::new("  ", "token", "2024-01");
        assert!(ShopifyClient::new(&no_name).is_err());

        let no_token = ClientConfig::new("my-shop", "", "2024-01");
        assert!(ShopifyClient::new(&no_token).is_err());
    }

    #[test]
    fn product_node_flattens_its_variant_connection() {
        let raw = r#"{
            "id": "gid://shopify/Product/42",
            "title": "Widget",
            "vendor": "Acme",
            "updatedAt": "2024-03-09T12:30:00Z",
            "variants": {
                "edges": [
                    {"node": {"price": "19.99", "inventoryQuantity": 3}},
                    {"node": {"price": null, "inventoryQuantity": null}}
                ]
            }
        }"#;
        let node: ProductNode = serde_json::from_str(raw).expect("node parses");
        let product = RawProduct::from(node);
        assert_eq!(product.id, "gid://shopify/Product/42");
        assert_eq!(product.variants.len(), 2);
        assert_eq!(product.variants[0].price.as_deref(), Some("19.99"));
        assert_eq!(product.variants[1].inventory_quantity, None);
        assert!(product.description.is_none());
    }

    #[test]
    fn missing_variant_connection_yields_empty_list() {
        let raw = r#"{"id": "gid://shopify/Product/7", "title": "Bare"}"#;
        let node: ProductNode = serde_json::from_str(raw).expect("node parses");
        let product = RawProduct::from(node);
        assert!(product.variants.is_empty());
        assert!(product.updated_at.is_none());
    }

    #[test]
    fn graphql_error_collection_parses() {
        let raw = r#"{"errors": [{"message": "Throttled"}]}"#;
        let envelope: GraphQlResponse<ProductsData> =
            serde_json::from_str(raw).expect("envelope parses");
        assert!(envelope.data.is_none());
        assert_eq!(envelope.errors.expect("errors")[0].message, "Throttled");
    }
}
