//! Postgres persistence for enriched products: DDL, staged merges, lookups.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

use crate::transform::ProductRecord;

/// Destination for records that pass every validation rule.
pub const VALID_TABLE: &str = "valid_records";

/// Destination for records flagged by at least one validation rule.
pub const NEEDS_FIXING_TABLE: &str = "needs_fixing_records";

/// Non-key columns, in the order [`ProductRecord`] values are staged.
const DATA_COLUMNS: [&str; 11] = [
    "title",
    "handle",
    "vendor",
    "description",
    "updated_at",
    "total_inventory",
    "price_missing",
    "needs_fixing",
    "variants",
    "fingerprint",
    "processed_at",
];

/// Schema-qualified table identifier.
#[derive(Debug, Clone)]
pub struct TableRef {
    schema: String,
    table: String,
}

impl TableRef {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        anyhow::ensure!(!table.trim().is_empty(), "table name is required");
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Returns the raw schema string.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Returns the raw table string.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Session-temporary staging table name used while merging into this table.
    fn staging_name(&self) -> String {
        format!("staging_{}", sanitize_ident(&self.table))
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// How a sub-batch landed in its destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Keyed merge: staged rows were inserted, or overwrote rows sharing their id.
    Merged {
        /// Rows staged and merged.
        staged: u64,
    },
    /// The destination lacked a unique id key, so staged rows were appended
    /// without conflict handling. Duplicate ids are possible on this path.
    AppendedWithoutKey {
        /// Rows staged and appended.
        staged: u64,
    },
}

impl MergeOutcome {
    /// Rows the merge staged.
    pub fn staged(&self) -> u64 {
        match self {
            Self::Merged { staged } | Self::AppendedWithoutKey { staged } => *staged,
        }
    }

    /// True when the append fallback ran instead of a keyed merge.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::AppendedWithoutKey { .. })
    }
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merged { staged } => write!(f, "merged {} rows", staged),
            Self::AppendedWithoutKey { staged } => write!(
                f,
                "APPEND-ONLY fallback: {} rows appended without id conflict handling",
                staged
            ),
        }
    }
}

/// Handle to the product store, scoped to one run and released on drop.
pub struct ProductStore {
    client: Client,
    schema: String,
}

impl ProductStore {
    /// Connects to Postgres and spawns the connection driver.
    pub async fn connect(database_url: &str, schema: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to Postgres at {database_url}"))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                eprintln!("postgres connection error: {err}");
            }
        });
        Ok(Self {
            client,
            schema: schema.to_string(),
        })
    }

    /// Identifier of the valid-records table in this store's schema.
    pub fn valid_table(&self) -> Result<TableRef> {
        TableRef::new(&self.schema, VALID_TABLE)
    }

    /// Identifier of the needs-fixing table in this store's schema.
    pub fn needs_fixing_table(&self) -> Result<TableRef> {
        TableRef::new(&self.schema, NEEDS_FIXING_TABLE)
    }

    /// Creates `table` with an `id` primary key and text columns when absent.
    pub async fn ensure_table(&self, table: &TableRef) -> Result<()> {
        let ddl = create_table_sql(table);
        self.client
            .execute(&ddl, &[])
            .await
            .with_context(|| format!("failed to create table {}", table.qualified()))?;
        Ok(())
    }

    /// Fetches stored fingerprints for every id in `ids`, one query per table.
    pub async fn fetch_fingerprints(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let mut prior = HashMap::new();
        if ids.is_empty() {
            return Ok(prior);
        }
        for table in [self.valid_table()?, self.needs_fixing_table()?] {
            let sql = format!(
                "SELECT id, fingerprint FROM {} WHERE id = ANY($1)",
                table.qualified()
            );
            let rows = self
                .client
                .query(&sql, &[&ids])
                .await
                .with_context(|| {
                    format!("failed to fetch fingerprints from {}", table.qualified())
                })?;
            for row in rows {
                let id: String = row.get(0);
                let fingerprint: Option<String> = row.get(1);
                if let Some(fingerprint) = fingerprint {
                    prior.insert(id, fingerprint);
                }
            }
        }
        Ok(prior)
    }

    /// True when `table` already enforces a unique key over `id` alone.
    pub async fn has_unique_id_key(&self, table: &TableRef) -> Result<bool> {
        const SQL: &str = "SELECT EXISTS (
            SELECT 1
            FROM pg_index i
            JOIN pg_class c ON c.oid = i.indrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey)
            WHERE n.nspname = $1
              AND c.relname = $2
              AND i.indisunique
              AND i.indnkeyatts = 1
              AND a.attname = 'id'
        )";
        let row = self
            .client
            .query_one(SQL, &[&table.schema(), &table.table()])
            .await
            .with_context(|| format!("failed to inspect keys on {}", table.qualified()))?;
        Ok(row.get(0))
    }

    /// Stages `records` and merges them into `table` keyed by id.
    ///
    /// The whole sub-batch commits in one transaction: staging inserts, one
    /// set-based merge, and removal of the staged ids from `opposite` (a
    /// record whose needs-fixing status flipped moves tables atomically).
    /// When `table` has no unique id key the merge degrades to a plain
    /// append, reported as a distinct [`MergeOutcome`]. An empty sub-batch is
    /// a no-op.
    pub async fn merge_batch(
        &mut self,
        table: &TableRef,
        opposite: &TableRef,
        records: &[ProductRecord],
    ) -> Result<MergeOutcome> {
        if records.is_empty() {
            return Ok(MergeOutcome::Merged { staged: 0 });
        }

        let keyed = self.has_unique_id_key(table).await?;
        let staging = table.staging_name();

        let transaction = self
            .client
            .transaction()
            .await
            .context("failed to open merge transaction")?;

        let staging_ddl = create_staging_sql(&staging);
        transaction
            .execute(&staging_ddl, &[])
            .await
            .with_context(|| format!("failed to create staging table {staging}"))?;

        let insert = staging_insert_sql(&staging);
        let statement = transaction
            .prepare(&insert)
            .await
            .context("failed to prepare staging insert")?;
        for record in records {
            let row = record_text_row(record);
            let params: Vec<&(dyn ToSql + Sync)> = row
                .iter()
                .map(|value| value as &(dyn ToSql + Sync))
                .collect();
            transaction
                .execute(&statement, &params)
                .await
                .with_context(|| format!("failed to stage product {}", record.id))?;
        }

        let merge = merge_sql(table, &staging, keyed);
        transaction
            .execute(&merge, &[])
            .await
            .with_context(|| format!("failed to merge staged rows into {}", table.qualified()))?;

        let ids: Vec<String> = records.iter().map(|record| record.id.clone()).collect();
        let cleanup = format!("DELETE FROM {} WHERE id = ANY($1)", opposite.qualified());
        transaction
            .execute(&cleanup, &[&ids])
            .await
            .with_context(|| {
                format!("failed to clear flipped ids from {}", opposite.qualified())
            })?;

        transaction
            .commit()
            .await
            .context("failed to commit merge transaction")?;

        let staged = records.len() as u64;
        Ok(if keyed {
            MergeOutcome::Merged { staged }
        } else {
            MergeOutcome::AppendedWithoutKey { staged }
        })
    }

    /// Runs a caller-supplied query and renders each row as tab-separated text.
    pub async fn run_query(&self, sql: &str) -> Result<Vec<String>> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .context("query failed")?;
        let mut lines = Vec::new();
        for message in messages {
            match message {
                SimpleQueryMessage::Row(row) => {
                    let mut fields = Vec::with_capacity(row.len());
                    for index in 0..row.len() {
                        fields.push(row.get(index).unwrap_or(""));
                    }
                    lines.push(fields.join("\t"));
                }
                SimpleQueryMessage::CommandComplete(count) => {
                    lines.push(format!("({count} rows)"));
                }
                _ => {}
            }
        }
        Ok(lines)
    }
}

fn create_table_sql(table: &TableRef) -> String {
    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    id TEXT PRIMARY KEY",
        table.qualified()
    );
    for column in DATA_COLUMNS {
        ddl.push_str(&format!(",\n    {column} TEXT"));
    }
    ddl.push_str("\n)");
    ddl
}

fn create_staging_sql(staging: &str) -> String {
    let mut ddl = format!(
        "CREATE TEMP TABLE {} (\n    id TEXT",
        quote_ident(staging)
    );
    for column in DATA_COLUMNS {
        ddl.push_str(&format!(",\n    {column} TEXT"));
    }
    ddl.push_str("\n) ON COMMIT DROP");
    ddl
}

fn staging_insert_sql(staging: &str) -> String {
    let columns: Vec<&str> = std::iter::once("id").chain(DATA_COLUMNS).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("${n}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(staging),
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn merge_sql(table: &TableRef, staging: &str, keyed: bool) -> String {
    let columns: Vec<&str> = std::iter::once("id").chain(DATA_COLUMNS).collect();
    let column_list = columns.join(", ");
    let mut sql = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        table.qualified(),
        column_list,
        column_list,
        quote_ident(staging)
    );
    if keyed {
        let assignments: Vec<String> = DATA_COLUMNS
            .iter()
            .map(|column| format!("{column} = EXCLUDED.{column}"))
            .collect();
        sql.push_str(" ON CONFLICT (id) DO UPDATE SET ");
        sql.push_str(&assignments.join(", "));
    }
    sql
}

fn record_text_row(record: &ProductRecord) -> [String; 12] {
    [
        record.id.clone(),
        record.title.clone(),
        record.handle.clone(),
        record.vendor.clone(),
        record.description.clone(),
        record
            .updated_at
            .map(|timestamp| timestamp.to_rfc3339())
            .unwrap_or_default(),
        record.total_inventory.to_string(),
        record.price_missing.to_string(),
        record.needs_fixing.to_string(),
        record.variants_json.clone(),
        record.fingerprint.to_stored(),
        record.processed_at.to_rfc3339(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn table() -> TableRef {
        TableRef::new("public", VALID_TABLE).expect("valid table ref")
    }

    fn record() -> ProductRecord {
        ProductRecord {
            id: "42".to_string(),
            title: "Steel Widget".to_string(),
            handle: "steel-widget".to_string(),
            vendor: "Acme".to_string(),
            description: "A fine widget".to_string(),
            updated_at: Some(Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 0).unwrap()),
            total_inventory: 15,
            price_missing: false,
            needs_fixing: false,
            variants_json: "[]".to_string(),
            fingerprint: Fingerprint::compute("Steel Widget", "A fine widget", "Acme"),
            processed_at: Utc.with_ymd_and_hms(2024, 3, 9, 13, 0, 0).unwrap(),
        }
    }

    #[test]
    fn qualified_name_quotes_identifiers() {
        assert_eq!(table().qualified(), "\"public\".\"valid_records\"");
        let odd = TableRef::new("sch\"ema", "tab\"le").expect("ref");
        assert_eq!(odd.qualified(), "\"sch\"\"ema\".\"tab\"\"le\"");
    }

    #[test]
    fn blank_identifiers_are_rejected() {
        assert!(TableRef::new("  ", "table").is_err());
        assert!(TableRef::new("schema", "").is_err());
    }

    #[test]
    fn create_table_sql_keys_on_id_with_text_columns() {
        let ddl = create_table_sql(&table());
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"public\".\"valid_records\""));
        assert!(ddl.contains("id TEXT PRIMARY KEY"));
        assert!(ddl.contains("fingerprint TEXT"));
        assert!(ddl.contains("variants TEXT"));
    }

    #[test]
    fn staging_insert_binds_every_column_once() {
        let sql = staging_insert_sql("staging_valid_records");
        assert!(sql.contains("(id, title, handle, vendor, description, updated_at, total_inventory, price_missing, needs_fixing, variants, fingerprint, processed_at)"));
        assert!(sql.contains("$12"));
        assert!(!sql.contains("$13"));
    }

    #[test]
    fn merge_sql_overwrites_every_non_key_column_when_keyed() {
        let sql = merge_sql(&table(), "staging_valid_records", true);
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE SET"));
        for column in DATA_COLUMNS {
            assert!(
                sql.contains(&format!("{column} = EXCLUDED.{column}")),
                "missing overwrite for {column}"
            );
        }
    }

    #[test]
    fn merge_sql_degrades_to_plain_append_without_key() {
        let sql = merge_sql(&table(), "staging_valid_records", false);
        assert!(!sql.contains("ON CONFLICT"));
        assert!(sql.starts_with("INSERT INTO \"public\".\"valid_records\""));
    }

    #[test]
    fn record_text_row_matches_column_order() {
        let row = record_text_row(&record());
        assert_eq!(row[0], "42");
        assert_eq!(row[1], "Steel Widget");
        assert_eq!(row[5], "2024-03-09T12:30:00+00:00");
        assert_eq!(row[6], "15");
        assert_eq!(row[7], "false");
        assert_eq!(row[8], "false");
        assert_eq!(row.len(), DATA_COLUMNS.len() + 1);
    }

    #[test]
    fn record_without_updated_at_stores_empty_text() {
        let mut missing = record();
        missing.updated_at = None;
        assert_eq!(record_text_row(&missing)[5], "");
    }

    #[test]
    fn merge_outcome_reports_degradation_distinctly() {
        let merged = MergeOutcome::Merged { staged: 3 };
        let degraded = MergeOutcome::AppendedWithoutKey { staged: 3 };
        assert!(!merged.is_degraded());
        assert!(degraded.is_degraded());
        assert_eq!(merged.staged(), degraded.staged());
        assert!(degraded.to_string().contains("APPEND-ONLY"));
    }
}
