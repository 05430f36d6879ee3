use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use shopsync::{
    run_sync, ClientConfig, ProductStore, ShopifyClient, StoreConfig, TableRef, WatermarkStore,
    VALID_TABLE,
};

#[derive(Parser, Debug)]
#[command(
    name = "shopsync",
    about = "Sync Shopify products into Postgres and query the synced store"
)]
struct ShopsyncCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one incremental sync against the configured store
    Sync(SyncArgs),
    /// Run a SQL query against the synced tables
    Query(QueryArgs),
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Shopify store name (the <name> in <name>.myshopify.com)
    #[arg(long, env = "SHOPIFY_STORE_NAME")]
    store_name: Option<String>,

    /// Admin API access token
    #[arg(long, env = "SHOPIFY_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Admin API version
    #[arg(long, env = "SHOPIFY_ADMIN_API_VERSION", default_value = "2024-01")]
    api_version: String,

    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Target schema for the product tables
    #[arg(long, env = "SHOPSYNC_SCHEMA", default_value = "public")]
    schema: String,

    /// Path of the watermark file persisted between runs
    #[arg(long, env = "SHOPSYNC_WATERMARK", default_value = "data/watermark.json")]
    watermark: PathBuf,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Schema the product tables live in
    #[arg(long, env = "SHOPSYNC_SCHEMA", default_value = "public")]
    schema: String,

    /// SQL to execute; prompted on stdin when omitted
    #[arg(long)]
    sql: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = ShopsyncCli::parse();
    match cli.command {
        Command::Sync(args) => run_sync_command(args).await,
        Command::Query(args) => run_query_command(args).await,
    }
}

async fn run_sync_command(args: SyncArgs) -> Result<()> {
    let store_name = args
        .store_name
        .ok_or_else(|| anyhow!("SHOPIFY_STORE_NAME must be set to run a sync"))?;
    let access_token = args
        .access_token
        .ok_or_else(|| anyhow!("SHOPIFY_ACCESS_TOKEN must be set to run a sync"))?;

    let config = ClientConfig::new(store_name, access_token, args.api_version);
    let client = ShopifyClient::new(&config)?;
    let store_config = StoreConfig {
        database_url: args.database_url,
        schema: args.schema,
    };
    let watermark = WatermarkStore::new(args.watermark);

    let report = run_sync(&client, &store_config, &watermark).await?;
    report.render();
    Ok(())
}

async fn run_query_command(args: QueryArgs) -> Result<()> {
    let sql = match args.sql {
        Some(sql) => sql,
        None => prompt_for_sql(&args.schema)?,
    };
    let store = ProductStore::connect(&args.database_url, &args.schema).await?;
    let lines = store.run_query(&sql).await?;
    if lines.is_empty() {
        println!("(no rows)");
    }
    for line in &lines {
        println!("{line}");
    }
    Ok(())
}

fn prompt_for_sql(schema: &str) -> Result<String> {
    print!("Enter your SQL query: ");
    io::stdout().flush().context("failed to flush stdout")?;
    let mut input = String::new();
    io::stdin()
        .read_line(&mut input)
        .context("failed to read query from stdin")?;
    let sql = input.trim().to_string();
    if sql.is_empty() {
        let table = TableRef::new(schema, VALID_TABLE)?;
        return Ok(format!("SELECT * FROM {} LIMIT 5", table.qualified()));
    }
    Ok(sql)
}
