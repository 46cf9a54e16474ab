/*!
sheetbase Command Line Interface

Inspects and loads a sheetbase database without going through the HTTP server.
Results are printed as JSON.
*/

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sheetbase::query::PageParams;
use sheetbase::service::UploadRequest;
use sheetbase::store::DuckDBStore;
use sheetbase::{DataService, PageRequest, ServiceConfig, VERSION};

#[derive(Parser)]
#[command(name = "sheetbase")]
#[command(about = "Query and manage uploaded tabular data")]
#[command(version = VERSION)]
pub struct Cli {
    /// Database connection string (duckdb://memory or duckdb://<path>)
    #[arg(long, global = true, env = "SHEETBASE_DATABASE", default_value = "duckdb://sheetbase.duckdb")]
    pub database: String,

    /// Rows per INSERT statement when importing
    #[arg(long, global = true, env = "SHEETBASE_BATCH_SIZE", default_value = "100")]
    pub batch_size: usize,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List dynamic tables
    Tables,

    /// Show the columns and attributes of a table
    Describe {
        /// Table name
        table: String,
    },

    /// Print one page of a table
    Query {
        /// Table name
        table: String,

        /// Page number, starting at 1
        #[arg(long)]
        page: Option<String>,

        /// Rows per page
        #[arg(long)]
        page_size: Option<String>,

        /// Field to sort by
        #[arg(long)]
        sort_field: Option<String>,

        /// ascend or descend
        #[arg(long)]
        sort_order: Option<String>,

        /// JSON object of field -> accepted values
        #[arg(long)]
        filters: Option<String>,

        /// JSON object of field -> substring
        #[arg(long)]
        search: Option<String>,
    },

    /// Drop a table
    Drop {
        /// Table name
        table: String,
    },

    /// Import an upload description (JSON with columns and parsed rows)
    Import {
        /// Path to the upload JSON file
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sheetbase=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let store = DuckDBStore::from_connection_string(&cli.database)
        .with_context(|| format!("Failed to open {}", cli.database))?;
    let config = ServiceConfig::default().with_batch_size(cli.batch_size);
    let service = DataService::new(Box::new(store), config)?;

    let output = match cli.command {
        Commands::Tables => serde_json::to_value(service.list_tables()?)?,
        Commands::Describe { table } => serde_json::to_value(service.describe_table(&table)?)?,
        Commands::Query {
            table,
            page,
            page_size,
            sort_field,
            sort_order,
            filters,
            search,
        } => {
            let params = PageParams {
                page,
                page_size,
                sort_field,
                sort_order,
                filters,
                search_keywords: search,
            };
            let request = PageRequest::from_params(&params, service.config());
            serde_json::to_value(service.query_table(&table, &request)?)?
        }
        Commands::Drop { table } => {
            service.drop_table(&table)?;
            serde_json::json!({ "dropped": table })
        }
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let request: UploadRequest = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid upload description in {}", file.display()))?;
            serde_json::to_value(service.upload(request)?)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
