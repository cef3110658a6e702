//! mobile-table CLI
//!
//! Renders request URLs, imports rows into a persisted local store, runs
//! queries against it and pulls server rows into it.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use mobile_table::{ClientConfig, ColumnType, LocalStore, Query, QueryOrder, parse_filter};
use serde_json::Value;

/// `{ "<table>": { "<column>": "<type>" } }`
type SchemaFile = IndexMap<String, IndexMap<String, ColumnType>>;

#[derive(Parser)]
#[command(name = "mobile-table")]
#[command(about = "OData query builder and offline table store")]
#[command(after_help = "\
EXAMPLES:
    # Print the request URL for a query
    mobile-table url --app-url https://app.example.net/ --table todo \\
        --filter \"complete eq false\" --top 10 --order-by \"text asc\"

    # Import server rows into a local store
    mobile-table import --store ./offline --schema schema.json --table todo rows.json --from-server

    # Query the local store
    mobile-table read --store ./offline --schema schema.json --table todo --filter \"complete eq false\"

    # Pull open items from the service into the local store (http feature)
    mobile-table pull --app-url https://app.example.net/ --store ./offline --schema schema.json \\
        --table todo --filter \"complete eq false\" --query-id open
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the request URL for a query
    Url {
        #[arg(long)]
        app_url: String,

        #[arg(long)]
        table: String,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Upsert a JSON array of rows into a persisted store
    Import {
        #[command(flatten)]
        store: StoreArgs,

        /// File holding a JSON array of row objects
        rows: PathBuf,

        /// Ignore properties that have no column in the schema
        #[arg(long)]
        from_server: bool,
    },

    /// Run a query against a persisted store and print the result JSON
    Read {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Run a query against the remote service
    #[cfg(feature = "http")]
    Fetch {
        #[command(flatten)]
        remote: RemoteArgs,

        #[arg(long)]
        table: String,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Push queued local changes, then pull the query's rows into a persisted store
    #[cfg(feature = "http")]
    Pull {
        #[command(flatten)]
        remote: RemoteArgs,

        #[command(flatten)]
        store: StoreArgs,

        /// Only ask for rows updated since the last pull with this id
        #[arg(long)]
        query_id: Option<String>,

        #[command(flatten)]
        query: QueryArgs,
    },
}

#[cfg(feature = "http")]
#[derive(Args)]
struct RemoteArgs {
    #[arg(long)]
    app_url: String,

    /// Application key sent with each request
    #[arg(long)]
    application_key: Option<String>,
}

#[cfg(feature = "http")]
impl RemoteArgs {
    fn config(&self) -> ClientConfig {
        let config = ClientConfig::new(&self.app_url);
        match &self.application_key {
            Some(key) => config.with_application_key(key),
            None => config,
        }
    }
}

#[derive(Args)]
struct StoreArgs {
    /// Directory holding the store's table files
    #[arg(long)]
    store: PathBuf,

    /// JSON file declaring tables and column types
    #[arg(long)]
    schema: PathBuf,

    #[arg(long)]
    table: String,
}

#[derive(Args, Default)]
struct QueryArgs {
    /// OData filter expression
    #[arg(long)]
    filter: Option<String>,

    #[arg(long)]
    top: Option<u32>,

    #[arg(long)]
    skip: Option<u32>,

    /// "<field> [asc|desc]", repeatable
    #[arg(long = "order-by")]
    order_by: Vec<String>,

    /// Comma-separated field list
    #[arg(long, value_delimiter = ',')]
    select: Vec<String>,

    #[arg(long)]
    inline_count: bool,

    /// "<key>=<value>", repeatable; a bare key sends null
    #[arg(long = "param")]
    params: Vec<String>,
}

impl QueryArgs {
    fn build(&self, table: &str) -> anyhow::Result<Query> {
        let mut query = Query::table(table);
        if let Some(text) = &self.filter {
            let expr = parse_filter(text).with_context(|| format!("invalid filter: {text}"))?;
            query = query.with_filter(expr);
        }
        if let Some(top) = self.top {
            query = query.top(top);
        }
        if let Some(skip) = self.skip {
            query = query.skip(skip);
        }
        for spec in &self.order_by {
            let mut parts = spec.split_whitespace();
            let field = parts
                .next()
                .with_context(|| format!("empty --order-by '{spec}'"))?;
            let order = match parts.next() {
                None => QueryOrder::Ascending,
                Some(word) => serde_json::from_value(Value::String(word.to_lowercase()))
                    .with_context(|| format!("unknown sort order '{word}'"))?,
            };
            query = query.order_by(field, order);
        }
        if !self.select.is_empty() {
            query = query.select(&self.select);
        }
        if self.inline_count {
            query = query.include_inline_count();
        }
        for param in &self.params {
            query = match param.split_once('=') {
                Some((key, value)) => query.parameter(key, Some(value)),
                None => query.parameter(param.as_str(), None),
            };
        }
        Ok(query)
    }
}

/// Open the store with the schema file's tables defined, not yet initialized
fn define_store(args: &StoreArgs) -> anyhow::Result<LocalStore> {
    let text = std::fs::read_to_string(&args.schema)
        .with_context(|| format!("reading schema {}", args.schema.display()))?;
    let schema: SchemaFile = serde_json::from_str(&text).context("parsing schema file")?;

    let store = LocalStore::open(&args.store);
    for (table, columns) in schema {
        store.define_table(&table, columns)?;
    }
    Ok(store)
}

fn open_store(args: &StoreArgs) -> anyhow::Result<LocalStore> {
    let store = define_store(args)?;
    store.initialize()?;
    Ok(store)
}

fn read_rows(path: &Path) -> anyhow::Result<Vec<Value>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    match serde_json::from_str::<Value>(&text)? {
        Value::Array(rows) => Ok(rows),
        _ => anyhow::bail!("{} must hold a JSON array", path.display()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Url {
            app_url,
            table,
            query,
        } => {
            let query = query.build(&table)?;
            let url = ClientConfig::new(app_url).table_url(&table, &query)?;
            println!("{url}");
        }
        Command::Import {
            store,
            rows,
            from_server,
        } => {
            let items = read_rows(&rows)?;
            let local = open_store(&store)?;
            let written = local.upsert_many(&store.table, &items, from_server)?;
            log::info!("Imported {} rows into {}", written, store.table);
        }
        Command::Read { store, query } => {
            let local = open_store(&store)?;
            let result = local.read(&query.build(&store.table)?)?;
            println!("{}", serde_json::to_string_pretty(&result.to_json())?);
        }
        #[cfg(feature = "http")]
        Command::Fetch {
            remote,
            table,
            query,
        } => {
            let client = mobile_table::RemoteTable::new(
                remote.config(),
                mobile_table::HttpTransport::new(),
                &table,
            )?;
            let result = client.read(&query.build(&table)?).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        #[cfg(feature = "http")]
        Command::Pull {
            remote,
            store,
            query_id,
            query,
        } => {
            let sync = mobile_table::SyncContext::initialize(
                define_store(&store)?,
                remote.config(),
                mobile_table::HttpTransport::new(),
            )?;
            let query = query.build(&store.table)?;
            let pulled = match &query_id {
                Some(id) => sync.pull_incremental(&query, id).await?,
                None => sync.pull(&query).await?,
            };
            log::info!("Pulled {} rows into {}", pulled, store.table);
        }
    }
    Ok(())
}
