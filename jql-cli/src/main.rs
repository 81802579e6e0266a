use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use jql_core::{Backend, Config, Engine, MemoryRegistry, Migrator, Query, QueryResult};
#[cfg(feature = "mysql")]
use sqlx::mysql::MySqlPoolOptions;
#[cfg(feature = "postgres")]
use sqlx::postgres::PgPoolOptions;
#[cfg(feature = "sqlite")]
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use sqlx::{Database, IntoArguments};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "jql")]
#[command(about = "Run JQL documents and keep the schema in sync with declared models", long_about = None)]
struct Cli {
    /// Database URL (falls back to DATABASE_URL, then sqlite:jql.db)
    #[arg(short, long, global = true)]
    database: Option<String>,
    /// JSON file with the model declarations
    #[arg(short, long, global = true)]
    models: Option<PathBuf>,
    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a JQL document and print the result as JSON
    Exec {
        /// The document, or `@path` to read one; --file or stdin when omitted
        query: Option<String>,
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Confirm held-back destructive writes without prompting
        #[arg(long)]
        yes: bool,
    },
    /// Show what a schema sync would change
    Plan {
        #[command(flatten)]
        sync: SyncArgs,
        /// Print the SQL of each change
        #[arg(long)]
        sql: bool,
    },
    /// Apply the schema sync
    Migrate {
        #[command(flatten)]
        sync: SyncArgs,
        /// Skip confirmation prompts
        #[arg(long)]
        yes: bool,
    },
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct SyncArgs {
    /// Also drop tables and columns no model declares
    #[arg(long)]
    aggressive: bool,
    /// Skip the backup copy taken before destructive changes
    #[arg(long)]
    no_backup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbKind {
    Sqlite,
    Postgres,
    MySql,
}

impl DbKind {
    fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if url.starts_with("mysql://") || url.starts_with("mariadb://") {
            Some(Self::MySql)
        } else {
            None
        }
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if !run_cli(cli).await? {
        std::process::exit(1);
    }
    Ok(())
}

/// Connects to the backend named by the URL scheme and runs the command.
/// `Ok(false)` means the command ran but reported a failure.
async fn run_cli(cli: Cli) -> CliResult<bool> {
    let db_url = resolve_db_url(cli.database.clone());
    let kind = DbKind::from_url(&db_url)
        .ok_or_else(|| format!("unsupported database url {:?}", db_url))?;
    let registry = Arc::new(load_registry(cli.models.as_deref())?);
    let config = load_config(cli.config.as_deref())?;

    match kind {
        #[cfg(feature = "sqlite")]
        DbKind::Sqlite => run_command(sqlite_pool(&db_url).await?, registry, config, cli.command).await,
        #[cfg(feature = "postgres")]
        DbKind::Postgres => {
            let pool = PgPoolOptions::new().max_connections(5).connect(&db_url).await?;
            run_command(pool, registry, config, cli.command).await
        }
        #[cfg(feature = "mysql")]
        DbKind::MySql => {
            let pool = MySqlPoolOptions::new().max_connections(5).connect(&db_url).await?;
            run_command(pool, registry, config, cli.command).await
        }
        #[allow(unreachable_patterns)]
        other => Err(format!("jql was built without {:?} support", other).into()),
    }
}

async fn run_command<DB>(
    pool: sqlx::Pool<DB>,
    registry: Arc<MemoryRegistry>,
    config: Config,
    command: Commands,
) -> CliResult<bool>
where
    DB: Backend,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
{
    match command {
        Commands::Exec { query, file, yes } => {
            let text = read_query(query, file.as_deref())?;
            let engine = Engine::with_config(pool, registry, config);
            let result = run_exec(&engine, &text, yes).await?;
            println!("{}", result.to_json());
            Ok(result.success)
        }
        Commands::Plan { sync, sql } => {
            let migrator = migrator(pool, registry, &config, sync);
            let plan = migrator.plan().await?;
            print!("{}", plan.summary());
            if plan.is_empty() {
                println!();
            }
            if sql {
                for change in &plan.changes {
                    println!("{};", change.sql);
                }
            }
            Ok(true)
        }
        Commands::Migrate { sync, yes } => {
            let migrator = migrator(pool, registry, &config, sync);
            let plan = migrator.plan().await?;
            if plan.is_empty() {
                println!("[INFO] Schema is up to date.");
                return Ok(true);
            }
            print!("{}", plan.summary());
            if plan.has_destructive() && !yes && !confirm_action("Apply destructive changes?")? {
                println!("[INFO] Aborted.");
                return Ok(true);
            }
            migrator.execute(&plan).await?;
            println!("[OK] Applied {} change(s).", plan.changes.len());
            Ok(true)
        }
    }
}

/// Executes `text`; a write held for confirmation is resubmitted with its token once
/// the user (or `--yes`) agrees.
async fn run_exec<DB>(engine: &Engine<DB>, text: &str, yes: bool) -> CliResult<QueryResult>
where
    DB: Backend,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
{
    let query = match Query::parse(text) {
        Ok(query) => query,
        Err(err) => return Ok(err.into()),
    };
    let result = engine.execute(&query).await;
    if !result.is_pending_confirm() {
        return Ok(result);
    }

    let message = result
        .err()
        .map(|e| e.message.clone())
        .unwrap_or_else(|| "confirmation required".to_owned());
    if !yes && !confirm_action(&format!("{}. Proceed?", message))? {
        return Ok(result);
    }
    let confirmed = Query {
        confirm_token: result.confirm_token.clone(),
        ..query
    };
    Ok(engine.execute(&confirmed).await)
}

fn migrator<DB: Backend>(
    pool: sqlx::Pool<DB>,
    registry: Arc<MemoryRegistry>,
    config: &Config,
    sync: SyncArgs,
) -> Migrator<DB> {
    let mut migrator = Migrator::new(pool, registry).with_config(config);
    if sync.aggressive {
        migrator = migrator.aggressive(true);
    }
    if sync.no_backup {
        migrator = migrator.auto_backup(false);
    }
    migrator
}

fn confirm_action(prompt: &str) -> CliResult<bool> {
    eprint!("{} [y/N]: ", prompt);
    io::stderr().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let value = input.trim().to_ascii_lowercase();
    Ok(matches!(value.as_str(), "y" | "yes"))
}

/// The document from the argument (`@path` reads a file), `--file`, or stdin.
fn read_query(inline: Option<String>, file: Option<&Path>) -> CliResult<String> {
    match (inline, file) {
        (Some(text), _) if text.starts_with('@') => Ok(fs::read_to_string(&text[1..])?),
        (Some(text), _) if text != "-" => Ok(text),
        (_, Some(path)) => Ok(fs::read_to_string(path)?),
        _ => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

fn load_registry(path: Option<&Path>) -> CliResult<MemoryRegistry> {
    match path {
        Some(path) => Ok(MemoryRegistry::from_json(&fs::read_to_string(path)?)?),
        None => Ok(MemoryRegistry::new()),
    }
}

fn load_config(path: Option<&Path>) -> CliResult<Config> {
    match path {
        Some(path) => Ok(Config::from_file(path)?),
        None => Ok(Config::default()),
    }
}

fn resolve_db_url(database: Option<String>) -> String {
    database
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| "sqlite:jql.db".to_string())
}

#[cfg(feature = "sqlite")]
fn sqlite_connect_options(db_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    use std::str::FromStr;
    use std::time::Duration;

    let options = SqliteConnectOptions::from_str(db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));
    Ok(options)
}

#[cfg(feature = "sqlite")]
async fn sqlite_pool(db_url: &str) -> Result<SqlitePool, sqlx::Error> {
    SqlitePool::connect_with(sqlite_connect_options(db_url)?).await
}
