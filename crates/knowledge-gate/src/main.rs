//! # Knowledge Gate CLI (`kgate`)
//!
//! The `kgate` binary is the primary interface for Knowledge Gate. It
//! provides commands for database initialization, document ingestion,
//! one-off queries, metrics, and starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! kgate --config ./config/kgate.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kgate init` | Create the SQLite database and run schema migrations |
//! | `kgate ingest <file>` | Ingest a document from a text file |
//! | `kgate query "<text>"` | Run a persona-scoped query and print the verdict |
//! | `kgate delete <id>` | Delete a document and its chunks |
//! | `kgate metrics` | Print store counters |
//! | `kgate serve` | Start the JSON HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! kgate init --config ./config/kgate.toml
//!
//! # Ingest a care note for resident R1
//! kgate ingest notes/r1-medication.txt --tenant r1 --category medical --role nurse
//!
//! # Query as the caregiver persona
//! kgate query "When does she take metformin?" --tenant r1 --persona caregiver
//!
//! # Start the HTTP server
//! kgate serve --config ./config/kgate.toml
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use knowledge_gate::cache::SingleFlightCache;
use knowledge_gate::config::{self, Config};
use knowledge_gate::db;
use knowledge_gate::embedding::{self, LocalProvider, RemoteProvider};
use knowledge_gate::ingest::Ingestor;
use knowledge_gate::orchestrator::Orchestrator;
use knowledge_gate::policy_store::PolicyStore;
use knowledge_gate::server;
use knowledge_gate::sinks::{AuditWriter, SqliteAuditSink, SqliteEscalationSink};
use knowledge_gate::sqlite_store::SqliteVectorStore;

use knowledge_gate_core::embedding::EmbeddingProvider;
use knowledge_gate_core::models::{Category, Document, Query, UploaderRole};
use knowledge_gate_core::store::VectorStore;
use knowledge_gate_core::validate::ValidationPipeline;

/// Knowledge Gate CLI — a safety-validated knowledge retrieval service
/// for resident-scoped conversational assistants.
#[derive(Parser)]
#[command(
    name = "kgate",
    about = "Knowledge Gate — safety-validated, persona-scoped knowledge retrieval",
    version,
    long_about = "Knowledge Gate ingests per-resident documents, embeds them with a \
    remote provider (with deterministic local fallback), and answers persona-scoped \
    queries through a six-stage validation pipeline covering freshness, authority, \
    conflicts, tenant isolation, confidence, and auditing."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Ingest a document from a text file.
    ///
    /// Chunks the file, embeds every chunk with each configured provider,
    /// and stores the result. Re-ingesting the same document id replaces
    /// its chunks and invalidates the tenant's cached verdicts.
    Ingest {
        /// Path to a UTF-8 text file.
        file: PathBuf,

        /// Tenant (resident) that owns this document.
        #[arg(long)]
        tenant: String,

        /// Category: medical, protocol, biography, or conversational.
        #[arg(long)]
        category: String,

        /// Uploader role: nurse, doctor, family, or staff.
        #[arg(long)]
        role: String,

        /// Document id; defaults to the file stem.
        #[arg(long)]
        id: Option<String>,
    },

    /// Run one query through the pipeline and print the verdict as JSON.
    Query {
        /// The question to ask.
        text: String,

        /// Tenant (resident) scope.
        #[arg(long)]
        tenant: String,

        /// Persona to evaluate the query under.
        #[arg(long)]
        persona: String,
    },

    /// Delete a document and all of its chunks and vectors.
    Delete {
        /// Document id.
        id: String,

        /// Tenant that owns the document; a mismatch deletes nothing.
        #[arg(long)]
        tenant: String,
    },

    /// Print store counters as JSON.
    Metrics,

    /// Start the JSON HTTP server on `[server].bind`.
    Serve,
}

/// Everything a running service needs, wired once from config.
struct App {
    store: Arc<dyn VectorStore>,
    ingestor: Arc<Ingestor>,
    orchestrator: Arc<Orchestrator>,
}

async fn build_app(config_path: &Path, config: &Config) -> Result<App> {
    let pool = db::connect(&config.db.path).await?;
    db::run_migrations(&pool).await?;

    let store: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(pool.clone()));

    let query_provider: Arc<dyn EmbeddingProvider> =
        embedding::create_provider(&config.embedding)?.into();

    // Ingest writes one vector per provider so queries served by either
    // side of the fallback find their matches.
    let ingest_providers: Vec<Arc<dyn EmbeddingProvider>> = match config.embedding.provider.as_str()
    {
        "fallback" => vec![
            Arc::new(RemoteProvider::new(&config.embedding)?),
            Arc::new(LocalProvider::new(config.embedding.dims)),
        ],
        "remote" => vec![Arc::new(RemoteProvider::new(&config.embedding)?)],
        _ => vec![Arc::new(LocalProvider::new(config.embedding.dims))],
    };

    let verdict_cache = SingleFlightCache::new(config.retrieval.cache_capacity);
    let embedding_cache = SingleFlightCache::new(config.retrieval.cache_capacity);

    let ingestor = Arc::new(Ingestor::new(
        Arc::clone(&store),
        ingest_providers,
        config.chunking.clone(),
        verdict_cache.clone(),
    ));

    let policies = Arc::new(PolicyStore::new(config_path, config.policy_set()?));
    let audit = AuditWriter::spawn(Arc::new(SqliteAuditSink::new(pool.clone())));
    let escalations = Arc::new(SqliteEscalationSink::new(pool));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        query_provider,
        ValidationPipeline::default(),
        policies,
        audit,
        escalations,
        verdict_cache,
        embedding_cache,
        config.retrieval.clone(),
    ));

    Ok(App {
        store,
        ingestor,
        orchestrator,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            db::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }

        Commands::Ingest {
            file,
            tenant,
            category,
            role,
            id,
        } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let document_id = id.unwrap_or_else(|| {
                file.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "document".to_string())
            });

            let doc = Document {
                id: document_id.clone(),
                tenant_id: tenant,
                category: Category::from_str(&category)?,
                uploader_role: UploaderRole::from_str(&role)?,
                created_at: Utc::now(),
                content,
                metadata: serde_json::json!({}),
            };

            let app = build_app(&cli.config, &cfg).await?;
            let chunks = app.ingestor.ingest(&doc).await?;
            println!("Ingested '{}' as {} chunks.", document_id, chunks);
        }

        Commands::Query {
            text,
            tenant,
            persona,
        } => {
            let app = build_app(&cli.config, &cfg).await?;
            let response = app
                .orchestrator
                .handle(Query::new(text, tenant, persona))
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Delete { id, tenant } => {
            let app = build_app(&cli.config, &cfg).await?;
            if app.ingestor.delete(&id, &tenant).await? {
                println!("Deleted document '{}'.", id);
            } else {
                println!("Document '{}' not found for tenant '{}'.", id, tenant);
            }
        }

        Commands::Metrics => {
            let app = build_app(&cli.config, &cfg).await?;
            let metrics = app.store.metrics().await?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }

        Commands::Serve => {
            let app = build_app(&cli.config, &cfg).await?;
            server::run_server(&cfg.server.bind, app.orchestrator, app.ingestor, app.store)
                .await?;
        }
    }

    Ok(())
}
