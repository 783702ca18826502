mod http;

use clap::{Parser, Subcommand};
use docpipe_core::{
    ChunkingStrategy, CompletionConfig, EmbeddingConfig, FixedWindowStrategy,
    HttpCompletionClient, HttpEmbeddingClient, PdfTextExtractor, PipelineOptions,
    PipelineOrchestrator, RestBlobStore, RestStateStore, SemanticStrategy, Visibility,
};
use http::{create_router, AppState};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docpipe-server", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// State store base URL (PostgREST-compatible)
    #[arg(long, env = "STATE_STORE_URL", default_value = "http://localhost:3000")]
    state_store_url: String,

    /// Service key for the state and blob stores
    #[arg(long, env = "STATE_STORE_KEY")]
    state_store_key: Option<String>,

    /// Binary storage base URL
    #[arg(long, env = "BLOB_STORE_URL", default_value = "http://localhost:8000")]
    blob_store_url: String,

    /// Embedding service base URL (OpenAI-compatible)
    #[arg(long, env = "EMBEDDING_URL", default_value = "http://localhost:11434/v1")]
    embedding_url: String,

    /// Embedding model identifier
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "nomic-embed-text")]
    embedding_model: String,

    /// Dimensionality of the embedding vectors
    #[arg(long, env = "EMBEDDING_DIMENSION", default_value = "768")]
    embedding_dimension: usize,

    /// API key for the embedding service
    #[arg(long, env = "EMBEDDING_API_KEY")]
    embedding_api_key: Option<String>,

    /// Completion service base URL (OpenAI-compatible)
    #[arg(long, env = "COMPLETION_URL", default_value = "http://localhost:11434/v1")]
    completion_url: String,

    /// Completion model identifier
    #[arg(long, env = "COMPLETION_MODEL", default_value = "llama3.1")]
    completion_model: String,

    /// API key for the completion service
    #[arg(long, env = "COMPLETION_API_KEY")]
    completion_api_key: Option<String>,

    /// Chunking strategy: fixed or semantic
    #[arg(long, env = "CHUNKING_STRATEGY", default_value = "fixed")]
    chunking_strategy: String,

    /// Documents per stage per processing run
    #[arg(long, default_value = "10")]
    batch_limit: usize,

    /// Seconds before an outbound call is abandoned
    #[arg(long, default_value = "30")]
    request_timeout_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the stage trigger API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8089")]
        bind: String,
        /// Shared secret required by /continue-processing.
        #[arg(long, env = "PIPELINE_SHARED_SECRET")]
        shared_secret: String,
    },
    /// Run one continue-processing pass and exit.
    RunOnce,
    /// Answer a question from the indexed chunks.
    Ask {
        #[arg(long)]
        question: String,
        #[arg(long, default_value = "private")]
        visibility: Visibility,
        /// Number of candidates fetched from similarity search.
        #[arg(long, default_value = "8")]
        top_k: usize,
    },
}

type Orchestrator = PipelineOrchestrator<RestBlobStore, RestStateStore, RestStateStore>;

fn build_orchestrator(cli: &Cli) -> anyhow::Result<Orchestrator> {
    let timeout = Duration::from_secs(cli.request_timeout_secs);
    let options = PipelineOptions {
        batch_limit: cli.batch_limit,
        ..PipelineOptions::default()
    };

    let state_store = RestStateStore::new(&cli.state_store_url, cli.state_store_key.clone(), timeout)?;
    let blob_store = RestBlobStore::new(&cli.blob_store_url, cli.state_store_key.clone(), timeout)?;

    let embedder = HttpEmbeddingClient::new(EmbeddingConfig {
        endpoint: cli.embedding_url.clone(),
        api_key: cli.embedding_api_key.clone(),
        model: cli.embedding_model.clone(),
        dimensions: cli.embedding_dimension,
        timeout,
    })?;

    let completion_config = CompletionConfig {
        endpoint: cli.completion_url.clone(),
        api_key: cli.completion_api_key.clone(),
        model: cli.completion_model.clone(),
        timeout,
    };
    let completion = HttpCompletionClient::new(completion_config.clone())?;

    let strategy: Box<dyn ChunkingStrategy> = match cli.chunking_strategy.as_str() {
        "fixed" => Box::new(FixedWindowStrategy {
            window_chars: options.chunk_window_chars,
        }),
        "semantic" => Box::new(
            SemanticStrategy::new(HttpCompletionClient::new(completion_config)?)
                .with_block_chars(options.semantic_block_chars),
        ),
        other => anyhow::bail!("unknown chunking strategy: {other}"),
    };

    let extractor = PdfTextExtractor {
        min_chars: options.min_extracted_chars,
    };

    Ok(PipelineOrchestrator::new(
        blob_store,
        state_store.clone(),
        state_store,
        Box::new(extractor),
        strategy,
        Box::new(embedder),
        Box::new(completion),
    )
    .with_options(options))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "docpipe boot");

    let orchestrator = build_orchestrator(&cli)?;

    match cli.command {
        Command::Serve {
            bind,
            shared_secret,
        } => {
            let state = AppState {
                pipeline: Arc::new(orchestrator),
                shared_secret,
            };
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!(%bind, "serving stage triggers");
            axum::serve(listener, create_router(state)).await?;
        }
        Command::RunOnce => {
            let summary = orchestrator.run_continue_processing().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Ask {
            question,
            visibility,
            top_k,
        } => {
            let answer = orchestrator
                .answer_question(visibility, &question, top_k)
                .await?;
            println!("{}", answer.text);
            for source in answer.sources {
                println!("source: {source}");
            }
        }
    }

    Ok(())
}
