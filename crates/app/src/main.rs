use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use shareholder_rag_core::openai::{
    DEFAULT_BASE_URL, DEFAULT_CHAT_MODEL, DEFAULT_EMBEDDING_BATCH, DEFAULT_EMBEDDING_MODEL,
    DEFAULT_RERANK_MODEL,
};
use shareholder_rag_core::{
    ingest_documents, Agent, AgentOptions, AgentReply, CharacterNgramEmbedder,
    ConversationMemory, Embedder, IndexStore, IngestionOptions, JsonMessageStore,
    LlmRelevanceScorer, MemoryIndexStore, OpenAiChatModel, OpenAiConfig, OpenAiEmbedder, QdrantStore, QueryFilter,
    RelevanceScorer, Retriever, TermOverlapScorer, AGENT_NAME, DEFAULT_EMBEDDING_DIMENSIONS,
    DEFAULT_INDEX_NAME,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "letters-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the letters as markdown, searched recursively.
    #[arg(long, env = "DOCUMENTS_DIR", default_value = "documents")]
    documents_dir: PathBuf,

    /// Where chunk vectors live.
    #[arg(long, value_enum, default_value_t = StoreKind::Qdrant)]
    store: StoreKind,

    /// Qdrant base URL
    #[arg(long, env = "VECTOR_STORE_URL", default_value = "http://localhost:6333")]
    vector_store_url: String,

    #[arg(long, env = "QDRANT_API_KEY", hide_env_values = true)]
    qdrant_api_key: Option<String>,

    #[arg(long, default_value = DEFAULT_INDEX_NAME)]
    index: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    openai_base_url: String,

    #[arg(long, default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    #[arg(long, default_value = DEFAULT_CHAT_MODEL)]
    chat_model: String,

    #[arg(long, default_value = DEFAULT_RERANK_MODEL)]
    rerank_model: String,

    /// Embed with local character n-grams and rerank by term overlap.
    #[arg(long, default_value_t = false)]
    offline: bool,

    /// JSON file with agent options (semanticRecall, threads, lastMessages, reranker).
    #[arg(long)]
    agent_config: Option<PathBuf>,

    /// Overrides reranker.minScore from the agent options.
    #[arg(long)]
    min_score: Option<f64>,

    /// Directory holding conversation history, one file per resource.
    #[arg(long, env = "MEMORY_DIR", default_value = ".letters-rag/memory")]
    memory_dir: PathBuf,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// In-process index, rebuilt from the documents directory on every run.
    Memory,
    Qdrant,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk, embed and index every letter in the documents directory.
    Ingest,
    /// Retrieve reranked passages for a query and print them with citations.
    Query {
        text: String,
        #[arg(long)]
        top_k: Option<usize>,
        /// Only consider letters from this year.
        #[arg(long)]
        year: Option<u32>,
    },
    /// Ask the analyst a single question.
    Ask {
        question: String,
        #[arg(long, default_value = "default")]
        resource: String,
        #[arg(long)]
        thread: Option<String>,
    },
    /// Interactive conversation with the analyst.
    Chat {
        #[arg(long, default_value = "default")]
        resource: String,
        #[arg(long)]
        thread: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "letters-rag boot"
    );

    let mut agent_options = match &cli.agent_config {
        Some(path) => AgentOptions::from_file(path)
            .with_context(|| format!("failed to load agent options from {}", path.display()))?,
        None => AgentOptions::default(),
    };
    if let Some(min_score) = cli.min_score {
        agent_options.reranker.min_score = min_score;
        agent_options.validate().context("invalid --min-score")?;
    }

    let embedder = build_embedder(&cli)?;
    let store = build_store(&cli, embedder.dimensions())?;

    if cli.store == StoreKind::Memory || matches!(cli.command, Command::Ingest) {
        ingest(&cli, embedder.as_ref(), store.as_ref()).await?;
    }

    match &cli.command {
        Command::Ingest => {}
        Command::Query { text, top_k, year } => {
            let mut options = agent_options.retriever_options(Some(&cli.index));
            if let Some(top_k) = top_k {
                options.top_k = *top_k;
                options.candidate_pool = options.candidate_pool.max(*top_k);
            }
            if let Some(year) = year {
                options.filter = QueryFilter::eq("year_of_publish", *year);
            }

            let retriever = Retriever::new(embedder, store, build_scorer(&cli)?, options);
            let results = retriever.query(text).await?;
            if results.is_empty() {
                println!("no passages found");
            }
            for (position, chunk) in results.iter().enumerate() {
                println!(
                    "[{}] {} score={:.4} semantic={:.3} vector={:.3} position={:.3}",
                    position + 1,
                    chunk.citation,
                    chunk.score,
                    chunk.semantic_score,
                    chunk.vector_score,
                    chunk.position_score
                );
                if !chunk.heading_path.is_empty() {
                    println!("  section: {}", chunk.heading_path.join(" > "));
                }
                println!("{}\n", chunk.text);
            }
        }
        Command::Ask {
            question,
            resource,
            thread,
        } => {
            let agent = build_agent(&cli, embedder, store, agent_options).await?;
            let thread = thread.clone().unwrap_or_else(new_thread_id);
            let reply = agent.respond(resource, &thread, question).await?;
            print_reply(&reply);
        }
        Command::Chat { resource, thread } => {
            let agent = build_agent(&cli, embedder, store, agent_options).await?;
            let thread = thread.clone().unwrap_or_else(new_thread_id);
            chat(&agent, resource, thread).await?;
        }
    }

    Ok(())
}

async fn ingest(cli: &Cli, embedder: &dyn Embedder, store: &dyn IndexStore) -> anyhow::Result<()> {
    let options = IngestionOptions {
        index_name: cli.index.clone(),
        ..IngestionOptions::default()
    };
    let report = ingest_documents(&cli.documents_dir, options, embedder, store)
        .await
        .with_context(|| format!("ingestion of {} failed", cli.documents_dir.display()))?;

    for skipped in &report.skipped_files {
        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped letter");
    }
    info!(
        index = %report.index_name,
        files = report.files_ingested,
        chunks = report.chunks_indexed,
        index_created = report.index_created,
        "ingestion finished"
    );
    if matches!(cli.command, Command::Ingest) {
        println!(
            "{} chunks from {} of {} files indexed into '{}' at {}",
            report.chunks_indexed,
            report.files_ingested,
            report.files_found,
            report.index_name,
            Utc::now().to_rfc3339()
        );
    }
    Ok(())
}

fn openai_config(cli: &Cli) -> anyhow::Result<OpenAiConfig> {
    let api_key = cli
        .openai_api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .context("OPENAI_API_KEY is not set")?;
    Ok(OpenAiConfig::new(api_key).with_base_url(cli.openai_base_url.clone()))
}

fn build_embedder(cli: &Cli) -> anyhow::Result<Arc<dyn Embedder>> {
    if cli.offline {
        return Ok(Arc::new(CharacterNgramEmbedder {
            dimensions: cli.embedding_dimensions,
        }));
    }
    let embedder = OpenAiEmbedder::new(
        &openai_config(cli)?,
        cli.embedding_model.clone(),
        cli.embedding_dimensions,
        DEFAULT_EMBEDDING_BATCH,
    )?;
    Ok(Arc::new(embedder))
}

fn build_store(cli: &Cli, dimensions: usize) -> anyhow::Result<Arc<dyn IndexStore>> {
    Ok(match cli.store {
        StoreKind::Memory => Arc::new(MemoryIndexStore::new()),
        StoreKind::Qdrant => Arc::new(
            QdrantStore::new(&cli.vector_store_url, dimensions)
                .with_context(|| format!("invalid vector store url {}", cli.vector_store_url))?
                .with_api_key(cli.qdrant_api_key.clone()),
        ),
    })
}

fn build_scorer(cli: &Cli) -> anyhow::Result<Arc<dyn RelevanceScorer>> {
    if cli.offline {
        return Ok(Arc::new(TermOverlapScorer));
    }
    let model = OpenAiChatModel::new(&openai_config(cli)?, cli.rerank_model.clone())?.with_temperature(0.0);
    Ok(Arc::new(LlmRelevanceScorer::new(Arc::new(model))))
}

async fn build_agent(
    cli: &Cli,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn IndexStore>,
    options: AgentOptions,
) -> anyhow::Result<Agent> {
    let model = OpenAiChatModel::new(&openai_config(cli)?, cli.chat_model.clone())?;
    let retriever = Retriever::new(
        Arc::clone(&embedder),
        Arc::clone(&store),
        build_scorer(cli)?,
        options.retriever_options(Some(&cli.index)),
    );
    let history = JsonMessageStore::open(&cli.memory_dir)
        .await
        .with_context(|| format!("cannot open memory directory {}", cli.memory_dir.display()))?;
    info!(memory_dir = %cli.memory_dir.display(), "conversation history");
    let memory = ConversationMemory::new(embedder, store, Arc::new(history), &options);

    Ok(Agent::new(
        Arc::new(model),
        Arc::new(retriever),
        Arc::new(memory),
        options,
    ))
}

fn new_thread_id() -> String {
    format!("thread-{}", Utc::now().format("%Y%m%d%H%M%S%3f"))
}

fn print_reply(reply: &AgentReply) {
    if let Some(title) = &reply.thread_title {
        println!("# {title}\n");
    }
    println!("{}", reply.text);
    if !reply.sources.is_empty() {
        println!();
        for source in &reply.sources {
            println!("  - {} (score {:.3})", source.citation, source.score);
        }
    }
}

async fn chat(agent: &Agent, resource: &str, mut thread: String) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    stdout
        .write_all(format!("{AGENT_NAME}. /new starts a thread, /threads lists them, /exit quits.\n").as_bytes())
        .await?;

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/new" => {
                thread = new_thread_id();
                println!("started {thread}");
                continue;
            }
            "/threads" => {
                match agent.memory().threads(resource).await {
                    Ok(summaries) => {
                        for summary in summaries {
                            println!(
                                "{} {} ({} messages)",
                                summary.thread_id,
                                summary.title.as_deref().unwrap_or("untitled"),
                                summary.message_count
                            );
                        }
                    }
                    Err(error) => eprintln!("error: {error}"),
                }
                continue;
            }
            _ => {}
        }

        match agent.respond(resource, &thread, line).await {
            Ok(reply) => print_reply(&reply),
            Err(error) => eprintln!("error: {error}"),
        }
    }

    Ok(())
}
