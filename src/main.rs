use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowstudio_core::config::AppConfig;
use flowstudio_core::graph::Graph;
use flowstudio_core::trace::value_to_text;
use flowstudio_core::traits::{ConversationStore, LlmClient, RetrievalBackend};
use flowstudio_core::types::{FileRef, RunId};

use flowstudio_engine::{Collaborators, Engine, ExecuteRequest, GraphSource, ToolAgent};
use flowstudio_llm::LlmInference;
use flowstudio_memory::{
    EmbeddingProvider, HttpEmbeddingProvider, JsonGraphDir, LocalFiles, SqliteKnowledgeStore,
    SqliteStore,
};

#[derive(Parser)]
#[command(name = "flowstudio", version, about = "Run workflow graphs of LLM, agent and tool nodes")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowstudio.toml")]
    config: PathBuf,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a graph against one input
    Run {
        /// Graph JSON file
        #[arg(long, conflicts_with = "graph_id", required_unless_present = "graph_id")]
        graph: Option<PathBuf>,
        /// Id of a graph stored in the graphs directory
        #[arg(long)]
        graph_id: Option<String>,
        /// Directory of <id>.json graph files (overrides engine.graphs_dir)
        #[arg(long)]
        graphs_dir: Option<PathBuf>,
        /// Run input (read from stdin when omitted)
        #[arg(short, long)]
        input: Option<String>,
        /// Conversation id for memory
        #[arg(long)]
        conversation: Option<String>,
        /// Uploaded file, repeatable
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Print the full outcome with the step trace as JSON
        #[arg(long)]
        trace: bool,
    },
    /// Load and validate a graph file
    Validate {
        #[arg(long)]
        graph: PathBuf,
    },
    /// Print the stored transcript of a conversation
    History {
        #[arg(long)]
        conversation: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowstudio", &mut io::stdout());
        return Ok(());
    }

    if let Commands::Validate { graph } = &cli.command {
        let graph = Graph::load(graph)?;
        graph.validate()?;
        println!(
            "ok: {} node(s), {} edge(s)",
            graph.nodes.len(),
            graph.edges.len()
        );
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::History { conversation } => {
            let store = SqliteStore::open(&config.memory_path())?;
            let messages = store.load(&conversation).await?;
            if messages.is_empty() {
                println!("No messages in conversation {conversation}.");
            }
            for m in messages {
                let role = match &m.role_type {
                    Some(kind) => format!("{} ({kind})", m.role.as_str()),
                    None => m.role.as_str().to_string(),
                };
                println!("[{}] {role}: {}", m.timestamp.format("%Y-%m-%d %H:%M:%S"), m.content);
            }
        }
        Commands::Run {
            graph,
            graph_id,
            graphs_dir,
            input,
            conversation,
            files,
            trace,
        } => {
            let graphs_dir = graphs_dir.unwrap_or_else(|| config.graphs_dir());
            let engine = build_engine(config, graphs_dir)?;

            let source = match (graph, graph_id) {
                (Some(path), _) => GraphSource::Graph(Graph::load(&path)?),
                (None, Some(id)) => GraphSource::Stored(id),
                (None, None) => anyhow::bail!("either --graph or --graph-id is required"),
            };
            let input = match input {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    io::stdin().read_to_string(&mut buf)?;
                    buf.trim_end().to_string()
                }
            };

            let run_id = RunId::new();
            let mut request = ExecuteRequest::new(input)
                .with_files(files.into_iter().map(FileRef::local).collect())
                .with_run_id(run_id.clone());
            if let Some(id) = conversation {
                request = request.with_conversation(id);
            }

            run_once(&engine, source, request, &run_id, trace).await?;
        }
        Commands::Completions { .. } | Commands::Validate { .. } => {}
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "flowstudio=debug,info"
    } else {
        "flowstudio=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    // Check for config in the home directory
    if let Some(home_config) = dirs_home().map(|h| h.join(".flowstudio").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn build_engine(config: AppConfig, graphs_dir: PathBuf) -> anyhow::Result<Engine> {
    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace).ok();

    let config = Arc::new(config);
    let memory: Arc<dyn ConversationStore> = Arc::new(SqliteStore::open(&config.memory_path())?);

    let embedder = config.embedding.as_ref().map(|e| {
        info!(provider = %e.provider, model = %e.model, "Vector retrieval enabled");
        Arc::new(HttpEmbeddingProvider::from_config(e)) as Arc<dyn EmbeddingProvider>
    });
    let retrieval: Arc<dyn RetrievalBackend> =
        Arc::new(SqliteKnowledgeStore::open(&config.knowledge_path(), embedder)?);

    // Build LLM client with retry and fallback chain
    let llm: Arc<dyn LlmClient> = Arc::from(flowstudio_llm::create_retrying_client(&config));
    let inference = Arc::new(LlmInference::new(llm.clone(), config.model.clone()));

    let files = Arc::new(LocalFiles::new(config.http.timeout_secs));
    let http = reqwest_client(&config);
    let agent = Arc::new(ToolAgent::standard(llm, &config, retrieval.clone(), http));

    let collab = Collaborators::new(inference, agent, retrieval, memory, files, config);
    Ok(Engine::new(collab).with_graph_store(Arc::new(JsonGraphDir::new(graphs_dir))))
}

fn reqwest_client(config: &AppConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.http.timeout_secs))
        .user_agent(config.http.user_agent.clone())
        .build()
        .unwrap_or_default()
}

async fn run_once(
    engine: &Engine,
    source: GraphSource,
    request: ExecuteRequest,
    run_id: &RunId,
    show_trace: bool,
) -> anyhow::Result<()> {
    let run = engine.execute(source, request);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nCancelling run {run_id}...");
            engine.cancel(run_id);
            run.await
        }
    };

    match result {
        Ok(outcome) => {
            if show_trace {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("{}", value_to_text(&outcome.result));
            }
            eprintln!(
                "[{} of {} node(s) in {}ms, run {}]",
                outcome.stats.nodes_executed,
                outcome.stats.total_nodes,
                outcome.stats.duration_ms,
                outcome.run_id
            );
            Ok(())
        }
        Err(failure) => {
            if show_trace {
                eprintln!("{}", serde_json::to_string_pretty(&failure.trace)?);
            }
            Err(failure.into())
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
