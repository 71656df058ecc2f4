use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use secrecy::SecretString;
use tracing::{info, warn};

use relay_core::{AnswerGenerator, StreamEvent, UsageSink};
use relay_engine::{OrchestratorConfig, RunRequest, StreamOrchestrator};
use relay_llm::{
    OpenAiEmbedder, ReliableGenerator, ResponsesGenerator, ScriptedGenerator, TracingSink,
    VectorIndex,
};
use relay_server::ServerConfig;
use relay_settings::{MemorySettings, ModelSettings, RelaySettings};
use relay_store::{Database, MemoryConfig, MemoryMode, MemoryStore, UsageRepo};
use relay_telemetry::TelemetryConfig;

#[derive(Parser)]
#[command(name = "relay", version, about = "Streaming conversational backend")]
struct Cli {
    /// Settings file. Defaults to ~/.relay/settings.json.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API (default).
    Serve {
        /// Override the configured port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one query and print the answer to stdout.
    Ask {
        uid: String,
        name: String,
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => relay_settings::load_settings_from_path(path),
        None => relay_settings::load_settings(),
    }
    .context("loading settings")?;

    let _telemetry = relay_telemetry::init_telemetry(telemetry_config(&settings));

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => serve(settings, port).await,
        Command::Ask { uid, name, prompt } => ask(settings, uid, name, prompt.join(" ")).await,
    }
}

async fn serve(settings: RelaySettings, port: Option<u16>) -> Result<()> {
    let (db, memory) = open_memory(&settings.memory)?;
    let generator = build_generator(&settings.model).await?;
    let model = generator.model().to_string();
    let mode = memory.mode();

    let sink: Arc<dyn UsageSink> = Arc::new(UsageRepo::new(db));
    let orchestrator = StreamOrchestrator::new(
        generator,
        memory,
        sink,
        OrchestratorConfig::from_settings(&settings),
    );

    let mut config = ServerConfig::from_settings(&settings.server);
    if let Some(port) = port {
        config.port = port;
    }
    let handle = relay_server::start(config, orchestrator)
        .await
        .context("starting server")?;
    info!(port = handle.port(), model = %model, memory = mode.as_str(), "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn ask(settings: RelaySettings, uid: String, name: String, prompt: String) -> Result<()> {
    let (_db, memory) = open_memory(&settings.memory)?;
    let generator = build_generator(&settings.model).await?;
    let orchestrator = StreamOrchestrator::new(
        generator,
        memory,
        Arc::new(TracingSink),
        OrchestratorConfig::from_settings(&settings),
    );

    let mut stream = orchestrator.run(RunRequest::new(uid, prompt).with_display_name(name));
    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Delta(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamEvent::UsageError(message) => warn!(%message, "usage not recorded"),
            StreamEvent::Ready | StreamEvent::Done => {}
        }
    }
    writeln!(stdout)?;
    Ok(())
}

fn telemetry_config(settings: &RelaySettings) -> TelemetryConfig {
    let log_db_path = settings
        .logging
        .db_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| settings.memory.resolved_db_path().with_file_name("logs.sqlite3"));
    TelemetryConfig {
        log_level: TelemetryConfig::level_from_str(&settings.logging.level),
        module_levels: Vec::new(),
        log_to_sqlite: settings.logging.persist_warnings,
        log_db_path,
    }
}

fn open_memory(settings: &MemorySettings) -> Result<(Database, MemoryStore)> {
    let path = settings.resolved_db_path();
    let db = Database::open(&path)
        .with_context(|| format!("opening memory database {}", path.display()))?;
    let config = MemoryConfig {
        mode: MemoryMode::from_flags(settings.enabled, settings.session_continuity),
        limit: settings.limit,
        max_rows: settings.max_rows,
        vacuum_interval: settings.vacuum_interval(),
    };
    Ok((db.clone(), MemoryStore::new(db, config)))
}

/// Responses API when a key is configured, otherwise the echo generator.
async fn build_generator(model: &ModelSettings) -> Result<Arc<dyn AnswerGenerator>> {
    let Some(key) = std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
    else {
        warn!("OPENAI_API_KEY not set, answering with the echo generator");
        return Ok(Arc::new(ScriptedGenerator::echo()));
    };
    let key = SecretString::from(key);

    let mut responses = ResponsesGenerator::new(key.clone(), &model.api_base, &model.name)?
        .with_idle_timeout(Duration::from_secs(model.idle_timeout_secs));
    if let Some(path) = &model.corpus_path {
        let index = build_index(Path::new(path), key, model).await?;
        info!(passages = index.len(), "retrieval corpus indexed");
        responses = responses.with_retrieval(Arc::new(index));
    }
    Ok(Arc::new(ReliableGenerator::with_defaults(responses)))
}

/// Passages are separated by blank lines.
async fn build_index(path: &Path, key: SecretString, model: &ModelSettings) -> Result<VectorIndex> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading corpus {}", path.display()))?;
    let passages: Vec<String> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    let embedder = OpenAiEmbedder::new(key, &model.api_base, &model.embedding_model)?;
    Ok(VectorIndex::build(Arc::new(embedder), passages).await?)
}
