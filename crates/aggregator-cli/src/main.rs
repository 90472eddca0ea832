//! Binary entry point: config discovery, logging setup, and startup
//! sequencing for the MCP tool aggregator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aggregator_core::Skill;
use aggregator_embeddings::{EmbeddingBackend, EmbeddingService};
use aggregator_mcp::AggregatorServer;
use aggregator_registry::ToolRegistry;
use aggregator_search::{SearchEngine, SearchMode};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use indexmap::IndexMap;
use rmcp::ServiceExt;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;

const APP_QUALIFIER: &str = "";
const APP_ORGANIZATION: &str = "mcp-aggregator";
const APP_NAME: &str = "aggregator";

#[derive(Parser, Debug)]
#[command(name = "mcp-aggregator", version, about = "Aggregating MCP proxy: search_tools + call_tool over many upstream servers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to mcp-config.json
    #[arg(long, env = "MCP_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Path to skills.yaml
    #[arg(long, env = "MCP_SKILLS_PATH")]
    skills: Option<PathBuf>,

    /// Override the resolved embedding cache directory
    #[arg(long, env = "MCP_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    log_level: String,

    #[arg(long, env = "LOG_FILE_PATH")]
    log_file_path: Option<PathBuf>,

    #[arg(long, env = "LOG_SHOW_TIMESTAMP")]
    log_show_timestamp: Option<String>,

    #[arg(long, env = "MCP_SEARCH_MODE", default_value = "fuse")]
    search_mode: String,

    #[arg(long, env = "MCP_EMBEDDING_MODEL", default_value = "Xenova/all-MiniLM-L6-v2")]
    embedding_model: String,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Connect upstreams, load skills, and serve on stdio. Default when no subcommand is given.
    Serve,
    /// Parse mcp-config.json and skills.yaml without connecting anything; report errors.
    Validate,
    /// Print the resolved cache and log directories.
    Paths,
}

/// Environment read once at startup and threaded explicitly from here on;
/// no component reads `std::env` itself after this point except the
/// child-process spawn step, which reads each server's own `env` map.
struct StartupConfig {
    config_path: PathBuf,
    skills_path: PathBuf,
    search_mode: SearchMode,
    embedding_model: String,
    cache_dir_override: Option<PathBuf>,
}

impl StartupConfig {
    fn from_cli(cli: &Cli, paths: &AggregatorPaths) -> Self {
        StartupConfig {
            config_path: cli
                .config
                .clone()
                .unwrap_or_else(|| paths.config_dir.join("mcp-config.json")),
            skills_path: cli
                .skills
                .clone()
                .unwrap_or_else(|| paths.config_dir.join("skills.yaml")),
            search_mode: SearchMode::from_env_value(&cli.search_mode),
            embedding_model: cli.embedding_model.clone(),
            cache_dir_override: cli.cache_dir.clone(),
        }
    }
}

/// `mcpServers` is kept in the JSON object's original key order (an
/// `IndexMap`, not a `HashMap`) so duplicate tool names across servers
/// resolve deterministically: first-registered-in-config-order wins.
#[derive(Debug, Deserialize, Default)]
struct McpConfig {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: IndexMap<String, McpServerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
struct McpServerConfig {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Resolved system directories, analogous to `skillsrs-cli::paths` but
/// trimmed to what this system needs: a config directory to discover
/// `mcp-config.json`/`skills.yaml` in, an embedding cache directory, and a
/// logs directory.
struct AggregatorPaths {
    config_dir: PathBuf,
    cache_dir: PathBuf,
    logs_dir: PathBuf,
}

impl AggregatorPaths {
    fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .context("failed to determine system directories")?;
        Ok(AggregatorPaths {
            config_dir: project_dirs.config_dir().to_path_buf(),
            cache_dir: project_dirs.cache_dir().join("embeddings"),
            logs_dir: project_dirs.data_dir().join("logs"),
        })
    }

    fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.cache_dir, &self.logs_dir] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }

    fn display(&self) -> String {
        format!(
            "Config directory: {}\nCache directory:  {}\nLogs directory:   {}",
            self.config_dir.display(),
            self.cache_dir.display(),
            self.logs_dir.display()
        )
    }
}

fn init_logging(level: &str, log_file_path: Option<&Path>, show_timestamp: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| format!("{}={}", env!("CARGO_CRATE_NAME"), level.to_lowercase()).into())
    };

    match log_file_path {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("aggregator.log"));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            if show_timestamp {
                tracing_subscriber::registry()
                    .with(filter())
                    .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
                    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter())
                    .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).without_time())
                    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).without_time())
                    .init();
            }
            Some(guard)
        }
        None => {
            if show_timestamp {
                tracing_subscriber::registry()
                    .with(filter())
                    .with(tracing_subscriber::fmt::layer())
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter())
                    .with(tracing_subscriber::fmt::layer().without_time())
                    .init();
            }
            None
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Load `mcp-config.json`. A missing file yields zero upstreams (warned,
/// not fatal); invalid JSON is fatal.
fn load_mcp_config(path: &Path) -> Result<McpConfig> {
    if !path.exists() {
        warn!("mcp config not found at {}, starting with zero upstreams", path.display());
        return Ok(McpConfig::default());
    }
    info!("loading mcp config from {}", path.display());
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read mcp config at {}", path.display()))?;
    let config: McpConfig = serde_json::from_str(&content)
        .with_context(|| format!("mcp config at {} is not valid JSON", path.display()))?;
    Ok(config)
}

/// Load `skills.yaml`. A missing file yields no skills (not fatal);
/// malformed content is fatal.
async fn load_skills(path: &Path) -> Result<Vec<Skill>> {
    if !path.exists() {
        info!("skills file not found at {}, registering no skills", path.display());
        return Ok(Vec::new());
    }
    info!("loading skills from {}", path.display());
    aggregator_skills::load_skills_file(path)
        .await
        .with_context(|| format!("skills file at {} failed to load", path.display()))
}

#[cfg(feature = "local-embeddings")]
fn resolve_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    use fastembed::EmbeddingModel::*;
    match name {
        "Xenova/all-MiniLM-L6-v2" | "AllMiniLML6V2" => Ok(AllMiniLML6V2),
        "BAAI/bge-small-en-v1.5" | "BGESmallENV15" => Ok(BGESmallENV15),
        other => anyhow::bail!("unknown embedding model identifier: {other}"),
    }
}

/// Build the embedding service for vector-mode search. The model backend
/// loads lazily on first use (`EmbeddingService`'s `OnceCell`); nothing
/// here touches an inference runtime eagerly.
fn build_embedding_service(cache_dir: PathBuf, model: String) -> EmbeddingService {
    EmbeddingService::new(cache_dir, move || {
        let model = model.clone();
        async move {
            #[cfg(feature = "local-embeddings")]
            {
                let model_id = resolve_fastembed_model(&model)
                    .map_err(|e| aggregator_embeddings::EmbeddingError::Init(e.to_string()))?;
                let backend = aggregator_embeddings::fastembed_backend::FastEmbedBackend::new(model_id)
                    .map_err(|e| aggregator_embeddings::EmbeddingError::Init(e.to_string()))?;
                Ok(Arc::new(backend) as Arc<dyn EmbeddingBackend>)
            }
            #[cfg(not(feature = "local-embeddings"))]
            {
                let _ = model;
                Err(aggregator_embeddings::EmbeddingError::Init(
                    "vector search mode requires the `local-embeddings` feature".to_string(),
                ))
            }
        }
    })
}

/// Connect every configured upstream concurrently; a single server's
/// failure is logged and does not cancel the others or abort startup.
///
/// Connections race, but registration doesn't: each server's tools are
/// enumerated into a `ConnectedServer` without touching the registry, and
/// `join_all` hands results back in the same order `config.mcp_servers`
/// was iterated in (its own insertion order, i.e. the JSON object's key
/// order), regardless of which connection actually finished first. Only
/// then are they ingested into the registry, in that same order, so a
/// tool name that's ambiguous across servers always resolves to whichever
/// server came first in `mcp-config.json`.
async fn connect_upstreams(
    config: &McpConfig,
    registry: &ToolRegistry,
    embeddings: Option<&EmbeddingService>,
) -> usize {
    let mut connected = 0usize;

    let futures = config.mcp_servers.iter().map(|(name, server_config)| async move {
        info!("connecting to upstream server '{}'", name);
        let result = registry
            .connect_server(
                name,
                &server_config.command,
                &server_config.args,
                &server_config.env,
                embeddings,
            )
            .await;
        (name.clone(), result)
    });

    for (name, result) in futures::future::join_all(futures).await {
        match result {
            Ok(prepared) => {
                let count = prepared.tool_count();
                registry.ingest_connected(prepared).await;
                debug!("server '{}' contributed {} tool(s)", name, count);
                connected += 1;
            }
            Err(err) => error!("failed to connect to upstream server '{}': {}", name, err),
        }
    }
    connected
}

async fn run_serve(cli: &Cli, paths: &AggregatorPaths) -> Result<()> {
    let startup = StartupConfig::from_cli(cli, paths);
    let cache_dir = startup.cache_dir_override.clone().unwrap_or_else(|| paths.cache_dir.clone());

    info!("mcp-aggregator starting (search mode: {:?})", startup.search_mode);

    let mcp_config = load_mcp_config(&startup.config_path)?;
    let registry = Arc::new(ToolRegistry::new());

    let embeddings = match startup.search_mode {
        SearchMode::Vector => Some(Arc::new(build_embedding_service(cache_dir, startup.embedding_model.clone()))),
        SearchMode::Fuzzy => None,
    };

    let connected = connect_upstreams(&mcp_config, &registry, embeddings.as_deref()).await;

    if let Some(svc) = embeddings.as_deref() {
        let active_hashes: Vec<String> = mcp_config
            .mcp_servers
            .iter()
            .map(|(name, cfg)| {
                let env: std::collections::BTreeMap<String, String> = cfg.env.clone().into_iter().collect();
                aggregator_core::generate_server_hash(name, &cfg.command, &cfg.args, &env)
            })
            .collect();
        if let Err(err) = svc.cleanup_unused_cache(&active_hashes).await {
            warn!("embedding cache GC failed: {}", err);
        }
    }

    let skills = load_skills(&startup.skills_path).await?;
    let skill_count = skills.len();
    for skill in skills {
        registry.register_skill(skill, embeddings.as_deref()).await;
    }

    let tool_count = registry.all_tools().await.len();
    info!(
        "startup complete: {} upstream server(s) connected, {} tool(s) registered, {} skill(s) loaded",
        connected, tool_count, skill_count
    );

    let server = AggregatorServer::new(registry, Arc::new(SearchEngine::new()), embeddings, startup.search_mode);
    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .context("failed to bind MCP server to stdio transport")?;
    service.waiting().await.context("server loop exited with an error")?;
    Ok(())
}

fn run_validate(cli: &Cli, paths: &AggregatorPaths) -> Result<()> {
    let startup = StartupConfig::from_cli(cli, paths);
    let mut failed = false;

    match load_mcp_config(&startup.config_path) {
        Ok(config) => println!("mcp config OK: {} server(s) configured", config.mcp_servers.len()),
        Err(err) => {
            eprintln!("mcp config INVALID: {err:#}");
            failed = true;
        }
    }

    if startup.skills_path.exists() {
        match std::fs::read_to_string(&startup.skills_path)
            .context("failed to read skills file")
            .and_then(|content| serde_yaml::from_str::<serde_yaml::Value>(&content).context("skills file is not valid YAML"))
        {
            Ok(_) => println!("skills file parses as YAML: {}", startup.skills_path.display()),
            Err(err) => {
                eprintln!("skills file INVALID: {err:#}");
                failed = true;
            }
        }
    } else {
        println!("skills file not found at {} (not fatal)", startup.skills_path.display());
    }

    if failed {
        anyhow::bail!("validation failed");
    }
    Ok(())
}

fn run_paths(paths: &AggregatorPaths) {
    println!("{}", paths.display());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let show_timestamp = cli
        .log_show_timestamp
        .as_deref()
        .map(is_truthy)
        .unwrap_or(true);
    let _guard = init_logging(&cli.log_level, cli.log_file_path.as_deref(), show_timestamp);

    let paths = AggregatorPaths::new()?;
    paths.ensure_directories()?;

    let command = cli.command.unwrap_or(Commands::Serve);
    let result = match command {
        Commands::Serve => run_serve(&cli, &paths).await,
        Commands::Validate => run_validate(&cli, &paths),
        Commands::Paths => {
            run_paths(&paths);
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("fatal: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_mcp_config_is_not_fatal() {
        let config = load_mcp_config(Path::new("/nonexistent/mcp-config.json")).unwrap();
        assert!(config.mcp_servers.is_empty());
    }

    #[test]
    fn invalid_mcp_config_json_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_mcp_config(&path).is_err());
    }

    #[test]
    fn well_formed_mcp_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-config.json");
        std::fs::write(
            &path,
            r#"{ "mcpServers": { "weather": { "command": "weather-mcp", "args": ["--stdio"], "env": {"API_KEY": "x"} } } }"#,
        )
        .unwrap();
        let config = load_mcp_config(&path).unwrap();
        assert_eq!(config.mcp_servers.len(), 1);
        assert_eq!(config.mcp_servers["weather"].command, "weather-mcp");
    }

    #[test]
    fn truthy_values_are_case_insensitive() {
        assert!(is_truthy("TRUE"));
        assert!(is_truthy("1"));
        assert!(is_truthy("yes"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy(""));
    }

    #[tokio::test]
    async fn missing_skills_file_yields_empty_list() {
        let skills = load_skills(Path::new("/nonexistent/skills.yaml")).await.unwrap();
        assert!(skills.is_empty());
    }
}
