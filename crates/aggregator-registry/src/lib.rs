//! The tool registry: upstream MCP client lifecycle, catalogue assembly,
//! and the `updatedAt` version counter the search engine keys its index
//! cache on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aggregator_core::{generate_server_hash, Skill, ToolKey, ToolRecord, INTERNAL_SERVER};
use aggregator_embeddings::EmbeddingService;
use futures::stream::{FuturesUnordered, StreamExt};
use rmcp::model::CallToolRequestParam;
use rmcp::service::{RunningService, ServiceExt};
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use rmcp::RoleClient;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to connect to upstream server '{server}': {source}")]
    UpstreamConnect {
        server: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to enumerate tools on upstream server '{server}': {source}")]
    ToolEnumeration {
        server: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

const EMBEDDING_BATCH_CONCURRENCY: usize = 10;

/// A live connection to an upstream MCP server.
type UpstreamClient = RunningService<RoleClient, ()>;

/// The result of connecting to and enumerating an upstream server, staged
/// for insertion into the registry. Kept separate from the registry's
/// shared state so a caller connecting several servers concurrently can
/// still control the order records are appended in (first-registered wins
/// on an ambiguous tool name, per the config's own server order, not
/// whichever connection happens to finish first).
pub struct ConnectedServer {
    name: String,
    client: Arc<UpstreamClient>,
    records: Vec<ToolRecord>,
}

impl ConnectedServer {
    pub fn tool_count(&self) -> usize {
        self.records.len()
    }
}

struct RegistryState {
    records: Vec<ToolRecord>,
    index: HashMap<ToolKey, usize>,
    clients: HashMap<String, Arc<UpstreamClient>>,
}

/// Shared, append-only catalogue of tool records plus the upstream client
/// handles that back them.
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
    updated_at: AtomicU64,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry {
            state: RwLock::new(RegistryState {
                records: Vec::new(),
                index: HashMap::new(),
                clients: HashMap::new(),
            }),
            updated_at: AtomicU64::new(0),
        }
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at.load(Ordering::Acquire)
    }

    fn bump_updated_at(&self) {
        self.updated_at.fetch_add(1, Ordering::AcqRel);
    }

    /// O(1) `(server, name)` lookup.
    pub async fn get_tool(&self, server: &str, name: &str) -> Option<ToolRecord> {
        let state = self.state.read().await;
        let key = ToolKey::new(server, name);
        state.index.get(&key).map(|&idx| state.records[idx].clone())
    }

    /// All records sharing `name`, in registration order (first wins on
    /// ambiguous resolution, per the config's `connectServer` iteration
    /// order).
    pub async fn find_by_name(&self, name: &str) -> Vec<ToolRecord> {
        let state = self.state.read().await;
        state
            .records
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect()
    }

    /// A snapshot of every registered record, in registration order.
    pub async fn all_tools(&self) -> Vec<ToolRecord> {
        self.state.read().await.records.clone()
    }

    pub async fn get_client(&self, server: &str) -> Option<Arc<UpstreamClient>> {
        self.state.read().await.clients.get(server).cloned()
    }

    /// Spawn `command` as a child process, speak MCP over its stdio, and
    /// enumerate every tool it advertises. The child's stderr is piped and
    /// forwarded line-by-line to the logger at `debug` level, tagged with
    /// `name`, rather than left to inherit the parent's stderr.
    ///
    /// This only connects and enumerates; it does not touch the shared
    /// registry state. Callers connecting several servers concurrently
    /// should collect the `ConnectedServer` results and feed them to
    /// [`ToolRegistry::ingest_connected`] in the order they want ambiguous
    /// tool names resolved by, since that order need not match the order
    /// connections actually complete in.
    pub async fn connect_server(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        embeddings: Option<&EmbeddingService>,
    ) -> Result<ConnectedServer> {
        let args_owned = args.to_vec();
        let env_owned: Vec<(String, String)> =
            env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let mut transport = TokioChildProcess::new(Command::new(command).configure(move |cmd| {
            for arg in &args_owned {
                cmd.arg(arg);
            }
            for (key, value) in &env_owned {
                cmd.env(key, value);
            }
        }))
        .map_err(|e| RegistryError::UpstreamConnect {
            server: name.to_string(),
            source: anyhow::anyhow!(e),
        })?;

        if let Some(stderr) = transport.stderr.take() {
            let server_name = name.to_string();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => debug!(server = %server_name, "{}", line),
                        Ok(None) => break,
                        Err(err) => {
                            warn!("failed to read stderr of server '{}': {}", server_name, err);
                            break;
                        }
                    }
                }
            });
        }

        let client = ().serve(transport).await.map_err(|e| RegistryError::UpstreamConnect {
            server: name.to_string(),
            source: anyhow::anyhow!(e),
        })?;

        let env_btree: std::collections::BTreeMap<String, String> =
            env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let server_hash = generate_server_hash(name, command, args, &env_btree);
        let client = Arc::new(client);

        let records = self
            .enumerate_and_resolve(name, &client, Some(&server_hash), embeddings)
            .await?;

        Ok(ConnectedServer {
            name: name.to_string(),
            client,
            records,
        })
    }

    /// Append a connected server's records and client handle to the shared
    /// state. Call these in the order ambiguous tool names should resolve
    /// in (first appended wins). Returns the total record count afterwards.
    pub async fn ingest_connected(&self, connected: ConnectedServer) -> usize {
        let mut state = self.state.write().await;
        for record in connected.records {
            let key = record.key();
            let idx = state.records.len();
            state.records.push(record);
            state.index.insert(key, idx);
        }
        state.clients.insert(connected.name, connected.client);
        let count = state.records.len();
        drop(state);

        self.bump_updated_at();
        count
    }

    /// Enumerate tools on an already-connected client, resolve their
    /// embeddings, and ingest them immediately. Returns the number of tools
    /// registered so far. Unlike `connect_server`, this writes to the
    /// shared state as soon as enumeration finishes, so it is only suitable
    /// for callers that don't need to control cross-server ordering.
    pub async fn register_tools_from_client(
        &self,
        server_name: &str,
        client: Arc<UpstreamClient>,
        server_hash: Option<&str>,
        embeddings: Option<&EmbeddingService>,
    ) -> Result<usize> {
        let records = self
            .enumerate_and_resolve(server_name, &client, server_hash, embeddings)
            .await?;
        Ok(self
            .ingest_connected(ConnectedServer {
                name: server_name.to_string(),
                client,
                records,
            })
            .await)
    }

    /// List and resolve a connected client's tools into `ToolRecord`s,
    /// without touching the shared registry state.
    async fn enumerate_and_resolve(
        &self,
        server_name: &str,
        client: &Arc<UpstreamClient>,
        server_hash: Option<&str>,
        embeddings: Option<&EmbeddingService>,
    ) -> Result<Vec<ToolRecord>> {
        let tools = client
            .list_tools(Default::default())
            .await
            .map_err(|e| RegistryError::ToolEnumeration {
                server: server_name.to_string(),
                source: anyhow::anyhow!(e),
            })?
            .tools;

        let cached = match (embeddings, server_hash) {
            (Some(svc), Some(hash)) => svc.get_cached_embeddings(hash).await,
            _ => None,
        };

        let mut generated_any = false;
        let mut fresh_cache: HashMap<String, Vec<f32>> = cached.clone().unwrap_or_default();
        let mut new_records = Vec::with_capacity(tools.len());

        let mut pending = FuturesUnordered::new();
        let mut tool_iter = tools.into_iter();

        // Bounded-concurrency embedding resolution: at most
        // EMBEDDING_BATCH_CONCURRENCY generations in flight at once.
        for tool in tool_iter.by_ref().take(EMBEDDING_BATCH_CONCURRENCY) {
            pending.push(resolve_embedding(tool, &cached, embeddings));
        }

        while let Some((tool, schema_keywords, normalized_text, embedding, was_generated)) =
            pending.next().await
        {
            if was_generated {
                generated_any = true;
                if let Some(ref vec) = embedding {
                    fresh_cache.insert(tool.name.to_string(), vec.clone());
                }
            }
            new_records.push(ToolRecord {
                server: server_name.to_string(),
                name: tool.name.to_string(),
                description: tool.description.map(|d| d.to_string()).unwrap_or_default(),
                schema: serde_json::to_value(&tool.input_schema).unwrap_or_default(),
                schema_keywords,
                normalized_text,
                embedding,
                is_skill: false,
                steps: None,
            });

            if let Some(tool) = tool_iter.next() {
                pending.push(resolve_embedding(tool, &cached, embeddings));
            }
        }

        if generated_any {
            if let (Some(svc), Some(hash)) = (embeddings, server_hash) {
                if let Err(err) = svc.save_embeddings_to_cache(hash, &fresh_cache).await {
                    warn!(
                        "failed to persist embedding cache for server '{}': {}",
                        server_name, err
                    );
                }
            }
        }

        Ok(new_records)
    }

    /// Ingest a loaded skill as a tool record on the synthetic `internal`
    /// server.
    pub async fn register_skill(&self, skill: Skill, embeddings: Option<&EmbeddingService>) {
        let schema = serde_json::json!({
            "type": "object",
            "properties": skill.parameters,
        });

        let mut keywords = aggregator_text::extract_keywords(&skill.name, Some(&skill.description));
        for param_name in skill.parameters.keys() {
            keywords.insert(param_name.to_lowercase());
        }
        let schema_keywords = keywords.into_iter().collect::<Vec<_>>().join(" ");
        let normalized_text = aggregator_text::normalize(&format!(
            "{} {} {}",
            skill.name, skill.description, schema_keywords
        ));

        let embedding = if let Some(svc) = embeddings {
            match svc
                .generate_embedding(&format!("{} {}", skill.name, skill.description))
                .await
            {
                Ok(vec) => Some(vec),
                Err(err) => {
                    warn!("failed to embed skill '{}': {}", skill.name, err);
                    None
                }
            }
        } else {
            None
        };

        let record = ToolRecord {
            server: INTERNAL_SERVER.to_string(),
            name: skill.name.clone(),
            description: skill.description.clone(),
            schema,
            schema_keywords,
            normalized_text,
            embedding,
            is_skill: true,
            steps: Some(skill.steps),
        };

        let mut state = self.state.write().await;
        let key = record.key();
        let idx = state.records.len();
        state.records.push(record);
        state.index.insert(key, idx);
        drop(state);

        self.bump_updated_at();
    }

    /// Invoke `name` on `server`'s live upstream client.
    pub async fn call_upstream(
        &self,
        server: &str,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> anyhow::Result<rmcp::model::CallToolResult> {
        let client = self
            .get_client(server)
            .await
            .ok_or_else(|| anyhow::anyhow!("no live upstream client for server '{}'", server))?;
        let result = client
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments,
                task: None,
            })
            .await?;
        Ok(result)
    }
}

/// Resolve one tool's schema keywords, normalised text and embedding.
/// Returns `(tool, schema_keywords, normalized_text, embedding, was_generated)`.
async fn resolve_embedding(
    tool: rmcp::model::Tool,
    cached: &Option<HashMap<String, Vec<f32>>>,
    embeddings: Option<&EmbeddingService>,
) -> (
    rmcp::model::Tool,
    String,
    String,
    Option<Vec<f32>>,
    bool,
) {
    let description = tool.description.clone().unwrap_or_default();
    let mut keywords = aggregator_text::extract_keywords(&tool.name, Some(&description));
    if let Some(obj) = tool.input_schema.get("properties").and_then(|p| p.as_object()) {
        for (prop_name, prop_schema) in obj {
            keywords.insert(prop_name.to_lowercase());
            if let Some(prop_desc) = prop_schema.get("description").and_then(|d| d.as_str()) {
                for tok in aggregator_text::tokenize(prop_desc, 4) {
                    keywords.insert(tok);
                }
            }
        }
    }
    let schema_keywords = keywords.into_iter().collect::<Vec<_>>().join(" ");
    let normalized_text = aggregator_text::normalize(&format!(
        "{} {} {}",
        tool.name, description, schema_keywords
    ));

    let cached_embedding = cached
        .as_ref()
        .and_then(|map| map.get(tool.name.as_ref()))
        .cloned();

    if let Some(vec) = cached_embedding {
        return (tool, schema_keywords, normalized_text, Some(vec), false);
    }

    if let Some(svc) = embeddings {
        let text = format!("{} {}", tool.name, description);
        match svc.generate_embedding(&text).await {
            Ok(vec) => {
                debug!("generated embedding for tool '{}'", tool.name);
                return (tool, schema_keywords, normalized_text, Some(vec), true);
            }
            Err(err) => {
                warn!("embedding generation failed for tool '{}': {}", tool.name, err);
            }
        }
    }

    (tool, schema_keywords, normalized_text, None, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator_core::SkillStep;
    use std::collections::BTreeMap as Map;

    #[tokio::test]
    async fn register_skill_bumps_updated_at_and_is_lookupable() {
        let registry = ToolRegistry::new();
        let before = registry.updated_at();

        let skill = Skill {
            name: "echo_twice".to_string(),
            description: "Echoes input twice".to_string(),
            parameters: Map::new(),
            steps: vec![SkillStep {
                tool: "echo".to_string(),
                server: None,
                args: serde_json::json!({"message": "{{input}}"}),
                result_var: Some("first".to_string()),
                description: None,
            }],
        };

        registry.register_skill(skill, None).await;

        assert!(registry.updated_at() > before);
        let record = registry.get_tool(INTERNAL_SERVER, "echo_twice").await.unwrap();
        assert!(record.is_skill);
        assert_eq!(record.server, INTERNAL_SERVER);
    }

    #[tokio::test]
    async fn unregistered_lookup_returns_none() {
        let registry = ToolRegistry::new();
        assert!(registry.get_tool("nope", "nope").await.is_none());
    }
}
