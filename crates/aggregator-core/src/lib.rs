//! Shared types for the MCP tool aggregator.
//!
//! Defines the registry's unit of record (`ToolRecord`), the skill
//! definitions ingested from YAML (`Skill`, `SkillStep`), and the
//! content-addressed server hash used to key the embedding cache.
//! This crate performs no I/O.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Primary key for a tool record: `(server, name)`.
///
/// `server` is a per-upstream identifier, or the literal `"internal"` for
/// skill-backed records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToolKey {
    pub server: String,
    pub name: String,
}

impl ToolKey {
    pub fn new(server: impl Into<String>, name: impl Into<String>) -> Self {
        ToolKey {
            server: server.into(),
            name: name.into(),
        }
    }
}

/// Reserved server identifier for skill-backed tool records.
pub const INTERNAL_SERVER: &str = "internal";

/// The registry's unit of record: an upstream tool, or a skill masquerading
/// as one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub server: String,
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
    /// Space-joined derived lexical tokens (§4.1 `extractKeywords`, plus
    /// schema property names/descriptions).
    pub schema_keywords: String,
    /// `normalize(name + " " + description + " " + schema_keywords)`,
    /// computed once at insertion time and never recomputed.
    pub normalized_text: String,
    /// L2-normalised embedding, absent when vector mode is off or
    /// generation failed.
    pub embedding: Option<Vec<f32>>,
    pub is_skill: bool,
    /// Present only when `is_skill` is true.
    pub steps: Option<Vec<SkillStep>>,
}

impl ToolRecord {
    pub fn key(&self) -> ToolKey {
        ToolKey::new(self.server.clone(), self.name.clone())
    }
}

/// One step of a skill: an upstream tool call with templated arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillStep {
    pub tool: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub result_var: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A declarative composite tool parsed from `skills.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// JSON-Schema `properties` map for the skill's arguments.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub steps: Vec<SkillStep>,
}

/// Compute a deterministic hex digest identifying an upstream server
/// configuration, used to name its embedding cache file.
///
/// `generateServerHash(name, config)` per §4.2: SHA-256 over a canonical
/// encoding of `{name, config: {command, args, env}}`.
pub fn generate_server_hash(
    name: &str,
    command: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> String {
    // BTreeMap gives a stable key order for `env`; serde_json preserves
    // insertion order for the rest, which is fixed by construction below.
    let canonical = serde_json::json!({
        "name": name,
        "config": {
            "command": command,
            "args": args,
            "env": env,
        }
    });
    let bytes = serde_json::to_vec(&canonical).expect("json values always serialize");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}
