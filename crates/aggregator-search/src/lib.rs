//! Hybrid search: lexical fuzzy mode and semantic vector mode, switched by
//! an explicit mode value supplied by the caller (the aggregator reads
//! `MCP_SEARCH_MODE` once at startup and passes it down; this crate never
//! touches the environment itself).

use std::collections::HashSet;

use aggregator_core::ToolRecord;
use aggregator_embeddings::EmbeddingService;
use aggregator_registry::ToolRegistry;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Fuzzy,
    Vector,
}

impl SearchMode {
    pub fn from_env_value(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "vector" => SearchMode::Vector,
            _ => SearchMode::Fuzzy,
        }
    }
}

const WEIGHT_NAME: f64 = 0.50;
const WEIGHT_DESCRIPTION: f64 = 0.30;
const WEIGHT_SCHEMA_KEYWORDS: f64 = 0.15;
const WEIGHT_SERVER: f64 = 0.05;
const FUZZY_THRESHOLD: f64 = 0.40;
const VECTOR_THRESHOLD: f32 = 0.35;

/// One entry in the fuzzy index: the record plus its lowercased weighted
/// fields, built once and reused until the registry's `updatedAt` moves on.
#[derive(Clone)]
struct IndexedRecord {
    record: ToolRecord,
    name_lc: String,
    description_lc: String,
    schema_keywords_lc: String,
    server_lc: String,
}

struct FuzzyIndex {
    entries: Vec<IndexedRecord>,
}

impl FuzzyIndex {
    fn build(records: &[ToolRecord]) -> Self {
        let entries = records
            .iter()
            .map(|record| IndexedRecord {
                name_lc: record.name.to_lowercase(),
                description_lc: record.description.to_lowercase(),
                schema_keywords_lc: record.schema_keywords.to_lowercase(),
                server_lc: record.server.to_lowercase(),
                record: record.clone(),
            })
            .collect();
        FuzzyIndex { entries }
    }

    /// Weighted substring score against a single (already lowercased)
    /// query string. Returns `None` below `FUZZY_THRESHOLD`.
    fn score(&self, entry: &IndexedRecord, query: &str) -> Option<f64> {
        let mut score = 0.0;
        if entry.name_lc.contains(query) {
            score += WEIGHT_NAME;
        }
        if entry.description_lc.contains(query) {
            score += WEIGHT_DESCRIPTION;
        }
        if entry.schema_keywords_lc.contains(query) {
            score += WEIGHT_SCHEMA_KEYWORDS;
        }
        if entry.server_lc.contains(query) {
            score += WEIGHT_SERVER;
        }
        if score >= FUZZY_THRESHOLD {
            Some(score)
        } else {
            None
        }
    }
}

/// Caches the built fuzzy index alongside the registry version it was
/// built from; rebuilt whenever `updatedAt` has moved on since.
pub struct SearchEngine {
    fuzzy_cache: RwLock<Option<(u64, std::sync::Arc<FuzzyIndex>)>>,
}

impl Default for SearchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchEngine {
    pub fn new() -> Self {
        SearchEngine {
            fuzzy_cache: RwLock::new(None),
        }
    }

    fn fuzzy_index(&self, registry_version: u64, records: &[ToolRecord]) -> std::sync::Arc<FuzzyIndex> {
        {
            let cache = self.fuzzy_cache.read();
            if let Some((built_at, index)) = cache.as_ref() {
                if *built_at == registry_version {
                    return index.clone();
                }
            }
        }
        let index = std::sync::Arc::new(FuzzyIndex::build(records));
        *self.fuzzy_cache.write() = Some((registry_version, index.clone()));
        index
    }

    pub async fn search(
        &self,
        registry: &ToolRegistry,
        mode: SearchMode,
        query: &str,
        limit: i64,
        embeddings: Option<&EmbeddingService>,
    ) -> anyhow::Result<Vec<ToolRecord>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let limit = limit as usize;

        match mode {
            SearchMode::Fuzzy => Ok(self.search_fuzzy(registry, query, limit).await),
            SearchMode::Vector => self.search_vector(registry, query, limit, embeddings).await,
        }
    }

    async fn search_fuzzy(&self, registry: &ToolRegistry, query: &str, limit: usize) -> Vec<ToolRecord> {
        let records = registry.all_tools().await;
        if records.is_empty() {
            return Vec::new();
        }
        let index = self.fuzzy_index(registry.updated_at(), &records);

        let lowered_query = query.to_lowercase();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut candidates: Vec<(IndexedRecord, f64)> = Vec::new();

        for entry in &index.entries {
            if let Some(score) = index.score(entry, &lowered_query) {
                let key = (entry.record.server.clone(), entry.record.name.clone());
                if seen.insert(key) {
                    candidates.push((entry.clone(), score));
                }
            }
        }

        if candidates.len() < limit {
            for token in aggregator_text::tokenize(query, 4) {
                for entry in &index.entries {
                    if let Some(score) = index.score(entry, &token) {
                        let key = (entry.record.server.clone(), entry.record.name.clone());
                        if seen.insert(key) {
                            candidates.push((entry.clone(), score));
                        }
                    }
                }
            }
        }

        let query_words: Vec<String> = aggregator_text::tokenize(query, 2);
        let mut scored: Vec<(IndexedRecord, f64, f64)> = candidates
            .into_iter()
            .map(|(entry, fuzzy_score)| {
                let coverage = coverage_score(&entry.record, &query_words);
                (entry, coverage, fuzzy_score)
            })
            .collect();

        scored.sort_by(|a, b| {
            let (_, cov_a, fuzzy_a) = a;
            let (_, cov_b, fuzzy_b) = b;
            if (cov_a - cov_b).abs() <= 0.1 {
                fuzzy_a
                    .partial_cmp(fuzzy_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            } else {
                cov_b
                    .partial_cmp(cov_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }
        });

        scored
            .into_iter()
            .take(limit)
            .map(|(entry, _, _)| entry.record)
            .collect()
    }

    async fn search_vector(
        &self,
        registry: &ToolRegistry,
        query: &str,
        limit: usize,
        embeddings: Option<&EmbeddingService>,
    ) -> anyhow::Result<Vec<ToolRecord>> {
        let embeddings = embeddings.ok_or_else(|| anyhow::anyhow!("vector search requires an embedding service"))?;
        let query_embedding = embeddings.generate_embedding(query).await?;

        let records = registry.all_tools().await;
        let mut scored: Vec<(f32, ToolRecord)> = records
            .into_iter()
            .filter_map(|record| {
                let embedding = record.embedding.as_ref()?;
                let score = dot_product(&query_embedding, embedding);
                if score > VECTOR_THRESHOLD {
                    Some((score, record))
                } else {
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, record)| record).collect())
    }
}

fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// `+1` if `normalizedText` contains the word, `+0.5` extra if the
/// lowercased name also contains it.
fn coverage_score(record: &ToolRecord, words: &[String]) -> f64 {
    let name_lc = record.name.to_lowercase();
    let mut score = 0.0;
    for word in words {
        if record.normalized_text.contains(word.as_str()) {
            score += 1.0;
            if name_lc.contains(word.as_str()) {
                score += 0.5;
            }
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(server: &str, name: &str, description: &str, embedding: Option<Vec<f32>>) -> ToolRecord {
        let schema_keywords = aggregator_text::extract_keywords(name, Some(description))
            .into_iter()
            .collect::<Vec<_>>()
            .join(" ");
        let normalized_text =
            aggregator_text::normalize(&format!("{} {} {}", name, description, schema_keywords));
        ToolRecord {
            server: server.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            schema: serde_json::json!({}),
            schema_keywords,
            normalized_text,
            embedding,
            is_skill: false,
            steps: None,
        }
    }

    // Drives tool ingestion through `register_skill`, the only ingestion
    // path that doesn't require a live upstream client, to exercise
    // `SearchEngine` against a real `ToolRegistry`. Vector scoring with
    // specific embeddings is tested separately against hand-built records.
    async fn populated_registry(names: &[(&str, Option<Vec<f32>>)]) -> ToolRegistry {
        let registry = ToolRegistry::new();
        for (name, _embedding) in names {
            let skill = aggregator_core::Skill {
                name: name.to_string(),
                description: description_for(name).to_string(),
                parameters: Default::default(),
                steps: vec![],
            };
            registry.register_skill(skill, None).await;
        }
        registry
    }

    fn description_for(name: &str) -> &'static str {
        match name {
            "get_weather" => "Fetches current weather for a location",
            "search_github" => "Search GitHub repositories",
            "list_files" => "List files in a directory",
            _ => "",
        }
    }

    #[test]
    fn coverage_score_rewards_name_match() {
        let r = record("weather", "get_weather", "Fetches current weather for a location", None);
        let words = vec!["weather".to_string()];
        assert_eq!(coverage_score(&r, &words), 1.5);
    }

    #[test]
    fn fuzzy_index_scores_unique_name_above_threshold() {
        let records = vec![
            record("weather", "get_weather", "Fetches current weather for a location", None),
            record("github", "search_github", "Search GitHub repositories", None),
            record("fs", "list_files", "List files in a directory", None),
        ];
        let index = FuzzyIndex::build(&records);
        let scores: Vec<Option<f64>> = index
            .entries
            .iter()
            .map(|e| index.score(e, "weather"))
            .collect();
        assert!(scores[0].is_some());
        assert!(scores[1].is_none());
        assert!(scores[2].is_none());
    }

    #[tokio::test]
    async fn fuzzy_search_unique_substring_returns_record_first() {
        let engine = SearchEngine::new();
        let registry = populated_registry(&[
            ("get_weather", None),
            ("search_github", None),
            ("list_files", None),
        ])
        .await;

        let results = engine
            .search(&registry, SearchMode::Fuzzy, "weather", 5, None)
            .await
            .unwrap();
        assert_eq!(results.first().map(|r| r.name.as_str()), Some("get_weather"));
    }

    #[tokio::test]
    async fn fuzzy_search_search_query_ranks_search_tool_first() {
        let engine = SearchEngine::new();
        let registry = populated_registry(&[
            ("get_weather", None),
            ("search_github", None),
            ("list_files", None),
        ])
        .await;

        let results = engine
            .search(&registry, SearchMode::Fuzzy, "search", 5, None)
            .await
            .unwrap();
        assert_eq!(results.first().map(|r| r.name.as_str()), Some("search_github"));
    }

    #[test]
    fn vector_scoring_ranks_nearest_first_and_filters_negative() {
        let records = vec![
            record("a", "get_weather", "weather", Some(vec![1.0, 0.0, 0.0])),
            record("b", "search_github", "github", Some(vec![0.0, 1.0, 0.0])),
            record("c", "list_files", "files", Some(vec![0.0, 0.0, 1.0])),
        ];

        let query = l2_normalize(vec![0.9, 0.1, 0.1]);
        let mut scored: Vec<(f32, &ToolRecord)> = records
            .iter()
            .map(|r| (dot_product(&query, r.embedding.as_ref().unwrap()), r))
            .filter(|(score, _)| *score > VECTOR_THRESHOLD)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        assert_eq!(scored.first().unwrap().1.name, "get_weather");

        let opposite_query = l2_normalize(vec![-1.0, -1.0, -1.0]);
        let empty: Vec<_> = records
            .iter()
            .filter(|r| dot_product(&opposite_query, r.embedding.as_ref().unwrap()) > VECTOR_THRESHOLD)
            .collect();
        assert!(empty.is_empty());
    }

    fn l2_normalize(v: Vec<f32>) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.into_iter().map(|x| x / norm).collect()
    }

    #[tokio::test]
    async fn limit_zero_returns_empty() {
        let engine = SearchEngine::new();
        let registry = populated_registry(&[("get_weather", None)]).await;
        let results = engine
            .search(&registry, SearchMode::Fuzzy, "weather", 0, None)
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
