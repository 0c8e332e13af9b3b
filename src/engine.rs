use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::SearchConfig;
use crate::embedder::EmbeddingEngine;
use crate::error::Result;
use crate::extractor::{extract_definition, DefinitionResult, TargetKind};
use crate::intent::{analyse_query, QueryIntent, QueryType};
use crate::progress::Deadline;
use crate::scanner::Origin;
use crate::search::{semantic_search, BoostContext, SearchFilters, SemanticResult};
use crate::store::VectorStore;

/// Definition results carried into a response, best match first.
pub const MAX_DEFINITION_RESULTS: usize = 5;

/// Semantic search over-fetches this many rows beyond `top_k` so overlap
/// deduplication does not leave the response short.
const SEMANTIC_OVERSAMPLE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Engine,
    Project,
    All,
}

impl Scope {
    fn origin(self) -> Option<Origin> {
        match self {
            Scope::Engine => Some(Origin::Engine),
            Scope::Project => Some(Origin::Project),
            Scope::All => None,
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "engine" => Ok(Scope::Engine),
            "project" => Ok(Scope::Project),
            "all" => Ok(Scope::All),
            other => Err(format!("unknown scope {other:?} (engine|project|all)")),
        }
    }
}

/// Union of the two result families, tagged for serialisation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CombinedResult {
    Definition(DefinitionResult),
    Semantic(SemanticResult),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Timings {
    pub intent_analysis_ms: u64,
    pub definition_ms: u64,
    pub embed_ms: u64,
    pub search_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMeta {
    pub total_results: usize,
    /// The deadline expired somewhere along the way; results are
    /// best-effort.
    pub partial: bool,
    pub store_generation: String,
}

/// The stable response contract: every query returns one of these, with
/// partial data and an `errors` array when a stage failed.
#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub question: String,
    pub intent: QueryIntent,
    pub definition_results: Vec<DefinitionResult>,
    pub semantic_results: Vec<SemanticResult>,
    pub combined_results: Vec<CombinedResult>,
    pub timing: Timings,
    pub errors: Vec<String>,
    pub metadata: ResponseMeta,
}

/// Open an existing store read-only.
pub fn open_store(dir: &Path) -> Result<VectorStore> {
    VectorStore::open(dir)
}

/// One-directional composition: the engine owns the store handle and the
/// embedder; nothing points back at it.
pub struct HybridEngine {
    store: VectorStore,
    embedder: EmbeddingEngine,
    cfg: SearchConfig,
}

impl HybridEngine {
    pub fn new(store: VectorStore, embedder: EmbeddingEngine, cfg: SearchConfig) -> Result<Self> {
        cfg.validate()?;
        store.check_model(embedder.model_name(), embedder.dim())?;
        Ok(Self {
            store,
            embedder,
            cfg,
        })
    }

    /// Open the store at `data_dir` and load the configured model.
    pub fn open(data_dir: &Path, cfg: SearchConfig) -> Result<Self> {
        let embedder = EmbeddingEngine::from_config(&cfg.embedding)?;
        let store = VectorStore::open(data_dir)?;
        Self::new(store, embedder, cfg)
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    /// Pick up the latest store generation after a rebuild.
    pub fn reload(&mut self) -> Result<()> {
        let store = VectorStore::open(self.store.dir())?;
        store.check_model(self.embedder.model_name(), self.embedder.dim())?;
        self.store = store;
        Ok(())
    }

    /// Route a question through intent analysis, definition extraction
    /// and/or filtered semantic search, then merge.
    ///
    /// Never fails: stage errors land in `errors[]` and the response
    /// carries whatever was gathered.
    pub fn query(
        &mut self,
        question: &str,
        top_k: usize,
        scope: Scope,
        filters: Option<SearchFilters>,
        deadline: Option<Duration>,
    ) -> QueryResponse {
        let total_start = Instant::now();
        let deadline = deadline.map(Deadline::after).unwrap_or_else(Deadline::none);
        let mut timing = Timings::default();
        let mut errors: Vec<String> = Vec::new();
        let mut partial = false;

        let step = Instant::now();
        let intent = analyse_query(question);
        timing.intent_analysis_ms = step.elapsed().as_millis() as u64;

        let mut definition_results: Vec<DefinitionResult> = Vec::new();
        if matches!(intent.query_type, QueryType::Definition | QueryType::Hybrid) {
            if let Some(name) = &intent.entity_name {
                if deadline.expired() {
                    partial = true;
                } else {
                    let step = Instant::now();
                    let kind = intent.entity_type.unwrap_or(TargetKind::Struct);
                    let candidates = self.candidate_files(scope);
                    definition_results = extract_definition(&candidates, kind, name, true);
                    definition_results.truncate(MAX_DEFINITION_RESULTS);
                    timing.definition_ms = step.elapsed().as_millis() as u64;
                }
            }
        }

        let mut semantic_results: Vec<SemanticResult> = Vec::new();
        if matches!(intent.query_type, QueryType::Semantic | QueryType::Hybrid) && top_k > 0 {
            if deadline.expired() {
                partial = true;
            } else {
                let step = Instant::now();
                let query_vector = if intent.enhanced_query.trim().is_empty() {
                    Ok(vec![0.0; self.embedder.dim()])
                } else {
                    self.embedder.encode_query(&intent.enhanced_query)
                };
                timing.embed_ms = step.elapsed().as_millis() as u64;

                match query_vector {
                    Ok(query_vector) => {
                        let step = Instant::now();
                        let mut filters = filters.clone().unwrap_or_default();
                        if filters.origin.is_none() {
                            filters.origin = scope.origin();
                        }
                        let boosts = BoostContext {
                            entity_name: intent.entity_name.clone(),
                            definition_query: intent.query_type == QueryType::Definition,
                            entity_boost: intent.entity_name.is_some(),
                            macro_boost: intent.entity_type.is_some(),
                        };
                        let outcome = semantic_search(
                            &self.store,
                            &query_vector,
                            &filters,
                            &boosts,
                            &self.cfg.rules,
                            top_k + SEMANTIC_OVERSAMPLE,
                            &deadline,
                        );
                        partial |= outcome.partial;
                        // Stale rows are filtered against the filesystem as
                        // it is now; pruning them for good is `compact`'s job.
                        semantic_results = outcome
                            .results
                            .into_iter()
                            .filter(|r| Path::new(&r.path).exists())
                            .collect();
                        timing.search_ms = step.elapsed().as_millis() as u64;
                    }
                    Err(e) => errors.push(format!("semantic search unavailable: {e}")),
                }
            }
        }

        let combined_results = merge_results(&definition_results, &semantic_results, top_k);
        // The oversample beyond top_k only existed to survive dedup.
        semantic_results.truncate(top_k);
        timing.total_ms = total_start.elapsed().as_millis() as u64;

        QueryResponse {
            question: question.to_string(),
            intent,
            metadata: ResponseMeta {
                total_results: combined_results.len(),
                partial,
                store_generation: self.store.header().generation_id.clone(),
            },
            definition_results,
            semantic_results,
            combined_results,
            timing,
            errors,
        }
    }

    /// Unique on-disk files known to the store, scope-filtered. These are
    /// the definition extractor's candidates.
    fn candidate_files(&self, scope: Scope) -> Vec<PathBuf> {
        let origin = scope.origin();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        for rec in self.store.records() {
            if origin.is_some_and(|o| rec.origin != o) {
                continue;
            }
            if seen.insert(rec.path.as_str()) {
                let path = PathBuf::from(&rec.path);
                if path.exists() {
                    out.push(path);
                }
            }
        }
        out
    }
}

/// Definitions first (already in match-quality order), then semantic
/// results whose chunk does not overlap any definition's span, trimmed to
/// `top_k`.
fn merge_results(
    definitions: &[DefinitionResult],
    semantic: &[SemanticResult],
    top_k: usize,
) -> Vec<CombinedResult> {
    let mut out: Vec<CombinedResult> = Vec::new();
    for d in definitions {
        if out.len() >= top_k {
            break;
        }
        out.push(CombinedResult::Definition(d.clone()));
    }
    for s in semantic {
        if out.len() >= top_k {
            break;
        }
        if definitions.iter().any(|d| overlaps(d, s)) {
            continue;
        }
        out.push(CombinedResult::Semantic(s.clone()));
    }
    out
}

fn overlaps(def: &DefinitionResult, sem: &SemanticResult) -> bool {
    if def.file_path != sem.path {
        return false;
    }
    sem.char_start < def.char_end && def.char_start < sem.char_end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(path: &str, start: u64, end: u64) -> DefinitionResult {
        DefinitionResult {
            entity_type: TargetKind::Struct,
            entity_name: "FHitResult".into(),
            file_path: path.into(),
            line_start: 1,
            line_end: 10,
            definition_text: String::new(),
            members: vec![],
            match_quality: 1.0,
            char_start: start,
            char_end: end,
        }
    }

    fn sem(path: &str, start: u64, end: u64) -> SemanticResult {
        SemanticResult {
            path: path.into(),
            chunk_index: 0,
            total_chunks: 1,
            score: 0.5,
            origin: Origin::Engine,
            char_start: start,
            char_end: end,
            entities: vec![],
            entity_type: None,
        }
    }

    #[test]
    fn merge_puts_definitions_first_and_dedups_overlaps() {
        let defs = vec![def("/e/Hit.h", 100, 600)];
        let sems = vec![
            sem("/e/Hit.h", 400, 900),  // overlaps the definition
            sem("/e/Hit.h", 700, 1200), // same file, no overlap
            sem("/e/Other.h", 0, 300),
        ];
        let merged = merge_results(&defs, &sems, 10);
        assert_eq!(merged.len(), 3);
        assert!(matches!(merged[0], CombinedResult::Definition(_)));
        match &merged[1] {
            CombinedResult::Semantic(s) => assert_eq!(s.char_start, 700),
            other => panic!("expected semantic, got {other:?}"),
        }
    }

    #[test]
    fn merge_trims_to_top_k() {
        let defs = vec![def("/a.h", 0, 10), def("/b.h", 0, 10)];
        let sems = vec![sem("/c.h", 0, 10), sem("/d.h", 0, 10)];
        let merged = merge_results(&defs, &sems, 3);
        assert_eq!(merged.len(), 3);
        assert!(matches!(merged[0], CombinedResult::Definition(_)));
        assert!(matches!(merged[1], CombinedResult::Definition(_)));
        assert!(matches!(merged[2], CombinedResult::Semantic(_)));
    }

    #[test]
    fn scope_maps_to_origin_filters() {
        assert_eq!(Scope::Engine.origin(), Some(Origin::Engine));
        assert_eq!(Scope::Project.origin(), Some(Origin::Project));
        assert_eq!(Scope::All.origin(), None);
        assert_eq!("engine".parse::<Scope>().unwrap(), Scope::Engine);
        assert!("nowhere".parse::<Scope>().is_err());
    }
}
