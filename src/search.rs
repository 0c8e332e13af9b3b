use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::RuleWeights;
use crate::enrich::EntityKind;
use crate::progress::Deadline;
use crate::scanner::Origin;
use crate::store::{ChunkMeta, VectorStore};

/// Rows scored per deadline check. Small enough that an expired deadline
/// is noticed promptly, large enough to amortise the parallel dispatch.
const SCAN_BLOCK_ROWS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    Header,
    Implementation,
}

/// Caller predicates ANDed into a pre-filter mask over the metadata.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub entity: Option<String>,
    pub entity_type: Option<EntityKind>,
    pub require_uproperty: bool,
    pub require_uclass: bool,
    pub require_ufunction: bool,
    pub require_ustruct: bool,
    pub origin: Option<Origin>,
    pub file_role: Option<FileRole>,
}

impl SearchFilters {
    fn admits(&self, meta: &ChunkMeta) -> bool {
        if let Some(entity) = &self.entity {
            if !meta.entities.iter().any(|e| e.eq_ignore_ascii_case(entity)) {
                return false;
            }
        }
        if let Some(kind) = self.entity_type {
            if !meta.entity_types.contains(&kind) {
                return false;
            }
        }
        if self.require_uproperty && !meta.has_uproperty {
            return false;
        }
        if self.require_uclass && !meta.has_uclass {
            return false;
        }
        if self.require_ufunction && !meta.has_ufunction {
            return false;
        }
        if self.require_ustruct && !meta.has_ustruct {
            return false;
        }
        if let Some(origin) = self.origin {
            if meta.origin != origin {
                return false;
            }
        }
        match self.file_role {
            Some(FileRole::Header) if !meta.is_header => return false,
            Some(FileRole::Implementation) if !meta.is_implementation => return false,
            _ => {}
        }
        true
    }
}

/// Query-shaped knobs for the rule engine. `entity_name` is the target
/// entity once the router knows it; the two boost switches are
/// caller-provided.
#[derive(Debug, Clone, Default)]
pub struct BoostContext {
    pub entity_name: Option<String>,
    pub definition_query: bool,
    pub entity_boost: bool,
    pub macro_boost: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticResult {
    pub path: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Boosted score: cosine similarity times rule multipliers. Not
    /// bounded to [0,1]; only comparable within one response.
    pub score: f32,
    pub origin: Origin,
    pub char_start: u64,
    pub char_end: u64,
    pub entities: Vec<String>,
    pub entity_type: Option<EntityKind>,
}

pub struct SearchOutcome {
    pub results: Vec<SemanticResult>,
    /// The deadline expired mid-scan; results are best-effort over the
    /// rows visited so far.
    pub partial: bool,
}

/// Multiplicative rule engine on top of raw cosine similarity. The rules
/// compose commutatively; enrichment-dependent rules are no-ops on
/// unenriched chunks.
pub fn boosted_score(
    sim: f32,
    meta: &ChunkMeta,
    boosts: &BoostContext,
    weights: &RuleWeights,
) -> f32 {
    let mut score = sim;
    if let Some(entity) = &boosts.entity_name {
        let entity_lower = entity.to_lowercase();
        let stem = meta
            .path
            .rsplit('/')
            .next()
            .unwrap_or(&meta.path)
            .split('.')
            .next()
            .unwrap_or("")
            .to_lowercase();
        if stem.contains(&entity_lower) {
            score *= weights.path_match;
        }
        if !meta.entities.is_empty() {
            if meta
                .entities
                .iter()
                .any(|e| e.eq_ignore_ascii_case(entity))
            {
                if boosts.entity_boost {
                    score *= weights.entity_boost;
                }
            } else {
                // Confident entity target, chunk never mentions it.
                score *= weights.cooccurrence_penalty;
            }
        }
    }
    if boosts.definition_query {
        if meta.is_header {
            score *= weights.header_priority;
        }
        if meta.is_implementation {
            score *= weights.impl_penalty;
        }
    }
    if meta.entities.len() > 3 {
        score *= weights.rich_chunk;
    }
    if boosts.macro_boost && meta.has_any_macro() {
        score *= weights.macro_boost;
    }
    score
}

/// Pre-filter, score, boost, select top-k.
///
/// The query vector is assumed L2-normalised, so scoring is a dot product
/// over the mmapped rows. Scanning happens in blocks with a deadline check
/// between blocks; expiry returns the best-k over the rows scanned and
/// marks the outcome partial. Results are deterministic for identical
/// inputs against one store generation.
pub fn semantic_search(
    store: &VectorStore,
    query_vector: &[f32],
    filters: &SearchFilters,
    boosts: &BoostContext,
    weights: &RuleWeights,
    top_k: usize,
    deadline: &Deadline,
) -> SearchOutcome {
    let n = store.len();
    let mut scored: Vec<(usize, f32)> = Vec::new();
    let mut partial = false;

    let mut block_start = 0usize;
    while block_start < n {
        if deadline.expired() {
            partial = true;
            break;
        }
        let block_end = (block_start + SCAN_BLOCK_ROWS).min(n);
        let block: Vec<(usize, f32)> = (block_start..block_end)
            .into_par_iter()
            .filter_map(|i| {
                let meta = store.record(i);
                if meta.invalid || !filters.admits(meta) {
                    return None;
                }
                let sim = store.row_dot(i, query_vector);
                Some((i, boosted_score(sim, meta, boosts, weights)))
            })
            .collect();
        scored.extend(block);
        block_start = block_end;
    }

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let ma = store.record(a.0);
                let mb = store.record(b.0);
                ma.chunk_index
                    .cmp(&mb.chunk_index)
                    .then_with(|| ma.path.cmp(&mb.path))
            })
    });

    let results = scored
        .into_iter()
        .take(top_k)
        .map(|(i, score)| {
            let meta = store.record(i);
            SemanticResult {
                path: meta.path.clone(),
                chunk_index: meta.chunk_index,
                total_chunks: meta.total_chunks,
                score,
                origin: meta.origin,
                char_start: meta.char_start,
                char_end: meta.char_end,
                entities: meta.entities.clone(),
                entity_type: meta.entity_types.first().copied(),
            }
        })
        .collect();

    SearchOutcome { results, partial }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::enrich_chunk;
    use crate::store::{write_store, ReuseCache, StoreHeader, VectorStore, STORE_VERSION};
    use std::path::Path;

    const DIM: usize = 4;

    fn meta(path: &str, origin: Origin, chunk_index: u32, snippet: &str) -> ChunkMeta {
        ChunkMeta::new(
            Path::new(path),
            origin,
            chunk_index,
            1,
            0,
            snippet.len() as u64,
            "hash".into(),
            &enrich_chunk(snippet),
        )
    }

    fn unit(hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[hot % DIM] = 1.0;
        v
    }

    fn build_store(dir: &Path, records: &[ChunkMeta], rows: &[Vec<f32>]) -> VectorStore {
        let header = StoreHeader {
            version: STORE_VERSION,
            generation_id: "gen-search-test".into(),
            model_name: "test-model".into(),
            embedding_dim: DIM as u32,
            created_at: 1_700_000_000,
        };
        write_store(dir, &header, records, rows, &ReuseCache::default()).unwrap();
        VectorStore::open(dir).unwrap()
    }

    #[test]
    fn origin_and_role_filters_mask_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let records = vec![
            meta("/e/Hit.h", Origin::Engine, 0, "struct FHitResult {};"),
            meta("/p/Game.cpp", Origin::Project, 0, "void Play() {}"),
        ];
        let rows = vec![unit(0), unit(0)];
        let store = build_store(tmp.path(), &records, &rows);

        let filters = SearchFilters {
            origin: Some(Origin::Engine),
            ..Default::default()
        };
        let out = semantic_search(
            &store,
            &unit(0),
            &filters,
            &BoostContext::default(),
            &RuleWeights::default(),
            10,
            &Deadline::none(),
        );
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].path, "/e/Hit.h");

        let filters = SearchFilters {
            file_role: Some(FileRole::Implementation),
            ..Default::default()
        };
        let out = semantic_search(
            &store,
            &unit(0),
            &filters,
            &BoostContext::default(),
            &RuleWeights::default(),
            10,
            &Deadline::none(),
        );
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].path, "/p/Game.cpp");
    }

    #[test]
    fn entity_filter_requires_cooccurrence() {
        let tmp = tempfile::tempdir().unwrap();
        let records = vec![
            meta("/e/Hit.h", Origin::Engine, 0, "struct FHitResult {};"),
            meta("/e/Other.h", Origin::Engine, 0, "struct FVector {};"),
        ];
        let store = build_store(tmp.path(), &records, &[unit(0), unit(0)]);
        let filters = SearchFilters {
            entity: Some("FHitResult".into()),
            ..Default::default()
        };
        let out = semantic_search(
            &store,
            &unit(0),
            &filters,
            &BoostContext::default(),
            &RuleWeights::default(),
            10,
            &Deadline::none(),
        );
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].path, "/e/Hit.h");
    }

    // ── rule engine, as a pure function ──────────────────────────────────

    #[test]
    fn header_priority_and_impl_penalty_apply_on_definition_queries() {
        let w = RuleWeights::default();
        let header = meta("/e/Plain.h", Origin::Engine, 0, "int x;");
        let impl_file = meta("/e/Plain.cpp", Origin::Engine, 0, "int x;");
        let boosts = BoostContext {
            definition_query: true,
            ..Default::default()
        };
        assert_eq!(boosted_score(1.0, &header, &boosts, &w), 2.5);
        assert_eq!(boosted_score(1.0, &impl_file, &boosts, &w), 0.5);
        // Not a definition query: no-ops.
        assert_eq!(boosted_score(1.0, &header, &BoostContext::default(), &w), 1.0);
    }

    #[test]
    fn path_match_triples_the_score() {
        let w = RuleWeights::default();
        let m = meta("/Engine/HitResult.h", Origin::Engine, 0, "int x;");
        let boosts = BoostContext {
            entity_name: Some("HitResult".into()),
            ..Default::default()
        };
        assert_eq!(boosted_score(1.0, &m, &boosts, &w), 3.0);
    }

    #[test]
    fn missing_entity_cooccurrence_is_punished() {
        let w = RuleWeights::default();
        let m = meta("/e/Unrelated.cs", Origin::Engine, 0, "struct FVector {};");
        let boosts = BoostContext {
            entity_name: Some("FHitResult".into()),
            ..Default::default()
        };
        let score = boosted_score(1.0, &m, &boosts, &w);
        assert!((score - 0.1).abs() < 1e-6);
    }

    #[test]
    fn cooccurrence_penalty_is_a_noop_without_enrichment() {
        let w = RuleWeights::default();
        let m = meta("/e/Unrelated.cs", Origin::Engine, 0, "no entities here");
        let boosts = BoostContext {
            entity_name: Some("FHitResult".into()),
            ..Default::default()
        };
        assert_eq!(boosted_score(1.0, &m, &boosts, &w), 1.0);
    }

    #[test]
    fn entity_and_macro_boosts_are_caller_gated() {
        let w = RuleWeights::default();
        let m = meta(
            "/e/Types.cs",
            Origin::Engine,
            0,
            "USTRUCT()\nstruct FHitResult { int A; };",
        );
        let gated_off = BoostContext {
            entity_name: Some("FHitResult".into()),
            ..Default::default()
        };
        // Entity present: no penalty, no boost without the gates.
        assert_eq!(boosted_score(1.0, &m, &gated_off, &w), 1.0);

        let gated_on = BoostContext {
            entity_name: Some("FHitResult".into()),
            entity_boost: true,
            macro_boost: true,
            ..Default::default()
        };
        let score = boosted_score(1.0, &m, &gated_on, &w);
        assert!((score - 1.2 * 1.15).abs() < 1e-6);
    }

    #[test]
    fn rich_chunks_get_a_bonus() {
        let w = RuleWeights::default();
        let m = meta(
            "/e/Rich.cs",
            Origin::Engine,
            0,
            "FVector FRotator FTransform FQuat in one chunk",
        );
        assert!(m.entities.len() > 3);
        let score = boosted_score(1.0, &m, &BoostContext::default(), &w);
        assert!((score - 1.3).abs() < 1e-6);
    }

    #[test]
    fn results_are_deterministic_across_invocations() {
        let tmp = tempfile::tempdir().unwrap();
        let records: Vec<ChunkMeta> = (0..50)
            .map(|i| meta(&format!("/e/File{i}.h"), Origin::Engine, 0, "int x;"))
            .collect();
        let rows: Vec<Vec<f32>> = (0..50).map(|i| unit(i % DIM)).collect();
        let store = build_store(tmp.path(), &records, &rows);

        let run = || {
            semantic_search(
                &store,
                &unit(1),
                &SearchFilters::default(),
                &BoostContext::default(),
                &RuleWeights::default(),
                10,
                &Deadline::none(),
            )
            .results
            .iter()
            .map(|r| (r.path.clone(), r.score))
            .collect::<Vec<_>>()
        };
        let a = run();
        let b = run();
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn expired_deadline_marks_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let records = vec![meta("/e/A.h", Origin::Engine, 0, "int x;")];
        let store = build_store(tmp.path(), &records, &[unit(0)]);
        let out = semantic_search(
            &store,
            &unit(0),
            &SearchFilters::default(),
            &BoostContext::default(),
            &RuleWeights::default(),
            10,
            &Deadline::after(std::time::Duration::ZERO),
        );
        assert!(out.partial);
        assert!(out.results.is_empty());
    }

    #[test]
    fn top_k_zero_returns_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let records = vec![meta("/e/A.h", Origin::Engine, 0, "int x;")];
        let store = build_store(tmp.path(), &records, &[unit(0)]);
        let out = semantic_search(
            &store,
            &unit(0),
            &SearchFilters::default(),
            &BoostContext::default(),
            &RuleWeights::default(),
            0,
            &Deadline::none(),
        );
        assert!(out.results.is_empty());
        assert!(!out.partial);
    }
}
