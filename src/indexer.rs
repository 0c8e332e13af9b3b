use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::chunker::{chunk_spans, ChunkSpan};
use crate::config::SearchConfig;
use crate::embedder::EmbeddingEngine;
use crate::enrich::{enrich_chunk, Enrichment};
use crate::error::{Error, Result};
use crate::progress::{CancelToken, ProgressEvent, ProgressSink};
use crate::scanner::{discover, DiscoveryInput, Origin};
use crate::store::{
    content_hash, write_store, CacheEntry, ChunkMeta, ReuseCache, StoreHeader, StoreLock,
    VectorStore, STORE_VERSION,
};

/// Summary of one indexing run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub files_discovered: usize,
    pub files_indexed: usize,
    pub files_reused: usize,
    pub files_skipped: usize,
    pub chunks_embedded: usize,
    pub rows_reused: usize,
    /// Rows carried for files no longer discovered (incremental only).
    pub rows_stale: usize,
    pub rows_written: usize,
    /// Rows zero-filled because their text failed to encode.
    pub rows_zeroed: usize,
    pub device_retries: usize,
    pub cpu_fallback: bool,
    pub elapsed_ms: u64,
}

/// Full rebuild: discovery must find files, rows exist only for what was
/// discovered. Content-hash reuse still applies against a prior
/// generation.
pub fn build_store(
    cfg: &SearchConfig,
    sources: &DiscoveryInput,
    data_dir: &std::path::Path,
    engine: &mut EmbeddingEngine,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<Stats> {
    run_rebuild(cfg, sources, data_dir, engine, progress, cancel, false)
}

/// Incremental rebuild: unchanged files re-use their rows; rows for files
/// that vanished are retained (and filtered at query time) unless
/// `prune_missing_on_incremental` is set. Empty discovery is tolerated as
/// long as the prior generation has rows.
pub fn incremental_update(
    cfg: &SearchConfig,
    sources: &DiscoveryInput,
    data_dir: &std::path::Path,
    engine: &mut EmbeddingEngine,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<Stats> {
    run_rebuild(cfg, sources, data_dir, engine, progress, cancel, true)
}

enum FilePlan {
    Reused {
        prior_first: usize,
        count: usize,
    },
    Fresh {
        path: PathBuf,
        origin: Origin,
        hash: String,
        spans: Vec<ChunkSpan>,
        enrichments: Vec<Enrichment>,
    },
}

fn run_rebuild(
    cfg: &SearchConfig,
    sources: &DiscoveryInput,
    data_dir: &std::path::Path,
    engine: &mut EmbeddingEngine,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
    incremental: bool,
) -> Result<Stats> {
    cfg.validate()?;
    let started = Instant::now();
    let _lock = StoreLock::acquire(data_dir)?;
    let mut stats = Stats::default();

    // A prior generation is only good for reuse if it was built by the
    // same model at the same dimension.
    let prior = match VectorStore::open(data_dir) {
        Ok(s) => {
            if s.check_model(engine.model_name(), engine.dim()).is_ok() {
                Some(s)
            } else {
                info!("existing store was built by another model; full re-embed");
                None
            }
        }
        Err(Error::NotFound(_)) => None,
        Err(e) => {
            warn!("previous store unreadable ({e}); rebuilding from scratch");
            None
        }
    };
    let cache = if prior.is_some() {
        ReuseCache::load(data_dir)
    } else {
        ReuseCache::default()
    };

    let discovered = match discover(sources, &cfg.discovery, cancel) {
        Ok(files) => files,
        Err(Error::EmptyDiscovery)
            if incremental && prior.as_ref().is_some_and(|p| !p.is_empty()) =>
        {
            warn!("discovery found no files; keeping prior rows");
            Vec::new()
        }
        Err(e) => return Err(e),
    };
    stats.files_discovered = discovered.len();
    progress.emit(&ProgressEvent::Discovered {
        files: discovered.len(),
    });

    // Read + hash in parallel; order-preserving so record order stays
    // deterministic.
    cancel.checkpoint()?;
    let read: Vec<Option<(String, String)>> = discovered
        .par_iter()
        .map(|f| {
            if cancel.is_cancelled() {
                return None;
            }
            let bytes = match std::fs::read(&f.abs_path) {
                Ok(b) => b,
                Err(e) => {
                    warn!("cannot read {}: {e}", f.abs_path.display());
                    return None;
                }
            };
            if bytes.contains(&0u8) {
                debug!("skipping {}: binary content", f.abs_path.display());
                return None;
            }
            let hash = content_hash(&bytes);
            let text = String::from_utf8_lossy(&bytes).into_owned();
            Some((hash, text))
        })
        .collect();
    cancel.checkpoint()?;

    let mut plans: Vec<FilePlan> = Vec::new();
    let mut fresh_texts: Vec<String> = Vec::new();

    for (file, maybe) in discovered.iter().zip(read.into_iter()) {
        cancel.checkpoint()?;
        let Some((hash, text)) = maybe else {
            stats.files_skipped += 1;
            progress.emit(&ProgressEvent::FileSkipped {
                path: file.abs_path.to_string_lossy().into_owned(),
            });
            continue;
        };
        let norm_path = file.abs_path.to_string_lossy().replace('\\', "/");

        if let (Some(prior_store), Some(entry)) = (prior.as_ref(), cache.entries.get(&norm_path)) {
            if entry.content_hash == hash {
                let first = entry.first_global_index as usize;
                let count = entry.chunk_count as usize;
                let valid = first + count <= prior_store.len()
                    && (count == 0 || prior_store.record(first).path == norm_path);
                if valid {
                    stats.files_reused += 1;
                    stats.rows_reused += count;
                    plans.push(FilePlan::Reused {
                        prior_first: first,
                        count,
                    });
                    progress.emit(&ProgressEvent::FileReused {
                        path: norm_path,
                        rows: count,
                    });
                    continue;
                }
            }
        }

        let spans = chunk_spans(&text, &cfg.chunking);
        if spans.is_empty() {
            debug!("{norm_path}: no indexable content");
            continue;
        }
        progress.emit(&ProgressEvent::FileChunked {
            path: norm_path,
            chunks: spans.len(),
        });
        let enrichments: Vec<Enrichment> = spans
            .iter()
            .map(|s| enrich_chunk(&text[s.start..s.end]))
            .collect();
        for s in &spans {
            fresh_texts.push(text[s.start..s.end].to_string());
        }
        stats.files_indexed += 1;
        plans.push(FilePlan::Fresh {
            path: file.abs_path.clone(),
            origin: file.origin,
            hash,
            spans,
            enrichments,
        });
    }

    let outcome = engine.encode_all(&fresh_texts, cancel, progress)?;
    stats.chunks_embedded = fresh_texts.len();
    stats.rows_zeroed = outcome.stats.zero_filled;
    stats.device_retries = outcome.stats.device_retries;
    stats.cpu_fallback = outcome.stats.cpu_fallback;

    // Assemble the new generation in discovery order.
    let mut rows: Vec<Vec<f32>> = Vec::new();
    let mut records: Vec<ChunkMeta> = Vec::new();
    let mut new_cache = ReuseCache::default();
    let mut fresh_rows = outcome.vectors.into_iter();
    let mut fresh_invalid = outcome.invalid.into_iter();

    for plan in plans {
        match plan {
            FilePlan::Reused { prior_first, count } => {
                let prior_store = prior.as_ref().expect("reuse plans require a prior store");
                let first_new = rows.len() as u32;
                for i in prior_first..prior_first + count {
                    rows.push(prior_store.row_vector(i));
                    records.push(prior_store.record(i).clone());
                }
                if count > 0 {
                    let rec = &records[records.len() - count];
                    new_cache.entries.insert(
                        rec.path.clone(),
                        CacheEntry {
                            content_hash: rec.content_hash.clone(),
                            chunk_count: count as u32,
                            first_global_index: first_new,
                        },
                    );
                }
            }
            FilePlan::Fresh {
                path,
                origin,
                hash,
                spans,
                enrichments,
            } => {
                let total = spans.len() as u32;
                let first_new = rows.len() as u32;
                let norm = path.to_string_lossy().replace('\\', "/");
                for (i, (span, enrichment)) in spans.iter().zip(enrichments.iter()).enumerate() {
                    let mut meta = ChunkMeta::new(
                        &path,
                        origin,
                        i as u32,
                        total,
                        span.start as u64,
                        span.end as u64,
                        hash.clone(),
                        enrichment,
                    );
                    meta.invalid = fresh_invalid.next().unwrap_or(true);
                    records.push(meta);
                    rows.push(fresh_rows.next().unwrap_or_default());
                }
                new_cache.entries.insert(
                    norm,
                    CacheEntry {
                        content_hash: hash,
                        chunk_count: total,
                        first_global_index: first_new,
                    },
                );
            }
        }
    }

    // Carry rows for vanished files unless pruning was requested. They are
    // filtered against current discovery at query time and removed for
    // good by `compact`.
    if incremental && !cfg.prune_missing_on_incremental {
        if let Some(prior_store) = prior.as_ref() {
            let current: HashSet<String> = records.iter().map(|r| r.path.clone()).collect();
            let mut i = 0usize;
            while i < prior_store.len() {
                let rec = prior_store.record(i);
                if current.contains(&rec.path) {
                    i += 1;
                    continue;
                }
                let path = rec.path.clone();
                let first_new = rows.len() as u32;
                let mut count = 0u32;
                while i < prior_store.len() && prior_store.record(i).path == path {
                    rows.push(prior_store.row_vector(i));
                    records.push(prior_store.record(i).clone());
                    i += 1;
                    count += 1;
                }
                stats.rows_stale += count as usize;
                new_cache.entries.insert(
                    path,
                    CacheEntry {
                        content_hash: records[records.len() - 1].content_hash.clone(),
                        chunk_count: count,
                        first_global_index: first_new,
                    },
                );
            }
        }
    }

    let header = StoreHeader {
        version: STORE_VERSION,
        generation_id: generation_id(engine.model_name(), &records),
        model_name: engine.model_name().to_string(),
        embedding_dim: engine.dim() as u32,
        created_at: unix_now(),
    };
    write_store(data_dir, &header, &records, &rows, &new_cache)?;
    stats.rows_written = rows.len();
    progress.emit(&ProgressEvent::StoreWritten { rows: rows.len() });
    stats.elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(stats)
}

/// Rewrite the store without rows whose file is no longer discovered.
/// No re-embedding happens; surviving rows are copied as-is.
pub fn compact(
    cfg: &SearchConfig,
    sources: &DiscoveryInput,
    data_dir: &std::path::Path,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<Stats> {
    cfg.validate()?;
    let started = Instant::now();
    let _lock = StoreLock::acquire(data_dir)?;
    let prior = VectorStore::open(data_dir)?;
    let mut stats = Stats::default();

    let discovered = discover(sources, &cfg.discovery, cancel)?;
    stats.files_discovered = discovered.len();
    let keep: HashSet<String> = discovered
        .iter()
        .map(|f| f.abs_path.to_string_lossy().replace('\\', "/"))
        .collect();

    let mut rows: Vec<Vec<f32>> = Vec::new();
    let mut records: Vec<ChunkMeta> = Vec::new();
    let mut new_cache = ReuseCache::default();

    let mut i = 0usize;
    while i < prior.len() {
        cancel.checkpoint()?;
        let rec = prior.record(i);
        let path = rec.path.clone();
        let keep_block = keep.contains(&path);
        let first_new = rows.len() as u32;
        let mut count = 0u32;
        while i < prior.len() && prior.record(i).path == path {
            if keep_block {
                rows.push(prior.row_vector(i));
                records.push(prior.record(i).clone());
                count += 1;
            } else {
                stats.rows_stale += 1;
            }
            i += 1;
        }
        if keep_block && count > 0 {
            let rec = &records[records.len() - count as usize];
            new_cache.entries.insert(
                path,
                CacheEntry {
                    content_hash: rec.content_hash.clone(),
                    chunk_count: count,
                    first_global_index: first_new,
                },
            );
        }
    }

    let header = StoreHeader {
        version: STORE_VERSION,
        generation_id: generation_id(&prior.header().model_name, &records),
        model_name: prior.header().model_name.clone(),
        embedding_dim: prior.header().embedding_dim,
        created_at: unix_now(),
    };
    write_store(data_dir, &header, &records, &rows, &new_cache)?;
    stats.rows_written = rows.len();
    progress.emit(&ProgressEvent::StoreWritten { rows: rows.len() });
    stats.elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(stats)
}

/// Deterministic generation id over the indexed content, so an unchanged
/// tree reproduces an identical id (only `created_at` varies).
fn generation_id(model: &str, records: &[ChunkMeta]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    for r in records {
        hasher.update(r.path.as_bytes());
        hasher.update(r.content_hash.as_bytes());
        hasher.update(r.chunk_index.to_le_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("gen-{}", &digest[..16])
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
