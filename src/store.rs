use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::enrich::{EntityKind, Enrichment};
use crate::error::{Error, Result};
use crate::scanner::Origin;

pub const STORE_VERSION: u32 = 1;

pub const VECTORS_FILE: &str = "vector_store.bin";
pub const META_FILE: &str = "vector_meta.json";
pub const CACHE_FILE: &str = "vector_cache.json";
pub const LOCK_FILE: &str = ".lock";

const VECTORS_MAGIC: &[u8; 4] = b"UEVS";

/// Hex SHA-256 of raw file bytes. The reuse key: identical bytes re-use
/// their rows across rebuilds regardless of timestamps.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Record schema
// ---------------------------------------------------------------------------

/// One persisted row of chunk metadata, index-aligned with the vectors
/// file. Chunk text is not stored; it is recoverable from `path` plus the
/// char range (see [`read_snippet`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMeta {
    pub path: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub char_start: u64,
    pub char_end: u64,
    /// Hex SHA-256 of the whole file as indexed.
    pub content_hash: String,
    pub origin: Origin,
    pub entities: Vec<String>,
    pub entity_types: Vec<EntityKind>,
    pub has_uproperty: bool,
    pub has_uclass: bool,
    pub has_ufunction: bool,
    pub has_ustruct: bool,
    pub has_uenum: bool,
    pub is_header: bool,
    pub is_implementation: bool,
    /// The row was zero-filled because its text failed to encode.
    pub invalid: bool,
}

impl ChunkMeta {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: &Path,
        origin: Origin,
        chunk_index: u32,
        total_chunks: u32,
        char_start: u64,
        char_end: u64,
        content_hash: String,
        enrichment: &Enrichment,
    ) -> Self {
        let (is_header, is_implementation) = crate::enrich::file_role(path);
        Self {
            path: path.to_string_lossy().replace('\\', "/"),
            chunk_index,
            total_chunks,
            char_start,
            char_end,
            content_hash,
            origin,
            entities: enrichment.entities.iter().cloned().collect(),
            entity_types: enrichment.entity_types.iter().copied().collect(),
            has_uproperty: enrichment.has_uproperty,
            has_uclass: enrichment.has_uclass,
            has_ufunction: enrichment.has_ufunction,
            has_ustruct: enrichment.has_ustruct,
            has_uenum: enrichment.has_uenum,
            is_header,
            is_implementation,
            invalid: false,
        }
    }

    pub fn has_any_macro(&self) -> bool {
        self.has_uproperty
            || self.has_uclass
            || self.has_ufunction
            || self.has_ustruct
            || self.has_uenum
    }
}

/// Re-read a chunk's text from its source file. Returns `None` when the
/// file vanished or shrank below the recorded range (stale row).
pub fn read_snippet(meta: &ChunkMeta) -> Option<String> {
    let text = std::fs::read_to_string(&meta.path).ok()?;
    let start = meta.char_start as usize;
    let end = meta.char_end as usize;
    text.get(start..end).map(|s| s.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHeader {
    pub version: u32,
    pub generation_id: String,
    pub model_name: String,
    pub embedding_dim: u32,
    /// Seconds since the Unix epoch at write time.
    pub created_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetaFile {
    header: StoreHeader,
    records: Vec<ChunkMeta>,
}

/// Header of the vectors container, serialized as JSON after the magic.
#[derive(Debug, Serialize, Deserialize)]
struct VectorsHeader {
    n: u64,
    dim: u32,
    dtype: String,
    model_name: String,
    model_digest: String,
}

// ---------------------------------------------------------------------------
// Reuse cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub content_hash: String,
    pub chunk_count: u32,
    pub first_global_index: u32,
}

/// Maps `path → (content_hash, chunk_count, first_global_index)` for the
/// current store generation. Corruption is recoverable: a cache that fails
/// to parse is discarded, forcing a full re-embed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReuseCache {
    pub entries: BTreeMap<String, CacheEntry>,
}

impl ReuseCache {
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(CACHE_FILE);
        let Ok(text) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("reuse cache unreadable ({e}); forcing full re-embed");
            Self::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Writer lock
// ---------------------------------------------------------------------------

/// Exclusive advisory lock on the store directory's sentinel. Held for the
/// whole rebuild; released on drop.
pub struct StoreLock {
    _file: File,
}

impl StoreLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let path = dir.join(LOCK_FILE);
        let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| Error::Locked(dir.to_path_buf()))?;
        Ok(Self { _file: file })
    }
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

/// One open store generation: the vectors file mapped read-only plus the
/// eagerly parsed metadata. Queries against one handle are deterministic;
/// a rebuild renames new files into place and is only observed on reopen.
pub struct VectorStore {
    dir: PathBuf,
    mmap: Mmap,
    body_offset: usize,
    n: usize,
    dim: usize,
    header: StoreHeader,
    records: Vec<ChunkMeta>,
}

impl VectorStore {
    pub fn open(dir: &Path) -> Result<Self> {
        let vec_path = dir.join(VECTORS_FILE);
        let meta_path = dir.join(META_FILE);
        if !vec_path.exists() || !meta_path.exists() {
            return Err(Error::NotFound(dir.to_path_buf()));
        }

        let file = File::open(&vec_path).map_err(|e| Error::io(&vec_path, e))?;
        // Safety: store files are replaced atomically by rename and never
        // truncated in place, so the mapping stays valid for our lifetime.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(&vec_path, e))?;

        if mmap.len() < 12 || &mmap[0..4] != VECTORS_MAGIC {
            return Err(Error::Corrupt("vectors file magic mismatch".into()));
        }
        let container_version = u32::from_le_bytes(mmap[4..8].try_into().unwrap());
        if container_version != STORE_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported vectors container version {container_version}"
            )));
        }
        let header_len = u32::from_le_bytes(mmap[8..12].try_into().unwrap()) as usize;
        let body_offset = 12 + header_len;
        if mmap.len() < body_offset {
            return Err(Error::Corrupt("vectors header truncated".into()));
        }
        let vheader: VectorsHeader = serde_json::from_slice(&mmap[12..body_offset])
            .map_err(|e| Error::Corrupt(format!("vectors header unreadable: {e}")))?;
        if vheader.dtype != "f32" {
            return Err(Error::Corrupt(format!("unsupported dtype {}", vheader.dtype)));
        }
        let n = vheader.n as usize;
        let dim = vheader.dim as usize;
        let expected_body = n
            .checked_mul(dim)
            .and_then(|c| c.checked_mul(4))
            .ok_or_else(|| Error::Corrupt("vectors header overflow".into()))?;
        if mmap.len() - body_offset != expected_body {
            return Err(Error::Corrupt(format!(
                "vectors body is {} bytes, expected {expected_body}",
                mmap.len() - body_offset
            )));
        }

        let meta_text =
            std::fs::read_to_string(&meta_path).map_err(|e| Error::io(&meta_path, e))?;
        let meta: MetaFile = serde_json::from_str(&meta_text)
            .map_err(|e| Error::Corrupt(format!("metadata unreadable: {e}")))?;
        if meta.header.version != STORE_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported store version {}",
                meta.header.version
            )));
        }
        if meta.records.len() != n {
            return Err(Error::Corrupt(format!(
                "{} metadata records for {n} vector rows",
                meta.records.len()
            )));
        }
        if meta.header.embedding_dim as usize != dim {
            return Err(Error::Corrupt(format!(
                "metadata declares dim {}, vectors file has {dim}",
                meta.header.embedding_dim
            )));
        }
        if meta.header.model_name != vheader.model_name {
            return Err(Error::Corrupt(
                "metadata and vectors disagree on the model".into(),
            ));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            mmap,
            body_offset,
            n,
            dim,
            header: meta.header,
            records: meta.records,
        })
    }

    /// Refuse a store built with a different model or dimension than the
    /// caller's configuration.
    pub fn check_model(&self, model_name: &str, dim: usize) -> Result<()> {
        if self.dim != dim {
            return Err(Error::DimMismatch {
                stored: self.dim,
                configured: dim,
            });
        }
        if self.header.model_name != model_name {
            return Err(Error::Corrupt(format!(
                "store was built with model {:?}; configured {model_name:?} — rebuild required",
                self.header.model_name
            )));
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    pub fn records(&self) -> &[ChunkMeta] {
        &self.records
    }

    pub fn record(&self, i: usize) -> &ChunkMeta {
        &self.records[i]
    }

    fn row_bytes(&self, i: usize) -> &[u8] {
        let start = self.body_offset + i * self.dim * 4;
        &self.mmap[start..start + self.dim * 4]
    }

    /// Dot product of row `i` against an L2-normalised query vector.
    /// Rows are stored normalised, so this is cosine similarity.
    pub fn row_dot(&self, i: usize, query: &[f32]) -> f32 {
        self.row_bytes(i)
            .chunks_exact(4)
            .zip(query.iter())
            .map(|(b, q)| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * q)
            .sum()
    }

    /// Decode row `i`. Used to carry reused rows into the next generation.
    pub fn row_vector(&self, i: usize) -> Vec<f32> {
        self.row_bytes(i)
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Write path
// ---------------------------------------------------------------------------

/// Persist one complete store generation atomically: each file is written
/// as `*.new`, fsynced, then renamed over the target. A rebuild that dies
/// half-way leaves the previous generation readable.
pub fn write_store(
    dir: &Path,
    header: &StoreHeader,
    records: &[ChunkMeta],
    rows: &[Vec<f32>],
    cache: &ReuseCache,
) -> Result<()> {
    if records.len() != rows.len() {
        return Err(Error::Corrupt(format!(
            "writer invariant broken: {} records, {} rows",
            records.len(),
            rows.len()
        )));
    }
    let dim = header.embedding_dim as usize;
    std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let vheader = VectorsHeader {
        n: rows.len() as u64,
        dim: header.embedding_dim,
        dtype: "f32".into(),
        model_name: header.model_name.clone(),
        model_digest: content_hash(header.model_name.as_bytes()),
    };
    let header_json = serde_json::to_vec(&vheader)
        .map_err(|e| Error::Corrupt(format!("serializing vectors header: {e}")))?;

    let vec_tmp = dir.join(format!("{VECTORS_FILE}.new"));
    {
        let mut f = File::create(&vec_tmp).map_err(|e| Error::io(&vec_tmp, e))?;
        f.write_all(VECTORS_MAGIC).map_err(|e| Error::io(&vec_tmp, e))?;
        f.write_all(&STORE_VERSION.to_le_bytes())
            .map_err(|e| Error::io(&vec_tmp, e))?;
        f.write_all(&(header_json.len() as u32).to_le_bytes())
            .map_err(|e| Error::io(&vec_tmp, e))?;
        f.write_all(&header_json).map_err(|e| Error::io(&vec_tmp, e))?;
        let mut body = Vec::with_capacity(rows.len() * dim * 4);
        for row in rows {
            if row.len() != dim {
                return Err(Error::Corrupt(format!(
                    "writer invariant broken: row has {} dims, store {dim}",
                    row.len()
                )));
            }
            for v in row {
                body.extend_from_slice(&v.to_le_bytes());
            }
        }
        f.write_all(&body).map_err(|e| Error::io(&vec_tmp, e))?;
        f.sync_all().map_err(|e| Error::io(&vec_tmp, e))?;
    }

    let meta_tmp = dir.join(format!("{META_FILE}.new"));
    {
        let meta = MetaFile {
            header: header.clone(),
            records: records.to_vec(),
        };
        let text = serde_json::to_string(&meta)
            .map_err(|e| Error::Corrupt(format!("serializing metadata: {e}")))?;
        let mut f = File::create(&meta_tmp).map_err(|e| Error::io(&meta_tmp, e))?;
        f.write_all(text.as_bytes()).map_err(|e| Error::io(&meta_tmp, e))?;
        f.sync_all().map_err(|e| Error::io(&meta_tmp, e))?;
    }

    let cache_tmp = dir.join(format!("{CACHE_FILE}.new"));
    {
        let text = serde_json::to_string(cache)
            .map_err(|e| Error::Corrupt(format!("serializing cache: {e}")))?;
        let mut f = File::create(&cache_tmp).map_err(|e| Error::io(&cache_tmp, e))?;
        f.write_all(text.as_bytes()).map_err(|e| Error::io(&cache_tmp, e))?;
        f.sync_all().map_err(|e| Error::io(&cache_tmp, e))?;
    }

    std::fs::rename(&vec_tmp, dir.join(VECTORS_FILE))
        .map_err(|e| Error::io(dir.join(VECTORS_FILE), e))?;
    std::fs::rename(&meta_tmp, dir.join(META_FILE))
        .map_err(|e| Error::io(dir.join(META_FILE), e))?;
    std::fs::rename(&cache_tmp, dir.join(CACHE_FILE))
        .map_err(|e| Error::io(dir.join(CACHE_FILE), e))?;
    Ok(())
}
