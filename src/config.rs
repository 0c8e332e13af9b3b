use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Default embedding model. Recorded in the store header so a reader can
/// refuse a store built with a different model.
pub const DEFAULT_MODEL: &str = "microsoft/unixcoder-base";

/// Controls file discovery (what gets indexed).
///
/// Note: hierarchical ignore files named [`DiscoveryConfig::ignore_file_name`]
/// are always honoured on top of these settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// File extensions admitted to the index (with leading dot).
    pub extensions: Vec<String>,
    /// Also admit documentation files (`.md`, `.txt`).
    pub include_docs: bool,
    /// Files larger than this are skipped with a logged reason.
    pub max_file_bytes: u64,
    /// Directory *names* skipped anywhere in the tree, compared against
    /// path components.
    pub dir_exclusions: Vec<String>,
    /// Glob patterns matched against file names (e.g. `*Test*.cpp`).
    pub file_exclusions: Vec<String>,
    /// Name of the per-directory ignore file.
    pub ignore_file_name: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            extensions: [".cpp", ".h", ".hpp", ".inl", ".cs"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            include_docs: false,
            max_file_bytes: 10 * 1024 * 1024,
            dir_exclusions: [
                "Intermediate",
                "Binaries",
                "DerivedDataCache",
                "Saved",
                ".git",
                ".vs",
                ".vscode",
                "__pycache__",
                "node_modules",
                "obj",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            file_exclusions: vec!["*.generated.h".to_string()],
            ignore_file_name: ".indexignore".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk length in chars when structure-aware splitting is on.
    pub chunk_size: usize,
    /// Chunk length for the character-only fallback.
    pub fallback_chunk_size: usize,
    /// Overlap between consecutive chunks, in chars.
    pub chunk_overlap: usize,
    /// Prefer C++ boundaries (declarations, UE macros, top-level braces)
    /// over raw character offsets.
    pub structure_aware: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2000,
            fallback_chunk_size: 1500,
            chunk_overlap: 200,
            structure_aware: true,
        }
    }
}

/// `auto` probes for an accelerator and falls back to CPU; `on`/`off` force
/// the choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorMode {
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// HuggingFace model repo ID.
    pub model: String,
    /// Expected embedding dimension; validated against the store on open.
    pub dim: usize,
    pub accelerator: AcceleratorMode,
    /// Starting batch size for the adaptive encoder loop.
    pub initial_batch_size: usize,
    /// Floor for adaptive shrinking.
    pub min_batch_size: usize,
    /// Shrink attempts before the engine tears down the accelerator and
    /// re-encodes on CPU.
    pub max_batch_shrinks: usize,
    /// Tokeniser hard cap for a single input.
    pub max_tokens: usize,
    /// Subtracted from `max_tokens` before encoding. Defends against
    /// off-by-one length conditions in some accelerator kernels.
    pub token_safety_buffer: usize,
    /// Chars-per-token heuristic used for truncation; static-embedding
    /// backends expose no tokenizer.
    pub chars_per_token: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            dim: 768,
            accelerator: AcceleratorMode::Auto,
            initial_batch_size: 16,
            min_batch_size: 1,
            max_batch_shrinks: 4,
            max_tokens: 512,
            token_safety_buffer: 10,
            chars_per_token: 4,
        }
    }
}

/// Score multipliers applied on top of cosine similarity.
///
/// The defaults were tuned against the default model and are kept as the
/// reproduction baseline; override the struct to recalibrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleWeights {
    /// Entity name appears in the path stem.
    pub path_match: f32,
    /// Definition query and the chunk is a header.
    pub header_priority: f32,
    /// Definition query and the chunk is an implementation file.
    pub impl_penalty: f32,
    /// Target entity known but absent from the chunk's entity set.
    pub cooccurrence_penalty: f32,
    /// Chunk mentions more than three entities.
    pub rich_chunk: f32,
    /// Target entity present in the chunk's entity set.
    pub entity_boost: f32,
    /// Any UE macro flag set on the chunk.
    pub macro_boost: f32,
}

impl Default for RuleWeights {
    fn default() -> Self {
        Self {
            path_match: 3.0,
            header_priority: 2.5,
            impl_penalty: 0.5,
            cooccurrence_penalty: 0.1,
            rich_chunk: 1.3,
            entity_boost: 1.2,
            macro_boost: 1.15,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub discovery: DiscoveryConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub rules: RuleWeights,
    /// Drop rows for files that vanished between incremental rebuilds.
    /// Off by default: stale rows are filtered against current discovery at
    /// query time, and `compact` removes them explicitly.
    pub prune_missing_on_incremental: bool,
}

impl SearchConfig {
    /// Reject configurations that would corrupt a store or wedge the
    /// encoder before any I/O happens.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dim == 0 {
            return Err(Error::Config("embedding.dim must be non-zero".into()));
        }
        if self.embedding.min_batch_size == 0 {
            return Err(Error::Config("embedding.min_batch_size must be >= 1".into()));
        }
        if self.embedding.initial_batch_size < self.embedding.min_batch_size {
            return Err(Error::Config(
                "embedding.initial_batch_size must be >= min_batch_size".into(),
            ));
        }
        if self.embedding.max_tokens <= self.embedding.token_safety_buffer {
            return Err(Error::Config(
                "embedding.max_tokens must exceed token_safety_buffer".into(),
            ));
        }
        if self.chunking.chunk_size == 0 || self.chunking.fallback_chunk_size == 0 {
            return Err(Error::Config("chunking sizes must be non-zero".into()));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(Error::Config(
                "chunking.chunk_overlap must be smaller than chunk_size".into(),
            ));
        }
        if self.discovery.extensions.is_empty() && !self.discovery.include_docs {
            return Err(Error::Config("discovery.extensions is empty".into()));
        }
        Ok(())
    }
}

/// Load `.uequery.json` from the project root, falling back to defaults on
/// absence or parse failure.
pub fn load_config(repo_root: &Path) -> SearchConfig {
    let primary = repo_root.join(".uequery.json");

    let Ok(text) = std::fs::read_to_string(&primary) else {
        return SearchConfig::default();
    };

    serde_json::from_str::<SearchConfig>(&text).unwrap_or_else(|e| {
        tracing::warn!("failed to parse {}: {e}; using defaults", primary.display());
        SearchConfig::default()
    })
}
