pub mod chunker;
pub mod config;
pub mod embedder;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod extractor;
pub mod indexer;
pub mod intent;
pub mod progress;
pub mod scanner;
pub mod search;
pub mod store;

pub use config::{load_config, SearchConfig};
pub use embedder::{EmbeddingEngine, TextEncoder};
pub use engine::{open_store, CombinedResult, HybridEngine, QueryResponse, Scope};
pub use error::{Error, Result};
pub use extractor::{extract_definition, DefinitionResult, TargetKind};
pub use indexer::{build_store, compact, incremental_update, Stats};
pub use intent::{analyse_query, QueryIntent, QueryType};
pub use progress::{CancelToken, NullSink, ProgressEvent, ProgressSink};
pub use scanner::{discover, DiscoveryInput, Origin, SourceRoot};
pub use search::{semantic_search, SearchFilters, SemanticResult};
pub use store::VectorStore;
