use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use uequery::config::load_config;
use uequery::embedder::EmbeddingEngine;
use uequery::engine::{open_store, HybridEngine, Scope};
use uequery::extractor::{extract_definition, TargetKind};
use uequery::intent::analyse_query;
use uequery::progress::{CancelToken, ProgressEvent, ProgressSink};
use uequery::scanner::{DiscoveryInput, Origin, SourceRoot};

#[derive(Debug, Parser)]
#[command(name = "uequery")]
#[command(version)]
#[command(about = "Hybrid source search for Unreal Engine C++ trees")]
struct Cli {
    /// Store directory (defaults to .uequery/ under the current directory).
    #[arg(long, global = true, default_value = ".uequery")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build or refresh the vector store.
    Index {
        /// Engine source roots.
        #[arg(long, value_name = "DIR")]
        engine_root: Vec<PathBuf>,

        /// Project source roots.
        #[arg(long, value_name = "DIR")]
        project_root: Vec<PathBuf>,

        /// File listing additional roots, one per line
        /// (optionally prefixed `engine` or `project`).
        #[arg(long, value_name = "FILE")]
        roots_file: Option<PathBuf>,

        /// Full rebuild instead of an incremental refresh.
        #[arg(long)]
        full: bool,
    },

    /// Run a hybrid query against the store.
    Query {
        text: String,

        #[arg(long, default_value_t = 10)]
        top_k: usize,

        #[arg(long, default_value = "all")]
        scope: Scope,

        /// Overall wall-clock budget in milliseconds.
        #[arg(long)]
        deadline_ms: Option<u64>,
    },

    /// Extract a definition by kind and name.
    Definition {
        /// struct | class | enum | function
        kind: String,
        name: String,

        #[arg(long)]
        fuzzy: bool,
    },

    /// Classify a query without running it.
    Intent { text: String },

    /// Drop rows for files no longer discovered under the given roots.
    Compact {
        #[arg(long, value_name = "DIR")]
        engine_root: Vec<PathBuf>,

        #[arg(long, value_name = "DIR")]
        project_root: Vec<PathBuf>,
    },
}

/// Renders indexing progress on an indicatif bar.
struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} {pos}/{len} files {msg}")
                .expect("static template"),
        );
        Self { bar }
    }
}

impl ProgressSink for BarSink {
    fn emit(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Discovered { files } => self.bar.set_length(*files as u64),
            ProgressEvent::FileChunked { .. }
            | ProgressEvent::FileReused { .. }
            | ProgressEvent::FileSkipped { .. } => self.bar.inc(1),
            ProgressEvent::BatchEncoded { rows, total_rows } => {
                self.bar.set_message(format!("embedding {rows}/{total_rows}"))
            }
            ProgressEvent::StoreWritten { rows } => {
                self.bar.finish_with_message(format!("{rows} rows written"))
            }
        }
    }
}

fn roots(engine: Vec<PathBuf>, project: Vec<PathBuf>) -> Vec<SourceRoot> {
    engine
        .into_iter()
        .map(|path| SourceRoot {
            path,
            origin: Origin::Engine,
        })
        .chain(project.into_iter().map(|path| SourceRoot {
            path,
            origin: Origin::Project,
        }))
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("resolving current directory")?;
    let cfg = load_config(&cwd);
    let cancel = CancelToken::new();

    match cli.command {
        Command::Index {
            engine_root,
            project_root,
            roots_file,
            full,
        } => {
            let sources = DiscoveryInput {
                roots: roots(engine_root, project_root),
                roots_file,
                files: vec![],
            };
            let mut embedder =
                EmbeddingEngine::from_config(&cfg.embedding).context("loading embedding model")?;
            let sink = BarSink::new();
            let stats = if full {
                uequery::indexer::build_store(
                    &cfg,
                    &sources,
                    &cli.data_dir,
                    &mut embedder,
                    &sink,
                    &cancel,
                )
            } else {
                uequery::indexer::incremental_update(
                    &cfg,
                    &sources,
                    &cli.data_dir,
                    &mut embedder,
                    &sink,
                    &cancel,
                )
            }
            .context("indexing failed")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Command::Query {
            text,
            top_k,
            scope,
            deadline_ms,
        } => {
            let mut engine = HybridEngine::open(&cli.data_dir, cfg).context("opening store")?;
            let response = engine.query(
                &text,
                top_k,
                scope,
                None,
                deadline_ms.map(Duration::from_millis),
            );
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Command::Definition { kind, name, fuzzy } => {
            let kind = TargetKind::parse(&kind)
                .with_context(|| format!("unknown kind {kind:?} (struct|class|enum|function)"))?;
            let store = open_store(&cli.data_dir).context("opening store")?;
            let mut paths: Vec<PathBuf> = store
                .records()
                .iter()
                .map(|r| PathBuf::from(&r.path))
                .collect();
            paths.sort();
            paths.dedup();
            let results = extract_definition(&paths, kind, &name, fuzzy);
            println!("{}", serde_json::to_string_pretty(&results)?);
        }

        Command::Intent { text } => {
            let intent = analyse_query(&text);
            println!("{}", serde_json::to_string_pretty(&intent)?);
        }

        Command::Compact {
            engine_root,
            project_root,
        } => {
            let sources = DiscoveryInput {
                roots: roots(engine_root, project_root),
                roots_file: None,
                files: vec![],
            };
            let sink = BarSink::new();
            let stats = uequery::indexer::compact(&cfg, &sources, &cli.data_dir, &sink, &cancel)
                .context("compaction failed")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
