use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use crate::progress::CancelToken;

/// Where a source root came from. Engine rows and project rows can be
/// searched separately at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Engine,
    Project,
}

#[derive(Debug, Clone)]
pub struct SourceRoot {
    pub path: PathBuf,
    pub origin: Origin,
}

/// Discovery accepts any mix of root directories, a roots file (one
/// directory per line, optional `engine`/`project` prefix, `#` comments)
/// and an explicit file list. All candidates pass the same filters.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryInput {
    pub roots: Vec<SourceRoot>,
    pub roots_file: Option<PathBuf>,
    pub files: Vec<PathBuf>,
}

impl DiscoveryInput {
    pub fn single_root(path: impl Into<PathBuf>, origin: Origin) -> Self {
        Self {
            roots: vec![SourceRoot {
                path: path.into(),
                origin,
            }],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub abs_path: PathBuf,
    pub origin: Origin,
    pub bytes: u64,
}

// ---------------------------------------------------------------------------
// Hierarchical ignore rules
// ---------------------------------------------------------------------------

/// Compiled `.indexignore` rules from the declared tiers (cwd, each root,
/// user home) — the only places rule files are read from; rule files in
/// nested directories are not consulted. Plain names and globs only, and
/// there is no un-ignore syntax: a `!` prefix carries no meaning, later
/// tiers only add exclusions.
#[derive(Debug, Default)]
struct IgnoreRules {
    /// Plain names: match any directory component of a candidate path.
    names: HashSet<String>,
    /// Glob patterns: match the candidate file name.
    patterns: Vec<glob::Pattern>,
}

impl IgnoreRules {
    fn load(tiers: &[PathBuf], ignore_file_name: &str) -> Self {
        let mut rules = Self::default();
        let mut seen = HashSet::new();
        for tier_dir in tiers {
            let file = tier_dir.join(ignore_file_name);
            if !seen.insert(file.clone()) {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&file) else {
                continue;
            };
            debug!("loading ignore rules from {}", file.display());
            rules.add_lines(&text);
        }
        rules
    }

    fn add_lines(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.contains(['*', '?', '[']) {
                match glob::Pattern::new(line) {
                    Ok(p) => self.patterns.push(p),
                    Err(e) => warn!("bad ignore pattern {line:?}: {e}"),
                }
            } else {
                self.names.insert(line.trim_matches('/').to_string());
            }
        }
    }

    fn matches(&self, path: &Path) -> bool {
        if path.components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|name| self.names.contains(name))
        }) {
            return true;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if self.patterns.iter().any(|p| p.matches(name)) {
                return true;
            }
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Candidate filter (three layers, applied in order)
// ---------------------------------------------------------------------------

struct CandidateFilter {
    extensions: Vec<String>,
    dir_exclusions: HashSet<String>,
    file_patterns: Vec<glob::Pattern>,
    ignore: IgnoreRules,
    max_file_bytes: u64,
}

impl CandidateFilter {
    fn new(cfg: &DiscoveryConfig, ignore: IgnoreRules) -> Self {
        let mut extensions: Vec<String> =
            cfg.extensions.iter().map(|e| e.to_lowercase()).collect();
        if cfg.include_docs {
            extensions.push(".md".into());
            extensions.push(".txt".into());
        }
        let file_patterns = cfg
            .file_exclusions
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("bad file exclusion pattern {p:?}: {e}");
                    None
                }
            })
            .collect();
        Self {
            extensions,
            dir_exclusions: cfg.dir_exclusions.iter().cloned().collect(),
            file_patterns,
            ignore,
            max_file_bytes: cfg.max_file_bytes,
        }
    }

    /// Extension whitelist, then directory exclusions, then file patterns,
    /// then ignore rules. Returns the rejection reason for logging.
    fn reject_reason(&self, path: &Path) -> Option<&'static str> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let lower = name.to_lowercase();
        if !self.extensions.iter().any(|ext| lower.ends_with(ext)) {
            return Some("extension not admitted");
        }
        if path.components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|comp| self.dir_exclusions.contains(comp))
        }) {
            return Some("excluded directory");
        }
        if self.file_patterns.iter().any(|p| p.matches(name)) {
            return Some("excluded file pattern");
        }
        if self.ignore.matches(path) {
            return Some("ignore rule");
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Enumerate candidate source files under the configured inputs, in root
/// order then path order, deduplicated. Unreadable directories are skipped
/// with a warning; the run only fails when zero files survive across all
/// inputs.
pub fn discover(
    input: &DiscoveryInput,
    cfg: &DiscoveryConfig,
    cancel: &CancelToken,
) -> Result<Vec<DiscoveredFile>> {
    let mut roots = input.roots.clone();
    if let Some(roots_file) = &input.roots_file {
        roots.extend(parse_roots_file(roots_file)?);
    }

    let mut tier_dirs: Vec<PathBuf> = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        tier_dirs.push(cwd);
    }
    tier_dirs.extend(roots.iter().map(|r| r.path.clone()));
    if let Some(home) = dirs::home_dir() {
        tier_dirs.push(home);
    }
    let ignore = IgnoreRules::load(&tier_dirs, &cfg.ignore_file_name);
    let filter = CandidateFilter::new(cfg, ignore);

    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut out: Vec<DiscoveredFile> = Vec::new();

    for root in &roots {
        cancel.checkpoint()?;
        let mut batch = walk_root(root, &filter, cancel)?;
        batch.sort_by(|a, b| a.abs_path.cmp(&b.abs_path));
        for entry in batch {
            if seen.insert(entry.abs_path.clone()) {
                out.push(entry);
            }
        }
    }

    for file in &input.files {
        cancel.checkpoint()?;
        let abs = absolutize(file);
        if let Some(reason) = filter.reject_reason(&abs) {
            debug!("skipping {}: {reason}", abs.display());
            continue;
        }
        let bytes = match std::fs::metadata(&abs) {
            Ok(m) if m.is_file() => m.len(),
            Ok(_) => continue,
            Err(e) => {
                warn!("cannot stat {}: {e}", abs.display());
                continue;
            }
        };
        if !admit_size(&abs, bytes, filter.max_file_bytes) {
            continue;
        }
        let origin = roots
            .iter()
            .find(|r| abs.starts_with(&r.path))
            .map(|r| r.origin)
            .unwrap_or(Origin::Project);
        if seen.insert(abs.clone()) {
            out.push(DiscoveredFile {
                abs_path: abs,
                origin,
                bytes,
            });
        }
    }

    if out.is_empty() {
        return Err(Error::EmptyDiscovery);
    }
    Ok(out)
}

fn walk_root(
    root: &SourceRoot,
    filter: &CandidateFilter,
    cancel: &CancelToken,
) -> Result<Vec<DiscoveredFile>> {
    let mut entries = Vec::new();
    // Symlinks are never followed: avoids cycles and surprise scope. The
    // walker applies no ignore grammar of its own; every exclusion goes
    // through the candidate filter.
    let walker = WalkBuilder::new(&root.path)
        .standard_filters(false)
        .follow_links(false)
        .build();

    for item in walker {
        cancel.checkpoint()?;
        let dent = match item {
            Ok(d) => d,
            Err(e) => {
                warn!("discovery error under {}: {e}", root.path.display());
                continue;
            }
        };
        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let abs_path = absolutize(dent.path());
        if let Some(reason) = filter.reject_reason(&abs_path) {
            debug!("skipping {}: {reason}", abs_path.display());
            continue;
        }
        let bytes = match std::fs::metadata(&abs_path) {
            Ok(m) => m.len(),
            Err(e) => {
                warn!("cannot stat {}: {e}", abs_path.display());
                continue;
            }
        };
        if !admit_size(&abs_path, bytes, filter.max_file_bytes) {
            continue;
        }
        entries.push(DiscoveredFile {
            abs_path,
            origin: root.origin,
            bytes,
        });
    }
    Ok(entries)
}

fn admit_size(path: &Path, bytes: u64, max: u64) -> bool {
    if bytes == 0 {
        debug!("skipping {}: empty file", path.display());
        return false;
    }
    if bytes > max {
        warn!(
            "skipping {}: {bytes} bytes exceeds max_file_bytes ({max})",
            path.display()
        );
        return false;
    }
    true
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn parse_roots_file(path: &Path) -> Result<Vec<SourceRoot>> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut roots = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (origin, rest) = if let Some(rest) = line.strip_prefix("engine ") {
            (Origin::Engine, rest)
        } else if let Some(rest) = line.strip_prefix("project ") {
            (Origin::Project, rest)
        } else {
            (Origin::Project, line)
        };
        roots.push(SourceRoot {
            path: PathBuf::from(rest.trim()),
            origin,
        });
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use std::fs;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn discover_under(dir: &Path, cfg: &DiscoveryConfig) -> Vec<DiscoveredFile> {
        let input = DiscoveryInput::single_root(dir, Origin::Project);
        discover(&input, cfg, &CancelToken::new()).unwrap()
    }

    #[test]
    fn extension_whitelist_admits_cpp_family_only() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "Source/Hit.cpp", "int x;");
        write(tmp.path(), "Source/Hit.h", "struct FHit {};");
        write(tmp.path(), "Source/readme.md", "# docs");
        write(tmp.path(), "Source/build.log", "noise");

        let found = discover_under(tmp.path(), &DiscoveryConfig::default());
        let names: Vec<_> = found
            .iter()
            .map(|f| f.abs_path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["Hit.cpp", "Hit.h"]);
    }

    #[test]
    fn include_docs_admits_markdown() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "readme.md", "# docs");
        write(tmp.path(), "a.cpp", "int x;");

        let cfg = DiscoveryConfig {
            include_docs: true,
            ..Default::default()
        };
        let found = discover_under(tmp.path(), &cfg);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn default_dir_exclusions_apply() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "Intermediate/gen.cpp", "int x;");
        write(tmp.path(), "Binaries/stub.cpp", "int x;");
        write(tmp.path(), "Source/Real.cpp", "int x;");

        let found = discover_under(tmp.path(), &DiscoveryConfig::default());
        assert_eq!(found.len(), 1);
        assert!(found[0].abs_path.ends_with("Source/Real.cpp"));
    }

    #[test]
    fn generated_headers_are_excluded_by_pattern() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "Hit.generated.h", "// generated");
        write(tmp.path(), "Hit.h", "struct FHit {};");

        let found = discover_under(tmp.path(), &DiscoveryConfig::default());
        assert_eq!(found.len(), 1);
        assert!(found[0].abs_path.ends_with("Hit.h"));
    }

    #[test]
    fn indexignore_plain_name_matches_components_anywhere() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), ".indexignore", "# skip third party\nThirdParty\n*Test*.cpp\n");
        write(tmp.path(), "Deep/ThirdParty/lib.cpp", "int x;");
        write(tmp.path(), "Deep/MyTest.cpp", "int x;");
        write(tmp.path(), "Deep/Main.cpp", "int x;");

        let found = discover_under(tmp.path(), &DiscoveryConfig::default());
        assert_eq!(found.len(), 1);
        assert!(found[0].abs_path.ends_with("Deep/Main.cpp"));
    }

    #[test]
    fn nested_ignore_files_and_negation_are_inert() {
        let tmp = tempfile::tempdir().unwrap();
        // Rule files are read from the declared tiers only, and `!` is not
        // an un-ignore marker.
        write(
            tmp.path(),
            ".indexignore",
            "Generated\n*Excluded*.cpp\n!*Excluded*.cpp\n",
        );
        write(tmp.path(), "Deep/.indexignore", "Keep.cpp\n");
        write(tmp.path(), "Deep/Keep.cpp", "int x;");
        write(tmp.path(), "Deep/Excluded.cpp", "int x;");
        write(tmp.path(), "Deep/Generated/out.cpp", "int x;");

        let found = discover_under(tmp.path(), &DiscoveryConfig::default());
        let names: Vec<_> = found
            .iter()
            .map(|f| f.abs_path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        // The nested rule file is not consulted, so Keep.cpp survives; the
        // `!` line does not resurrect Excluded.cpp.
        assert_eq!(names, vec!["Keep.cpp"]);
    }

    #[test]
    fn oversize_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "big.cpp", &"x".repeat(4096));
        write(tmp.path(), "small.cpp", "int x;");

        let cfg = DiscoveryConfig {
            max_file_bytes: 1024,
            ..Default::default()
        };
        let found = discover_under(tmp.path(), &cfg);
        assert_eq!(found.len(), 1);
        assert!(found[0].abs_path.ends_with("small.cpp"));
    }

    #[test]
    fn empty_discovery_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let input = DiscoveryInput::single_root(tmp.path(), Origin::Engine);
        let err = discover(&input, &DiscoveryConfig::default(), &CancelToken::new());
        assert!(matches!(err, Err(Error::EmptyDiscovery)));
    }

    #[test]
    fn explicit_files_pass_the_same_filters() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "loose.cpp", "int x;");
        write(tmp.path(), "loose.log", "noise");

        let input = DiscoveryInput {
            files: vec![tmp.path().join("loose.cpp"), tmp.path().join("loose.log")],
            ..Default::default()
        };
        let found = discover(&input, &DiscoveryConfig::default(), &CancelToken::new()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].origin, Origin::Project);
    }

    #[test]
    fn duplicate_roots_deduplicate() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.cpp", "int x;");
        let input = DiscoveryInput {
            roots: vec![
                SourceRoot {
                    path: tmp.path().to_path_buf(),
                    origin: Origin::Engine,
                },
                SourceRoot {
                    path: tmp.path().to_path_buf(),
                    origin: Origin::Project,
                },
            ],
            ..Default::default()
        };
        let found = discover(&input, &DiscoveryConfig::default(), &CancelToken::new()).unwrap();
        assert_eq!(found.len(), 1);
        // First root wins the origin.
        assert_eq!(found[0].origin, Origin::Engine);
    }

    #[test]
    fn cancellation_surfaces_from_discovery() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.cpp", "int x;");
        let token = CancelToken::new();
        token.cancel();
        let input = DiscoveryInput::single_root(tmp.path(), Origin::Project);
        let err = discover(&input, &DiscoveryConfig::default(), &token);
        assert!(matches!(err, Err(Error::Cancelled)));
    }
}
