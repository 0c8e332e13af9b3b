use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::extractor::TargetKind;

/// How a query should be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Definition,
    Semantic,
    Hybrid,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryIntent {
    pub query_type: QueryType,
    pub entity_type: Option<TargetKind>,
    pub entity_name: Option<String>,
    pub confidence: f32,
    pub enhanced_query: String,
    pub reasoning: String,
}

const DECL_KEYWORDS: &[&str] = &["struct", "class", "enum", "function"];

const STOP_WORDS: &[&str] = &[
    "the", "what", "where", "find", "show", "how", "why", "explain",
];

const HYBRID_HINTS: &[&str] = &[
    "members",
    "fields",
    "properties",
    "methods",
    "parameters",
    "signature",
    "base",
    "inherit",
];

const CONCEPTUAL_HINTS: &[&str] = &[
    "how",
    "why",
    "when",
    "explain",
    "describe",
    "compare",
    "difference",
    "best practice",
    "example",
];

fn ue_ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[FUAIE][A-Z]\w+\b").unwrap())
}

/// Kind implied by a UE naming prefix: `F` structs, `U`/`A`/`I` classes,
/// `E` enums.
fn kind_from_prefix(ident: &str) -> Option<TargetKind> {
    match ident.chars().next()? {
        'F' => Some(TargetKind::Struct),
        'U' | 'A' | 'I' => Some(TargetKind::Class),
        'E' => Some(TargetKind::Enum),
        _ => None,
    }
}

fn kind_suffix(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::Struct => " struct UPROPERTY fields members",
        TargetKind::Class => " class UCLASS UFUNCTION methods members",
        TargetKind::Enum => " enum UENUM values names",
        TargetKind::Function => " function UFUNCTION signature parameters",
    }
}

fn tokens(query: &str) -> Vec<&str> {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .collect()
}

fn significant_word_count(toks: &[&str]) -> usize {
    toks.iter()
        .filter(|t| t.len() > 2)
        .filter(|t| !STOP_WORDS.contains(&t.to_lowercase().as_str()))
        .count()
}

fn is_identifier(token: &str) -> bool {
    token
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
}

/// Pick the entity next to a declaration keyword: the first identifier
/// after it, else the nearest one before it.
fn adjacent_entity<'a>(toks: &[&'a str], keyword_idx: usize) -> Option<&'a str> {
    fn plausible(t: &str) -> bool {
        is_identifier(t)
            && !DECL_KEYWORDS.contains(&t.to_lowercase().as_str())
            && !STOP_WORDS.contains(&t.to_lowercase().as_str())
    }
    toks[keyword_idx + 1..]
        .iter()
        .copied()
        .find(|&t| plausible(t))
        .or_else(|| {
            toks[..keyword_idx]
                .iter()
                .rev()
                .copied()
                .find(|&t| plausible(t))
        })
}

/// Classify a query and extract entity metadata. Rules are tried in order;
/// the first that applies decides the query type.
pub fn analyse_query(query: &str) -> QueryIntent {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return QueryIntent {
            query_type: QueryType::Semantic,
            entity_type: None,
            entity_name: None,
            confidence: 0.0,
            enhanced_query: String::new(),
            reasoning: "empty query".into(),
        };
    }

    let toks = tokens(trimmed);
    let lower = trimmed.to_lowercase();

    // Rule 1: an explicit declaration keyword anywhere in the query.
    if let Some(kw_idx) = toks
        .iter()
        .position(|t| DECL_KEYWORDS.contains(&t.to_lowercase().as_str()))
    {
        let keyword = toks[kw_idx].to_lowercase();
        let kind = TargetKind::parse(&keyword);
        let entity = adjacent_entity(&toks, kw_idx).map(str::to_string);
        let enhanced = match (kind, &entity) {
            (Some(k), Some(_)) => format!("{trimmed}{}", kind_suffix(k)),
            _ => trimmed.to_string(),
        };
        return QueryIntent {
            query_type: QueryType::Definition,
            entity_type: kind,
            entity_name: entity,
            confidence: 0.95,
            enhanced_query: enhanced,
            reasoning: format!("explicit '{keyword}' keyword"),
        };
    }

    let ue_idents: Vec<&str> = ue_ident_re()
        .find_iter(trimmed)
        .map(|m| m.as_str())
        .collect();

    // Rule 2: bare entity lookup — a single UE-convention identifier and
    // almost nothing else.
    if ue_idents.len() == 1 && significant_word_count(&toks) <= 2 {
        let ident = ue_idents[0];
        if let Some(kind) = kind_from_prefix(ident) {
            return QueryIntent {
                query_type: QueryType::Definition,
                entity_type: Some(kind),
                entity_name: Some(ident.to_string()),
                confidence: 0.85,
                enhanced_query: format!("{trimmed}{}", kind_suffix(kind)),
                reasoning: format!("bare lookup of {ident}"),
            };
        }
    }

    // Rule 3: an entity plus a structural hint wants both strategies.
    if let Some(ident) = ue_idents.first() {
        if HYBRID_HINTS
            .iter()
            .any(|h| toks.iter().any(|t| t.eq_ignore_ascii_case(h)))
        {
            let kind = kind_from_prefix(ident);
            let enhanced = match kind {
                Some(k) => format!("{trimmed}{}", kind_suffix(k)),
                None => trimmed.to_string(),
            };
            return QueryIntent {
                query_type: QueryType::Hybrid,
                entity_type: kind,
                entity_name: Some(ident.to_string()),
                confidence: 0.70,
                enhanced_query: enhanced,
                reasoning: format!("{ident} plus structural keyword"),
            };
        }
    }

    // Rule 4: conceptual phrasing is purely semantic.
    if CONCEPTUAL_HINTS.iter().any(|h| {
        if h.contains(' ') {
            lower.contains(h)
        } else {
            toks.iter().any(|t| t.eq_ignore_ascii_case(h))
        }
    }) {
        return QueryIntent {
            query_type: QueryType::Semantic,
            entity_type: None,
            entity_name: None,
            confidence: 0.90,
            enhanced_query: trimmed.to_string(),
            reasoning: "conceptual phrasing".into(),
        };
    }

    // Rule 5: default.
    QueryIntent {
        query_type: QueryType::Semantic,
        entity_type: None,
        entity_name: None,
        confidence: 0.50,
        enhanced_query: trimmed.to_string(),
        reasoning: "no routing signal; defaulting to semantic".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_keyword_routes_to_definition() {
        let intent = analyse_query("struct FHitResult");
        assert_eq!(intent.query_type, QueryType::Definition);
        assert_eq!(intent.entity_type, Some(TargetKind::Struct));
        assert_eq!(intent.entity_name.as_deref(), Some("FHitResult"));
        assert_eq!(intent.confidence, 0.95);
        assert!(intent.enhanced_query.contains("UPROPERTY"));
    }

    #[test]
    fn keyword_before_entity_also_extracts() {
        let intent = analyse_query("show me the FHitResult struct");
        assert_eq!(intent.query_type, QueryType::Definition);
        assert_eq!(intent.entity_name.as_deref(), Some("FHitResult"));
    }

    #[test]
    fn intent_is_stable_under_casing() {
        let a = analyse_query("struct fhitresult");
        let b = analyse_query("STRUCT FHITRESULT");
        let c = analyse_query("Struct FHitResult");
        for intent in [&a, &b, &c] {
            assert_eq!(intent.query_type, QueryType::Definition);
            assert_eq!(intent.entity_type, Some(TargetKind::Struct));
        }
        let norm = |i: &QueryIntent| i.entity_name.as_deref().unwrap().to_lowercase();
        assert_eq!(norm(&a), norm(&b));
        assert_eq!(norm(&b), norm(&c));
    }

    #[test]
    fn bare_entity_lookup_is_a_definition() {
        let intent = analyse_query("FHitResult");
        assert_eq!(intent.query_type, QueryType::Definition);
        assert_eq!(intent.confidence, 0.85);
        assert_eq!(intent.entity_type, Some(TargetKind::Struct));

        let intent = analyse_query("find AMyActor");
        assert_eq!(intent.query_type, QueryType::Definition);
        assert_eq!(intent.entity_type, Some(TargetKind::Class));
    }

    #[test]
    fn hybrid_hint_with_wordy_query_routes_hybrid() {
        let intent = analyse_query("list all members and properties of FHitResult");
        assert_eq!(intent.query_type, QueryType::Hybrid);
        assert_eq!(intent.confidence, 0.70);
        assert_eq!(intent.entity_name.as_deref(), Some("FHitResult"));
    }

    #[test]
    fn conceptual_queries_are_semantic() {
        let intent = analyse_query("how does collision detection work");
        assert_eq!(intent.query_type, QueryType::Semantic);
        assert_eq!(intent.confidence, 0.90);
        assert!(intent.entity_name.is_none());
        // Enhancement leaves semantic queries untouched.
        assert_eq!(intent.enhanced_query, "how does collision detection work");

        let intent = analyse_query("best practice for spawning actors");
        assert_eq!(intent.query_type, QueryType::Semantic);
        assert_eq!(intent.confidence, 0.90);
    }

    #[test]
    fn unclassified_queries_default_to_semantic() {
        let intent = analyse_query("spawning actors at runtime");
        assert_eq!(intent.query_type, QueryType::Semantic);
        assert_eq!(intent.confidence, 0.50);
    }

    #[test]
    fn empty_query_is_semantic_with_zero_confidence() {
        let intent = analyse_query("   ");
        assert_eq!(intent.query_type, QueryType::Semantic);
        assert_eq!(intent.confidence, 0.0);
        assert!(intent.enhanced_query.is_empty());
    }

    #[test]
    fn enum_prefix_maps_to_enum_kind() {
        let intent = analyse_query("ECollisionChannel");
        assert_eq!(intent.entity_type, Some(TargetKind::Enum));
    }
}
