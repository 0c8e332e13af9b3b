use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of a detected entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Struct,
    Class,
    Enum,
    Function,
    Delegate,
}

/// Metadata attached to a chunk right after it is cut. All fields are
/// additive: a chunk stored without enrichment still searches, the
/// enrichment-dependent boosts just become no-ops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub entities: BTreeSet<String>,
    pub entity_types: BTreeSet<EntityKind>,
    pub has_uproperty: bool,
    pub has_uclass: bool,
    pub has_ufunction: bool,
    pub has_ustruct: bool,
    pub has_uenum: bool,
}

fn ue_ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[FUAIE][A-Z][A-Za-z0-9_]*\b").unwrap())
}

fn declared_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(struct|class|enum(?:\s+class)?)\s+(?:[A-Z0-9_]+_API\s+)?([A-Za-z_]\w*)")
            .unwrap()
    })
}

fn function_def_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:[\w:<>\*&]+\s+)+(?:[A-Za-z_]\w*::)?[A-Za-z_]\w*\s*\(").unwrap()
    })
}

fn delegate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bDECLARE_\w*DELEGATE\w*\b").unwrap())
}

fn macro_re(name: &str) -> Regex {
    Regex::new(&format!(r"\b{name}\s*\(")).unwrap()
}

struct MacroRes {
    uproperty: Regex,
    uclass: Regex,
    ufunction: Regex,
    ustruct: Regex,
    uenum: Regex,
}

fn macro_res() -> &'static MacroRes {
    static RES: OnceLock<MacroRes> = OnceLock::new();
    RES.get_or_init(|| MacroRes {
        uproperty: macro_re("UPROPERTY"),
        uclass: macro_re("UCLASS"),
        ufunction: macro_re("UFUNCTION"),
        ustruct: macro_re("USTRUCT"),
        uenum: macro_re("UENUM"),
    })
}

/// Scan one chunk's text for UE-convention identifiers, declared types,
/// delegate macros and reflection macros.
pub fn enrich_chunk(text: &str) -> Enrichment {
    let mut e = Enrichment::default();

    for m in ue_ident_re().find_iter(text) {
        e.entities.insert(m.as_str().to_string());
    }

    for cap in declared_re().captures_iter(text) {
        let kind = match &cap[1] {
            "struct" => EntityKind::Struct,
            "class" => EntityKind::Class,
            _ => EntityKind::Enum,
        };
        e.entity_types.insert(kind);
        e.entities.insert(cap[2].to_string());
    }

    if delegate_re().is_match(text) {
        e.entity_types.insert(EntityKind::Delegate);
    }

    let macros = macro_res();
    e.has_uproperty = macros.uproperty.is_match(text);
    e.has_uclass = macros.uclass.is_match(text);
    e.has_ufunction = macros.ufunction.is_match(text);
    e.has_ustruct = macros.ustruct.is_match(text);
    e.has_uenum = macros.uenum.is_match(text);

    if e.has_ufunction || function_def_re().is_match(text) {
        e.entity_types.insert(EntityKind::Function);
    }

    e
}

const HEADER_EXTS: &[&str] = &["h", "hpp", "inl"];
const IMPL_EXTS: &[&str] = &["cpp", "c", "cc"];

/// `(is_header, is_implementation)` derived from the file extension.
pub fn file_role(path: &Path) -> (bool, bool) {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    (
        HEADER_EXTS.contains(&ext.as_str()),
        IMPL_EXTS.contains(&ext.as_str()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_struct_declaration_and_macros() {
        let text = r#"
USTRUCT(BlueprintType)
struct ENGINE_API FHitResult
{
    UPROPERTY(BlueprintReadOnly)
    FVector ImpactPoint;
};
"#;
        let e = enrich_chunk(text);
        assert!(e.entities.contains("FHitResult"));
        assert!(e.entities.contains("FVector"));
        assert!(e.entity_types.contains(&EntityKind::Struct));
        assert!(e.has_uproperty);
        assert!(e.has_ustruct);
        assert!(!e.has_uclass);
    }

    #[test]
    fn detects_enum_class_and_uenum() {
        let text = "UENUM(BlueprintType)\nenum class ECollisionChannel : uint8\n{ ECC_WorldStatic };\n";
        let e = enrich_chunk(text);
        assert!(e.entities.contains("ECollisionChannel"));
        assert!(e.entity_types.contains(&EntityKind::Enum));
        assert!(e.has_uenum);
    }

    #[test]
    fn detects_delegate_macro() {
        let text = "DECLARE_DYNAMIC_MULTICAST_DELEGATE_OneParam(FOnHit, const FHitResult&, Hit);\n";
        let e = enrich_chunk(text);
        assert!(e.entity_types.contains(&EntityKind::Delegate));
        assert!(e.entities.contains("FOnHit"));
    }

    #[test]
    fn detects_function_definitions() {
        let text = "void AMyActor::BeginPlay()\n{\n    Super::BeginPlay();\n}\n";
        let e = enrich_chunk(text);
        assert!(e.entity_types.contains(&EntityKind::Function));
        assert!(e.entities.contains("AMyActor"));
    }

    #[test]
    fn plain_prose_enriches_to_nothing() {
        let e = enrich_chunk("just some words, no code here");
        assert!(e.entities.is_empty());
        assert!(e.entity_types.is_empty());
        assert!(!e.has_uproperty);
    }

    #[test]
    fn file_roles_follow_extension() {
        assert_eq!(file_role(Path::new("A.h")), (true, false));
        assert_eq!(file_role(Path::new("A.hpp")), (true, false));
        assert_eq!(file_role(Path::new("A.inl")), (true, false));
        assert_eq!(file_role(Path::new("A.cpp")), (false, true));
        assert_eq!(file_role(Path::new("A.cs")), (false, false));
    }
}
