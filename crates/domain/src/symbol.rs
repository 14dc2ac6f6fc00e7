//! The symbol model — the atomic unit of the knowledge graph.
//!
//! Symbols are flat records keyed by string id; relationships are arrays
//! of ids (`linked_patterns`, `lattice.members`, `persona.linked_personas`),
//! never embedded values, because the graph is cyclic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The symbol kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Pattern,
    Lattice,
    Persona,
    Data,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Pattern => "pattern",
            SymbolKind::Lattice => "lattice",
            SymbolKind::Persona => "persona",
            SymbolKind::Data => "data",
        }
    }
}

/// Closed enum of facet substrates. The only definition in the codebase;
/// validation checks membership here.
pub const SUBSTRATES: &[&str] = &[
    "text",
    "code",
    "image",
    "audio",
    "video",
    "data",
    "event",
    "signal",
    "state",
    "process",
    "concept",
    "relation",
    "cognitive",
    "symbolic",
    "temporal",
    "social",
    "biological",
    "physical",
    "digital",
    "virtual",
    "abstract",
    "meta",
];

pub fn is_valid_substrate(value: &str) -> bool {
    SUBSTRATES.contains(&value)
}

/// Structured facets of a symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Facets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default)]
    pub gate: Vec<String>,
    #[serde(default)]
    pub substrate: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<String>,
    #[serde(default)]
    pub invariants: Vec<String>,
}

/// Lattice payload: an execution topology over other symbols.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatticeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closure: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
}

/// Persona payload: an activatable role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaRecord {
    #[serde(default)]
    pub recursion_level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default)]
    pub activation_conditions: Vec<String>,
    #[serde(default)]
    pub fallback_behavior: Vec<String>,
    #[serde(default)]
    pub linked_personas: Vec<String>,
}

/// Data payload: sourced, verifiable content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// A content-addressable unit of knowledge.
///
/// `created_at` / `updated_at` use the base64 millisecond wire encoding
/// (see [`crate::stamp`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub id: String,
    pub kind: SymbolKind,
    pub name: String,
    #[serde(default)]
    pub triad: String,
    #[serde(default, rename = "macro")]
    pub macro_phrase: String,
    #[serde(default)]
    pub role: String,
    /// Owning domain id. Must equal the id of the domain it is stored in.
    pub symbol_domain: String,
    /// Optional secondary index key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_tag: Option<String>,
    #[serde(default)]
    pub facets: Facets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<String>,
    #[serde(default)]
    pub activation_conditions: Vec<String>,
    /// Ids of related symbols. May cross domains.
    #[serde(default)]
    pub linked_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lattice: Option<LatticeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<PersonaRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataRecord>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Symbol {
    /// All outbound references of this symbol, in declaration order.
    pub fn references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self.linked_patterns.iter().map(String::as_str).collect();
        if let Some(lattice) = &self.lattice {
            refs.extend(lattice.members.iter().map(String::as_str));
        }
        if let Some(persona) = &self.persona {
            refs.extend(persona.linked_personas.iter().map(String::as_str));
        }
        refs
    }

    /// Substitute `old_id` with `new_id` in every reference array.
    /// Returns true if anything changed.
    pub fn rewrite_reference(&mut self, old_id: &str, new_id: &str) -> bool {
        let mut changed = false;
        for slot in self.linked_patterns.iter_mut() {
            if slot == old_id {
                *slot = new_id.to_owned();
                changed = true;
            }
        }
        if let Some(lattice) = &mut self.lattice {
            for slot in lattice.members.iter_mut() {
                if slot == old_id {
                    *slot = new_id.to_owned();
                    changed = true;
                }
            }
        }
        if let Some(persona) = &mut self.persona {
            for slot in persona.linked_personas.iter_mut() {
                if slot == old_id {
                    *slot = new_id.to_owned();
                    changed = true;
                }
            }
        }
        changed
    }

    /// Drop `id` from every reference array. Returns true if anything changed.
    pub fn remove_reference(&mut self, id: &str) -> bool {
        let mut changed = false;
        let before = self.linked_patterns.len();
        self.linked_patterns.retain(|r| r != id);
        changed |= self.linked_patterns.len() != before;
        if let Some(lattice) = &mut self.lattice {
            let before = lattice.members.len();
            lattice.members.retain(|r| r != id);
            changed |= lattice.members.len() != before;
        }
        if let Some(persona) = &mut self.persona {
            let before = persona.linked_personas.len();
            persona.linked_personas.retain(|r| r != id);
            changed |= persona.linked_personas.len() != before;
        }
        changed
    }

    /// The text document indexed for semantic search.
    pub fn index_document(&self) -> String {
        let mut doc = format!(
            "{} {} {} {}",
            self.name, self.triad, self.macro_phrase, self.role
        );
        if let Some(function) = &self.facets.function {
            doc.push(' ');
            doc.push_str(function);
        }
        for condition in &self.activation_conditions {
            doc.push(' ');
            doc.push_str(condition);
        }
        doc.trim().to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol(id: &str) -> Symbol {
        Symbol {
            id: id.into(),
            kind: SymbolKind::Pattern,
            name: format!("sym {id}"),
            triad: String::new(),
            macro_phrase: String::new(),
            role: String::new(),
            symbol_domain: "d1".into(),
            symbol_tag: None,
            facets: Facets::default(),
            failure_mode: None,
            activation_conditions: vec![],
            linked_patterns: vec![],
            lattice: None,
            persona: None,
            data: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn references_cover_all_three_arrays() {
        let mut s = symbol("a");
        s.linked_patterns = vec!["b".into()];
        s.lattice = Some(LatticeRecord {
            members: vec!["c".into()],
            ..Default::default()
        });
        s.persona = Some(PersonaRecord {
            linked_personas: vec!["d".into()],
            ..Default::default()
        });
        assert_eq!(s.references(), vec!["b", "c", "d"]);
    }

    #[test]
    fn rewrite_reference_touches_every_array() {
        let mut s = symbol("a");
        s.linked_patterns = vec!["x".into(), "y".into()];
        s.lattice = Some(LatticeRecord {
            members: vec!["x".into()],
            ..Default::default()
        });
        assert!(s.rewrite_reference("x", "z"));
        assert_eq!(s.linked_patterns, vec!["z", "y"]);
        assert_eq!(s.lattice.unwrap().members, vec!["z"]);
    }

    #[test]
    fn rewrite_reference_noop_when_absent() {
        let mut s = symbol("a");
        s.linked_patterns = vec!["y".into()];
        assert!(!s.rewrite_reference("x", "z"));
    }

    #[test]
    fn remove_reference_strips_everywhere() {
        let mut s = symbol("a");
        s.linked_patterns = vec!["x".into(), "y".into()];
        s.persona = Some(PersonaRecord {
            linked_personas: vec!["x".into()],
            ..Default::default()
        });
        assert!(s.remove_reference("x"));
        assert_eq!(s.linked_patterns, vec!["y"]);
        assert!(s.persona.unwrap().linked_personas.is_empty());
    }

    #[test]
    fn substrate_enum_is_closed() {
        assert!(is_valid_substrate("symbolic"));
        assert!(is_valid_substrate("meta"));
        assert!(!is_valid_substrate("quantum"));
        assert!(!is_valid_substrate(""));
    }

    #[test]
    fn kind_serializes_lowercase() {
        let json = serde_json::to_string(&SymbolKind::Lattice).unwrap();
        assert_eq!(json, "\"lattice\"");
    }

    #[test]
    fn macro_field_uses_wire_name() {
        let mut s = symbol("a");
        s.macro_phrase = "collapse".into();
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["macro"], "collapse");
    }
}
