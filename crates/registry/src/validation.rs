//! Invariant validation applied at upsert time.
//!
//! Field checks are synchronous; reference existence is resolved by the
//! caller (it needs store access) from the list this module produces, so
//! the whole pass stays O(#refs) per symbol.

use sz_domain::domain::Domain;
use sz_domain::symbol::{is_valid_substrate, Symbol, SymbolKind};
use sz_domain::{Error, Result};

fn invalid(reason: impl Into<String>, field: impl Into<String>) -> Error {
    Error::InvalidSymbol {
        reason: reason.into(),
        field: field.into(),
    }
}

/// Validate everything that does not require store access.
pub fn validate_fields(symbol: &Symbol, domain: &Domain) -> Result<()> {
    if symbol.id.trim().is_empty() {
        return Err(invalid("id must not be empty", "id"));
    }
    if symbol.name.trim().is_empty() {
        return Err(invalid("name must not be empty", "name"));
    }
    if symbol.symbol_domain != domain.id {
        return Err(invalid(
            format!(
                "symbol_domain {} does not match domain {}",
                symbol.symbol_domain, domain.id
            ),
            "symbol_domain",
        ));
    }
    for value in &symbol.facets.substrate {
        if !is_valid_substrate(value) {
            return Err(invalid(
                format!("{value} is not in the substrate enum"),
                "facets.substrate",
            ));
        }
    }
    match symbol.kind {
        SymbolKind::Lattice => {
            if symbol.lattice.is_none() {
                return Err(invalid("lattice symbols require a lattice record", "lattice"));
            }
        }
        SymbolKind::Persona => {
            if symbol.persona.is_none() {
                return Err(invalid("persona symbols require a persona record", "persona"));
            }
        }
        SymbolKind::Data => {
            if symbol.data.is_none() {
                return Err(invalid("data symbols require a data record", "data"));
            }
        }
        SymbolKind::Pattern => {}
    }
    Ok(())
}

/// The referenced ids that must exist (deduplicated, self-references
/// excluded — a symbol may link itself).
pub fn references_to_check(symbol: &Symbol) -> Vec<String> {
    let mut refs: Vec<String> = symbol
        .references()
        .into_iter()
        .filter(|r| *r != symbol.id)
        .map(String::from)
        .collect();
    refs.sort();
    refs.dedup();
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use sz_domain::symbol::{Facets, LatticeRecord};

    fn domain() -> Domain {
        Domain {
            id: "d1".into(),
            name: "d".into(),
            description: String::new(),
            invariants: vec![],
            enabled: true,
            read_only: false,
            owner_user_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn symbol() -> Symbol {
        Symbol {
            id: "s1".into(),
            kind: SymbolKind::Pattern,
            name: "sym".into(),
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
    fn accepts_minimal_pattern() {
        assert!(validate_fields(&symbol(), &domain()).is_ok());
    }

    #[test]
    fn rejects_bad_substrate_with_field_path() {
        let mut s = symbol();
        s.facets.substrate = vec!["text".into(), "quantum".into()];
        let err = validate_fields(&s, &domain()).unwrap_err();
        match err {
            Error::InvalidSymbol { field, .. } => assert_eq!(field, "facets.substrate"),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn rejects_domain_mismatch() {
        let mut s = symbol();
        s.symbol_domain = "other".into();
        assert!(validate_fields(&s, &domain()).is_err());
    }

    #[test]
    fn lattice_requires_record() {
        let mut s = symbol();
        s.kind = SymbolKind::Lattice;
        assert!(validate_fields(&s, &domain()).is_err());
        s.lattice = Some(LatticeRecord::default());
        assert!(validate_fields(&s, &domain()).is_ok());
    }

    #[test]
    fn reference_list_is_deduplicated_and_skips_self() {
        let mut s = symbol();
        s.linked_patterns = vec!["b".into(), "b".into(), "s1".into(), "a".into()];
        assert_eq!(references_to_check(&s), vec!["a", "b"]);
    }
}
