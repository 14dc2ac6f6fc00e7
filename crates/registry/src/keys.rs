//! Store key layout for registry state.

pub const DOMAINS_SET: &str = "sz:domains";

pub fn domain_key(id: &str) -> String {
    format!("sz:domain:{id}")
}

/// Per-domain member set of symbol ids.
pub fn domain_symbols_key(id: &str) -> String {
    format!("sz:domain:{id}:symbols")
}

pub fn symbol_key(id: &str) -> String {
    format!("sz:symbol:{id}")
}
