//! Legacy symbol shape migration, applied opportunistically on load.
//!
//! Two historical shapes are unified into `lattice.members`:
//! a top-level `members` array, and `lattice.nodes`.

use serde_json::Value;

/// Rewrite a raw symbol value in place. Returns true when anything
/// changed (caller persists the result).
pub fn migrate_symbol_value(value: &mut Value) -> bool {
    let Some(obj) = value.as_object_mut() else {
        return false;
    };
    let mut changed = false;

    // Top-level `members` → lattice.members.
    if let Some(members) = obj.remove("members") {
        if members.is_array() {
            let lattice = obj
                .entry("lattice")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(lattice_obj) = lattice.as_object_mut() {
                merge_members(lattice_obj, members);
                changed = true;
            }
        }
    }

    // lattice.nodes → lattice.members.
    if let Some(lattice) = obj.get_mut("lattice").and_then(Value::as_object_mut) {
        if let Some(nodes) = lattice.remove("nodes") {
            if nodes.is_array() {
                merge_members(lattice, nodes);
                changed = true;
            }
        }
    }

    changed
}

fn merge_members(lattice: &mut serde_json::Map<String, Value>, incoming: Value) {
    let existing = lattice
        .entry("members")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let (Some(target), Value::Array(items)) = (existing.as_array_mut(), incoming) {
        for item in items {
            if item.is_string() && !target.contains(&item) {
                target.push(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn top_level_members_move_into_lattice() {
        let mut value = json!({
            "id": "s1",
            "kind": "lattice",
            "members": ["a", "b"]
        });
        assert!(migrate_symbol_value(&mut value));
        assert_eq!(value["lattice"]["members"], json!(["a", "b"]));
        assert!(value.get("members").is_none());
    }

    #[test]
    fn lattice_nodes_merge_without_duplicates() {
        let mut value = json!({
            "id": "s1",
            "lattice": { "members": ["a"], "nodes": ["a", "b"] }
        });
        assert!(migrate_symbol_value(&mut value));
        assert_eq!(value["lattice"]["members"], json!(["a", "b"]));
        assert!(value["lattice"].get("nodes").is_none());
    }

    #[test]
    fn modern_shape_is_untouched() {
        let mut value = json!({
            "id": "s1",
            "lattice": { "members": ["a"] }
        });
        assert!(!migrate_symbol_value(&mut value));
    }

    #[test]
    fn migration_is_idempotent() {
        let mut value = json!({
            "id": "s1",
            "members": ["a"],
            "lattice": { "nodes": ["b"] }
        });
        assert!(migrate_symbol_value(&mut value));
        let after_first = value.clone();
        assert!(!migrate_symbol_value(&mut value));
        assert_eq!(value, after_first);
    }
}
