//! Key names and the merge/diff rule for client and room metadata
//! dictionaries, modeled on the original collaborator's `update_dict_and_get_diff`.

use serde_json::{Map, Value};

pub type Metadata = Map<String, Value>;

pub mod client_metadata {
    pub const ID: &str = "id";
    pub const IP: &str = "ip";
    pub const PORT: &str = "port";
    pub const ROOM: &str = "room";
    pub const USERNAME: &str = "username";
}

pub mod room_metadata {
    pub const KEEP_OPEN: &str = "keep_open";
    pub const COMMAND_COUNT: &str = "command_count";
    pub const BYTE_SIZE: &str = "byte_size";
}

/// Merges `source` into `target`, returning the subset of `source` whose
/// effective value actually changed (including brand-new keys). A key
/// present in `source` with a value equal to the one already in `target`
/// contributes nothing to the diff.
pub fn update_dict_and_get_diff(target: &mut Metadata, source: &Metadata) -> Metadata {
    let mut diff = Metadata::new();
    for (key, value) in source {
        if target.get(key) != Some(value) {
            diff.insert(key.clone(), value.clone());
        }
        target.insert(key.clone(), value.clone());
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unchanged_values_produce_no_diff() {
        let mut target = Metadata::new();
        target.insert("username".into(), json!("alice"));

        let mut source = Metadata::new();
        source.insert("username".into(), json!("alice"));

        let diff = update_dict_and_get_diff(&mut target, &source);
        assert!(diff.is_empty());
    }

    #[test]
    fn changed_and_new_keys_appear_in_diff() {
        let mut target = Metadata::new();
        target.insert("username".into(), json!("alice"));

        let mut source = Metadata::new();
        source.insert("username".into(), json!("bob"));
        source.insert("color".into(), json!("blue"));

        let diff = update_dict_and_get_diff(&mut target, &source);
        assert_eq!(diff.get("username"), Some(&json!("bob")));
        assert_eq!(diff.get("color"), Some(&json!("blue")));
        assert_eq!(target.get("username"), Some(&json!("bob")));
    }
}
