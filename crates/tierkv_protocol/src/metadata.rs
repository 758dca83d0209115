//! Metadata key scheme.
//!
//! The replication record of key `k` lives in the cluster under the key
//! `__tierkv_metadata__|replication|k` and is sharded like any other key.

/// Prefix shared by every metadata key.
pub const METADATA_PREFIX: &str = "__tierkv_metadata__";

const DELIMITER: char = '|';
const REPLICATION: &str = "replication";

/// Returns the metadata key holding the replication record of `key`.
#[must_use]
pub fn replication_key(key: &str) -> String {
    format!("{METADATA_PREFIX}{DELIMITER}{REPLICATION}{DELIMITER}{key}")
}

/// Returns true if `key` names a metadata record.
#[must_use]
pub fn is_metadata(key: &str) -> bool {
    key.strip_prefix(METADATA_PREFIX)
        .is_some_and(|rest| rest.starts_with(DELIMITER))
}

/// Extracts the data key from a replication metadata key.
#[must_use]
pub fn key_from_metadata(metadata_key: &str) -> Option<&str> {
    metadata_key
        .strip_prefix(METADATA_PREFIX)?
        .strip_prefix(DELIMITER)?
        .strip_prefix(REPLICATION)?
        .strip_prefix(DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_key_round_trip() {
        let meta = replication_key("user|42");
        assert!(is_metadata(&meta));
        assert_eq!(key_from_metadata(&meta), Some("user|42"));
    }

    #[test]
    fn data_keys_are_not_metadata() {
        assert!(!is_metadata("user:1"));
        assert!(!is_metadata("__tierkv_metadata__x"));
        assert_eq!(key_from_metadata("user:1"), None);
    }
}
