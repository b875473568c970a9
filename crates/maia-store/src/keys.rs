//! Key layout over the single ordered `kv` table.
//!
//! | key                     | value                  |
//! |-------------------------|------------------------|
//! | `mem:<memory-id>`       | memory record (JSON)   |
//! | `ns:<namespace-id>`     | namespace record (JSON)|
//! | `nsn:<name>`            | namespace id           |
//! | `mns:<namespace>:<id>`  | memory id              |

pub(crate) const MEMORY: &str = "mem:";
pub(crate) const NAMESPACE: &str = "ns:";
pub(crate) const NAMESPACE_BY_NAME: &str = "nsn:";
pub(crate) const MEMORY_BY_NAMESPACE: &str = "mns:";

pub(crate) fn memory(id: &str) -> String {
    format!("{MEMORY}{id}")
}

pub(crate) fn namespace(id: &str) -> String {
    format!("{NAMESPACE}{id}")
}

pub(crate) fn namespace_name(name: &str) -> String {
    format!("{NAMESPACE_BY_NAME}{name}")
}

pub(crate) fn membership(namespace: &str, id: &str) -> String {
    format!("{MEMORY_BY_NAMESPACE}{namespace}:{id}")
}

pub(crate) fn membership_prefix(namespace: &str) -> String {
    format!("{MEMORY_BY_NAMESPACE}{namespace}:")
}

/// True when `key` sits directly under `prefix`. Memory ids never contain
/// `:`, so a longer tail belongs to a namespace nested under this one.
pub(crate) fn is_direct_member(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix).is_some_and(|id| !id.contains(':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_do_not_shadow_each_other() {
        // `ns:` must not match `nsn:` keys during a namespace scan.
        assert!(!namespace_name("a").starts_with(NAMESPACE));
        assert!(!membership("t", "x").starts_with(MEMORY));
        assert_eq!(membership("t", "x"), "mns:t:x");
        assert!(membership("t", "x").starts_with(&membership_prefix("t")));
    }

    #[test]
    fn nested_namespace_is_not_a_direct_member() {
        let prefix = membership_prefix("a");
        assert!(is_direct_member(&membership("a", "x"), &prefix));
        assert!(!is_direct_member(&membership("a:b", "x"), &prefix));
    }
}
