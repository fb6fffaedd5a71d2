//! Path and name helpers for `/`-separated, case-sensitive tree paths.

/// Split a path into components, ignoring the leading `/`.
/// `"/"` yields no components.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Join a parent path and a child name without doubling separators.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Whether a fragment-local name denotes removal, and the effective name.
///
/// A leading `-` marks the property or child for removal; for names with a
/// unit-address suffix the marker applies to the local-name part only.
pub fn removal_name(name: &str) -> (bool, &str) {
    match name.strip_prefix('-') {
        Some(stripped) => (true, stripped),
        None => (false, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_skip_empty() {
        let parts: Vec<_> = components("/root/a").collect();
        assert_eq!(parts, ["root", "a"]);
        assert_eq!(components("/").count(), 0);
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("/", "root"), "/root");
        assert_eq!(join("/root", "a"), "/root/a");
    }

    #[test]
    fn removal_marker() {
        assert_eq!(removal_name("-compatible"), (true, "compatible"));
        assert_eq!(removal_name("compatible"), (false, "compatible"));
        // the marker sits on the local-name part; unit suffixes ride along
        assert_eq!(removal_name("-serial@1000"), (true, "serial@1000"));
    }
}
