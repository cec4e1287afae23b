//! Canonical storage-relative paths.
//!
//! Every path that enters the cache goes through [`normalize`] first. Canonical
//! paths have no leading or trailing slash, no empty segments, and are in
//! Unicode NFC form. The storage root is the empty string.

use std::fmt::Write;

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Canonical path of a storage root.
pub const ROOT: &str = "";

/// Normalize a raw storage-relative path into its canonical form.
///
/// Collapses repeated slashes, strips leading and trailing slashes and applies
/// NFC normalization. Case is preserved. Idempotent.
pub fn normalize(raw: &str) -> String {
    let composed: String = raw.nfc().collect();
    let mut out = String::with_capacity(composed.len());
    for segment in composed.split('/').filter(|s| !s.is_empty()) {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }
    out
}

/// Parent directory of a canonical path, or `None` for the root.
///
/// Top-level names have the root (`""`) as parent.
pub fn parent_of(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(pos) => Some(&path[..pos]),
        None => Some(ROOT),
    }
}

/// Last segment of a canonical path (`""` for the root).
pub fn name_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Join a canonical parent path and a single name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Number of segments in a canonical path (root is 0).
pub fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.matches('/').count() + 1
    }
}

/// Hex SHA-256 of the canonical path, used as the unique index key.
pub fn path_hash(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Whether `path` equals `prefix` or lies below it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || path == prefix {
        return true;
    }
    path.len() > prefix.len() && path.starts_with(prefix) && path.as_bytes()[prefix.len()] == b'/'
}

/// Replace the `old_prefix` part of `path` with `new_prefix`.
///
/// Returns `None` when `path` is not within `old_prefix`.
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if !is_within(path, old_prefix) {
        return None;
    }
    if old_prefix.is_empty() {
        return Some(if path.is_empty() {
            new_prefix.to_string()
        } else {
            join(new_prefix, path)
        });
    }
    let rest = &path[old_prefix.len()..];
    Some(format!("{new_prefix}{rest}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_and_collapses() {
        assert_eq!(normalize("/foo//bar/"), "foo/bar");
        assert_eq!(normalize("foo/bar"), "foo/bar");
        assert_eq!(normalize("///"), "");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("a/b//c///d"), "a/b/c/d");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["", "/", "a", "//a//b/", "Foo/Bar", "x/./y", "caf\u{0065}\u{0301}/z"] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn normalize_composes_unicode() {
        // "e" + combining acute accent becomes a single "é"
        assert_eq!(normalize("caf\u{0065}\u{0301}"), "caf\u{00e9}");
    }

    #[test]
    fn normalize_preserves_case() {
        assert_eq!(normalize("/Foo/BAR"), "Foo/BAR");
    }

    #[test]
    fn parent_of_cases() {
        assert_eq!(parent_of(""), None);
        assert_eq!(parent_of("foo"), Some(""));
        assert_eq!(parent_of("foo/bar"), Some("foo"));
        assert_eq!(parent_of("foo/bar/asd"), Some("foo/bar"));
    }

    #[test]
    fn name_of_cases() {
        assert_eq!(name_of(""), "");
        assert_eq!(name_of("foo"), "foo");
        assert_eq!(name_of("foo/bar/asd"), "asd");
    }

    #[test]
    fn join_handles_root_parent() {
        assert_eq!(join("", "foo"), "foo");
        assert_eq!(join("foo2/bar", "asd"), "foo2/bar/asd");
    }

    #[test]
    fn depth_counts_segments() {
        assert_eq!(depth(""), 0);
        assert_eq!(depth("a"), 1);
        assert_eq!(depth("a/b/c"), 3);
    }

    #[test]
    fn path_hash_is_stable_hex() {
        let h = path_hash("foo/bar");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, path_hash("foo/bar"));
        assert_ne!(h, path_hash("foo/Bar"));
    }

    #[test]
    fn is_within_requires_segment_boundary() {
        assert!(is_within("foo/bar", "foo"));
        assert!(is_within("foo", "foo"));
        assert!(!is_within("foobar", "foo"));
        assert!(!is_within("fo", "foo"));
        assert!(is_within("anything", ""));
    }

    #[test]
    fn rebase_swaps_prefix() {
        assert_eq!(rebase("foo/bar/asd", "foo/bar", "foo2/bar").as_deref(), Some("foo2/bar/asd"));
        assert_eq!(rebase("foo/bar", "foo/bar", "x").as_deref(), Some("x"));
        assert_eq!(rebase("foobar/x", "foo", "y"), None);
        assert_eq!(rebase("a/b", "", "new").as_deref(), Some("new/a/b"));
    }
}
