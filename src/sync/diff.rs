//! Pure diffing of server/local MD5 maps. No I/O, no network — these
//! functions are what `mirror`/`push` reconciliation call to decide what
//! to transfer, kept separate so they're trivial to test in isolation.

use indexmap::IndexMap;
use std::collections::HashSet;

/// What a client needs to do to bring a folder in line with the server,
/// expressed in the server-canonical namespace (i.e. before any per-client
/// redirect is applied to turn a path into a local one).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FolderDiff {
    /// Canonical paths to fetch, in the server's scan order.
    pub downloads: Vec<String>,
    /// Canonical paths present locally but absent (or ignored) on the
    /// server. Always empty for push-mode folders.
    pub deletions: Vec<String>,
}

/// Mirror-mode diff: anything missing or mismatched on the client is a
/// download; anything the client has that the server doesn't is a deletion.
pub fn diff_mirror(
    server_map: &IndexMap<String, String>,
    local_map: &IndexMap<String, String>,
) -> FolderDiff {
    let mut downloads = Vec::new();
    for (path, md5) in server_map {
        match local_map.get(path) {
            Some(local_md5) if local_md5 == md5 => {}
            _ => downloads.push(path.clone()),
        }
    }

    let mut deletions = Vec::new();
    for path in local_map.keys() {
        if !server_map.contains_key(path) {
            deletions.push(path.clone());
        }
    }

    FolderDiff {
        downloads,
        deletions,
    }
}

/// Push-mode diff: the same download set as mirror, but local extras are
/// left untouched — push never deletes.
pub fn diff_push(
    server_map: &IndexMap<String, String>,
    local_map: &IndexMap<String, String>,
) -> FolderDiff {
    let mut diff = diff_mirror(server_map, local_map);
    diff.deletions.clear();
    diff
}

/// Directories the client has locally that the server no longer lists.
/// Returned deepest-first (most path separators first) so a caller can
/// delete children before the now-empty parent.
pub fn stale_dirs(server_dirs: &[String], local_dirs: &[String]) -> Vec<String> {
    let server_set: HashSet<&str> = server_dirs.iter().map(|s| s.as_str()).collect();
    let mut stale: Vec<String> = local_dirs
        .iter()
        .filter(|d| !server_set.contains(d.as_str()))
        .cloned()
        .collect();
    stale.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));
    stale
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::collection::vec as pvec;
    use proptest::prelude::*;

    /// `(path, md5)` pairs drawn from a small alphabet so maps collide
    /// enough to exercise both the "missing" and "mismatched" branches.
    fn arb_map() -> impl Strategy<Value = IndexMap<String, String>> {
        pvec(
            ("[a-c]{1,2}\\.txt", "[0-9]{1,2}"),
            0..6,
        )
        .prop_map(|pairs| pairs.into_iter().collect())
    }

    proptest! {
        /// Property 3 (MD5 authority) restricted to the mirror direction:
        /// a path never appears in the download set when its MD5 already
        /// matches, and always appears when the server has it and it
        /// doesn't match (or is absent locally).
        #[test]
        fn mirror_authority(server in arb_map(), local in arb_map()) {
            let diff = diff_mirror(&server, &local);
            for (path, md5) in &server {
                let matches = local.get(path) == Some(md5);
                prop_assert_eq!(diff.downloads.contains(path), !matches);
            }
        }

        /// Property 5 (push non-destruction): push-mode diffs never
        /// propose a deletion, for any pair of maps.
        #[test]
        fn push_never_proposes_deletions(server in arb_map(), local in arb_map()) {
            let diff = diff_push(&server, &local);
            prop_assert!(diff.deletions.is_empty());
        }

        /// Mirror's deletion set is exactly the local keys absent from the
        /// server map — never a path the server still has.
        #[test]
        fn mirror_deletions_are_local_only_paths(server in arb_map(), local in arb_map()) {
            let diff = diff_mirror(&server, &local);
            for path in &diff.deletions {
                prop_assert!(!server.contains_key(path));
                prop_assert!(local.contains_key(path));
            }
        }

        /// Mirroring identical maps is always a no-op, regardless of content.
        #[test]
        fn mirror_of_equal_maps_is_always_a_no_op(map in arb_map()) {
            let diff = diff_mirror(&map, &map);
            prop_assert!(diff.downloads.is_empty());
            prop_assert!(diff.deletions.is_empty());
        }
    }
}
