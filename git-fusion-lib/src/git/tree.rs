//! Tree listings and tree-to-tree deltas, in the shapes the copy matrix
//! consumes.

use tracing::instrument;

use super::repo::{GitRepo, Result};
use super::sha1::Sha1;

/// A Unix file mode as Git stores it in tree entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GitFileMode {
    /// An ordinary file (`100644`).
    Blob,

    /// An executable file (`100755`).
    BlobExecutable,

    /// A symlink (`120000`); the blob content is the link target.
    Symlink,

    /// A submodule commit reference (`160000`).
    GitLink,

    /// A directory (`040000`).
    Tree,

    /// An unrecognized mode, preserved as-is.
    Unknown(i32),
}

impl From<i32> for GitFileMode {
    fn from(mode: i32) -> Self {
        match mode {
            0o100644 => GitFileMode::Blob,
            0o100755 => GitFileMode::BlobExecutable,
            0o120000 => GitFileMode::Symlink,
            0o160000 => GitFileMode::GitLink,
            0o040000 => GitFileMode::Tree,
            other => GitFileMode::Unknown(other),
        }
    }
}

impl From<GitFileMode> for i32 {
    fn from(mode: GitFileMode) -> Self {
        match mode {
            GitFileMode::Blob => 0o100644,
            GitFileMode::BlobExecutable => 0o100755,
            GitFileMode::Symlink => 0o120000,
            GitFileMode::GitLink => 0o160000,
            GitFileMode::Tree => 0o040000,
            GitFileMode::Unknown(other) => other,
        }
    }
}

impl GitFileMode {
    /// Render as the six-octal-digit form used in fast-import streams.
    pub fn to_octal_string(self) -> String {
        format!("{:06o}", i32::from(self))
    }

    /// Whether this mode names a symlink.
    pub fn is_symlink(self) -> bool {
        matches!(self, GitFileMode::Symlink)
    }
}

/// One blob (or gitlink) entry of a recursive tree listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    /// Repo-relative path of the entry.
    pub path: String,

    /// The entry's file mode.
    pub mode: GitFileMode,

    /// The blob (or commit, for gitlinks) ID.
    pub sha1: Sha1,
}

/// The kind of change a tree-to-tree delta row represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum DeltaKind {
    /// The path exists only in the new tree.
    Add,

    /// The path exists in both trees with differing content or mode.
    Modify,

    /// The path exists only in the old tree.
    Delete,
}

/// One row of a tree-to-tree delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeDelta {
    /// What happened to the path.
    pub kind: DeltaKind,

    /// Repo-relative path.
    pub path: String,

    /// Mode of the new side (old side for deletes).
    pub mode: GitFileMode,

    /// Blob ID of the new side (old side for deletes).
    pub sha1: Sha1,
}

impl GitRepo {
    /// Compute the add/modify/delete deltas between the trees of two
    /// commits. With `old_commit` absent (a root commit), every path in
    /// `new_commit`'s tree is an add.
    #[instrument]
    pub fn diff_commits(
        &self,
        old_commit: Option<Sha1>,
        new_commit: Sha1,
    ) -> Result<Vec<TreeDelta>> {
        let new_entries = self.ls_tree(new_commit)?;
        let old_entries = match old_commit {
            Some(old_commit) => self.ls_tree(old_commit)?,
            None => Vec::new(),
        };
        Ok(diff_entries(&old_entries, &new_entries))
    }
}

/// Diff two recursive tree listings. Exposed separately from
/// [`GitRepo::diff_commits`] so the decision logic can be unit-tested
/// without an object database.
pub fn diff_entries(old_entries: &[TreeEntry], new_entries: &[TreeEntry]) -> Vec<TreeDelta> {
    use std::collections::BTreeMap;

    let old_by_path: BTreeMap<&str, &TreeEntry> = old_entries
        .iter()
        .map(|entry| (entry.path.as_str(), entry))
        .collect();
    let new_by_path: BTreeMap<&str, &TreeEntry> = new_entries
        .iter()
        .map(|entry| (entry.path.as_str(), entry))
        .collect();

    let mut deltas = Vec::new();
    for (path, new_entry) in &new_by_path {
        match old_by_path.get(path) {
            None => deltas.push(TreeDelta {
                kind: DeltaKind::Add,
                path: (*path).to_string(),
                mode: new_entry.mode,
                sha1: new_entry.sha1,
            }),
            Some(old_entry) => {
                if old_entry.sha1 != new_entry.sha1 || old_entry.mode != new_entry.mode {
                    deltas.push(TreeDelta {
                        kind: DeltaKind::Modify,
                        path: (*path).to_string(),
                        mode: new_entry.mode,
                        sha1: new_entry.sha1,
                    });
                }
            }
        }
    }
    for (path, old_entry) in &old_by_path {
        if !new_by_path.contains_key(path) {
            deltas.push(TreeDelta {
                kind: DeltaKind::Delete,
                path: (*path).to_string(),
                mode: old_entry.mode,
                sha1: old_entry.sha1,
            });
        }
    }
    deltas.sort_by(|lhs, rhs| lhs.path.cmp(&rhs.path));
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, mode: GitFileMode, hex_byte: u8) -> TreeEntry {
        let hex = format!("{:02x}", hex_byte).repeat(20);
        TreeEntry {
            path: path.to_string(),
            mode,
            sha1: hex.parse().unwrap(),
        }
    }

    #[test]
    fn test_diff_entries() {
        let old = vec![
            entry("a.txt", GitFileMode::Blob, 0x11),
            entry("b.txt", GitFileMode::Blob, 0x22),
            entry("c.txt", GitFileMode::Blob, 0x33),
        ];
        let new = vec![
            entry("a.txt", GitFileMode::Blob, 0x11),
            entry("b.txt", GitFileMode::BlobExecutable, 0x22),
            entry("d.txt", GitFileMode::Blob, 0x44),
        ];
        let deltas = diff_entries(&old, &new);
        let kinds: Vec<(&str, DeltaKind)> = deltas
            .iter()
            .map(|delta| (delta.path.as_str(), delta.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("b.txt", DeltaKind::Modify),
                ("c.txt", DeltaKind::Delete),
                ("d.txt", DeltaKind::Add),
            ]
        );
    }

    #[test]
    fn test_mode_round_trip() {
        assert_eq!(GitFileMode::from(0o120000), GitFileMode::Symlink);
        assert_eq!(GitFileMode::Symlink.to_octal_string(), "120000");
        assert_eq!(GitFileMode::Blob.to_octal_string(), "100644");
    }
}
