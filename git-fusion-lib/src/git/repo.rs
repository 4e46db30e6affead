//! Operations on the local Git repository backing one bridged repo. Exists
//! so that every `git2` call has a typed error, and so that `ENOTFOUND`
//! results surface as `Option` rather than errors.

use std::path::{Path, PathBuf};

use bstr::BString;
use thiserror::Error;
use tracing::instrument;

use super::sha1::Sha1;
use super::tree::{GitFileMode, TreeEntry};

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not open repository: {0}")]
    OpenRepo(#[source] git2::Error),

    #[error("could not find commit {sha1}: {source}")]
    FindCommit { source: git2::Error, sha1: Sha1 },

    #[error("could not find blob {sha1}: {source}")]
    FindBlob { source: git2::Error, sha1: Sha1 },

    #[error("could not find tree {sha1}: {source}")]
    FindTree { source: git2::Error, sha1: Sha1 },

    #[error("could not read tree entries for {sha1}: {source}")]
    WalkTree { source: git2::Error, sha1: Sha1 },

    #[error("could not walk commit range: {0}")]
    WalkCommits(#[source] git2::Error),

    #[error("could not update reference {name}: {source}")]
    UpdateReference { source: git2::Error, name: String },

    #[error("could not read reference {name}: {source}")]
    ReadReference { source: git2::Error, name: String },

    #[error("could not hash object: {0}")]
    HashObject(#[source] git2::Error),
}

/// Result type for Git repository operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A handle to the local Git repository for one bridged repo.
pub struct GitRepo {
    inner: git2::Repository,
}

impl std::fmt::Debug for GitRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<GitRepo path={:?}>", self.inner.path())
    }
}

/// A commit loaded from the Git object database, flattened into the fields
/// the copiers consume.
#[derive(Clone, Debug)]
pub struct CommitInfo {
    /// The commit ID.
    pub sha1: Sha1,

    /// Parent commit IDs, first parent first.
    pub parents: Vec<Sha1>,

    /// The tree ID.
    pub tree: Sha1,

    /// Author name, email, and Unix timestamp.
    pub author: (String, String, i64),

    /// Committer name, email, and Unix timestamp.
    pub committer: (String, String, i64),

    /// The commit message, not necessarily UTF-8.
    pub message: BString,
}

impl GitRepo {
    /// Open the repository at the given path.
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        let inner = git2::Repository::open(path).map_err(Error::OpenRepo)?;
        Ok(GitRepo { inner })
    }

    /// The path to the `.git` directory.
    pub fn git_dir(&self) -> PathBuf {
        self.inner.path().to_path_buf()
    }

    /// Determine whether any object with the given ID exists.
    #[instrument]
    pub fn object_exists(&self, sha1: Sha1) -> bool {
        self.inner.odb().map_or(false, |odb| odb.exists(sha1.into()))
    }

    /// Load a commit, or `None` if no such commit exists.
    #[instrument]
    pub fn find_commit(&self, sha1: Sha1) -> Result<Option<CommitInfo>> {
        let commit = match self.inner.find_commit(sha1.into()) {
            Ok(commit) => commit,
            Err(err) if err.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(source) => return Err(Error::FindCommit { source, sha1 }),
        };
        let info = CommitInfo {
            sha1,
            parents: commit.parent_ids().map(Sha1::from).collect(),
            tree: Sha1::from(commit.tree_id()),
            author: signature_parts(&commit.author()),
            committer: signature_parts(&commit.committer()),
            message: BString::from(commit.message_raw_bytes()),
        };
        Ok(Some(info))
    }

    /// Read a blob's content, or `None` if no such blob exists.
    #[instrument]
    pub fn read_blob(&self, sha1: Sha1) -> Result<Option<Vec<u8>>> {
        match self.inner.find_blob(sha1.into()) {
            Ok(blob) => Ok(Some(blob.content().to_vec())),
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(source) => Err(Error::FindBlob { source, sha1 }),
        }
    }

    /// List every entry of the tree of the given commit, recursively, as
    /// repo-relative paths.
    #[instrument]
    pub fn ls_tree(&self, commit_sha1: Sha1) -> Result<Vec<TreeEntry>> {
        let commit = self
            .inner
            .find_commit(commit_sha1.into())
            .map_err(|source| Error::FindCommit {
                source,
                sha1: commit_sha1,
            })?;
        let tree = commit.tree().map_err(|source| Error::FindTree {
            source,
            sha1: commit_sha1,
        })?;
        let mut entries = Vec::new();
        tree.walk(git2::TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(git2::ObjectType::Blob)
                || entry.filemode() == i32::from(GitFileMode::GitLink)
            {
                entries.push(TreeEntry {
                    path: format!("{}{}", dir, entry.name().unwrap_or_default()),
                    mode: GitFileMode::from(entry.filemode()),
                    sha1: Sha1::from(entry.id()),
                });
            }
            git2::TreeWalkResult::Ok
        })
        .map_err(|source| Error::WalkTree {
            source,
            sha1: commit_sha1,
        })?;
        Ok(entries)
    }

    /// List commit IDs reachable from `heads` but not from `exclude`, in
    /// topological order, parents before children.
    #[instrument]
    pub fn rev_list_topo(&self, heads: &[Sha1], exclude: &[Sha1]) -> Result<Vec<Sha1>> {
        let mut walk = self.inner.revwalk().map_err(Error::WalkCommits)?;
        walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE)
            .map_err(Error::WalkCommits)?;
        for head in heads {
            walk.push((*head).into()).map_err(Error::WalkCommits)?;
        }
        for old in exclude {
            walk.hide((*old).into()).map_err(Error::WalkCommits)?;
        }
        let mut result = Vec::new();
        for oid in walk {
            let oid = oid.map_err(Error::WalkCommits)?;
            result.push(Sha1::from(oid));
        }
        Ok(result)
    }

    /// Read the commit a reference points at, or `None` if the reference
    /// does not exist.
    #[instrument]
    pub fn resolve_ref(&self, name: &str) -> Result<Option<Sha1>> {
        match self.inner.refname_to_id(name) {
            Ok(oid) => Ok(Some(Sha1::from(oid))),
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(source) => Err(Error::ReadReference {
                source,
                name: name.to_string(),
            }),
        }
    }

    /// Point a reference at a commit, creating the reference if necessary.
    #[instrument]
    pub fn update_ref(&self, name: &str, sha1: Sha1, log_message: &str) -> Result<()> {
        self.inner
            .reference(name, sha1.into(), true, log_message)
            .map_err(|source| Error::UpdateReference {
                source,
                name: name.to_string(),
            })?;
        Ok(())
    }

    /// List all references whose names start with `prefix`, with their
    /// targets.
    #[instrument]
    pub fn list_refs(&self, prefix: &str) -> Result<Vec<(String, Sha1)>> {
        let refs = self
            .inner
            .references()
            .map_err(|source| Error::ReadReference {
                source,
                name: prefix.to_string(),
            })?;
        let mut result = Vec::new();
        for reference in refs {
            let reference = reference.map_err(|source| Error::ReadReference {
                source,
                name: prefix.to_string(),
            })?;
            let name = match reference.name() {
                Some(name) if name.starts_with(prefix) => name.to_string(),
                _ => continue,
            };
            if let Some(oid) = reference.target() {
                result.push((name, Sha1::from(oid)));
            }
        }
        Ok(result)
    }
}

fn signature_parts(sig: &git2::Signature) -> (String, String, i64) {
    (
        String::from_utf8_lossy(sig.name_bytes()).into_owned(),
        String::from_utf8_lossy(sig.email_bytes()).into_owned(),
        sig.when().seconds(),
    )
}
