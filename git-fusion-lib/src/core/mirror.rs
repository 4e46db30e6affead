//! The object mirror: a content-addressed store of Git commits, trees, and
//! blobs inside the depot, plus the small records associating each
//! (commit, branch) pair with its changelist.
//!
//! A sha that appears in Git must appear in the mirror before any
//! corresponding changelist is published; the mirror is what lets a
//! depot↔Git round trip avoid rescanning Git history.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::instrument;

use crate::depot::{Connection, DepotError, DepotResult, NumberedChangelist, PrintSink};
use crate::git::Sha1;

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum Error {
    #[error("mirrored object is not zlib data: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("mirrored object has a malformed `blob N\\0` header")]
    MalformedHeader,

    #[error("mirrored object declared {declared} bytes but carried {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error(transparent)]
    Depot(#[from] DepotError),
}

/// Result type for mirror operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Compress content into the stored form: zlib over the standard Git
/// `blob N\0` header plus the raw bytes.
pub fn encode_blob(content: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(format!("blob {}\0", content.len()).as_bytes())
        .expect("writing to in-memory encoder");
    encoder
        .write_all(content)
        .expect("writing to in-memory encoder");
    encoder.finish().expect("finishing in-memory encoder")
}

/// Reverse [`encode_blob`], validating the header.
pub fn decode_blob(stored: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(stored);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw).map_err(Error::Decompress)?;
    let nul = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::MalformedHeader)?;
    let header = std::str::from_utf8(&raw[..nul]).map_err(|_| Error::MalformedHeader)?;
    let declared: usize = header
        .strip_prefix("blob ")
        .and_then(|len| len.parse().ok())
        .ok_or(Error::MalformedHeader)?;
    let content = raw[nul + 1..].to_vec();
    if content.len() != declared {
        return Err(Error::LengthMismatch {
            declared,
            actual: content.len(),
        });
    }
    Ok(content)
}

/// The mirror for one repo inside one Fusion-dedicated depot.
#[derive(Clone, Debug)]
pub struct ObjectMirror {
    depot: String,
    repo: String,
}

impl ObjectMirror {
    /// Construct for the given depot and repo names.
    pub fn new(depot: &str, repo: &str) -> Self {
        ObjectMirror {
            depot: depot.to_string(),
            repo: repo.to_string(),
        }
    }

    /// Depot path storing a mirrored blob.
    pub fn blob_path(&self, sha1: Sha1) -> String {
        let (a, b, rest) = sha1.to_path_parts();
        format!("//{}/objects/blobs/{a}/{b}/{rest}", self.depot)
    }

    /// Depot path storing a mirrored tree.
    pub fn tree_path(&self, sha1: Sha1) -> String {
        let (a, b, rest) = sha1.to_path_parts();
        format!("//{}/objects/trees/{a}/{b}/{rest}", self.depot)
    }

    /// Depot path of the record associating (commit, branch, changelist).
    pub fn commit_record_path(&self, sha1: Sha1, branch_id: &str, change_num: u64) -> String {
        let (a, b, rest) = sha1.to_path_parts();
        format!(
            "//{}/objects/repos/{}/commits/{a}/{b}/{rest}-{branch_id}-{change_num}",
            self.depot, self.repo
        )
    }

    fn commit_record_pattern(&self, sha1: Option<Sha1>) -> String {
        match sha1 {
            Some(sha1) => {
                let (a, b, rest) = sha1.to_path_parts();
                format!(
                    "//{}/objects/repos/{}/commits/{a}/{b}/{rest}-*",
                    self.depot, self.repo
                )
            }
            None => format!("//{}/objects/repos/{}/commits/...", self.depot, self.repo),
        }
    }

    /// Parse a commit record path back into its (sha1, branch id,
    /// changelist) triple. The sha remainder is a fixed 36 characters, so
    /// branch ids containing `-` parse unambiguously.
    pub fn parse_commit_record_path(&self, depot_path: &str) -> Option<(Sha1, String, u64)> {
        let prefix = format!("//{}/objects/repos/{}/commits/", self.depot, self.repo);
        let rest = depot_path.strip_prefix(&prefix)?;
        let mut parts = rest.splitn(3, '/');
        let a = parts.next()?;
        let b = parts.next()?;
        let file = parts.next()?;
        if file.len() < 36 + 1 {
            return None;
        }
        let (sha_rest, suffix) = file.split_at(36);
        let suffix = suffix.strip_prefix('-')?;
        let (branch_id, change_num) = suffix.rsplit_once('-')?;
        let change_num = change_num.parse().ok()?;
        let sha1: Sha1 = format!("{a}{b}{sha_rest}").parse().ok()?;
        Some((sha1, branch_id.to_string(), change_num))
    }

    /// Whether a mirrored blob exists for `sha1`.
    #[instrument(skip(conn))]
    pub fn blob_exists(&self, conn: &dyn Connection, sha1: Sha1) -> DepotResult<bool> {
        path_exists(conn, &self.blob_path(sha1))
    }

    /// Whether a mirrored tree exists for `sha1`.
    #[instrument(skip(conn))]
    pub fn tree_exists(&self, conn: &dyn Connection, sha1: Sha1) -> DepotResult<bool> {
        path_exists(conn, &self.tree_path(sha1))
    }

    /// Fetch and decode a mirrored blob, or `None` if absent.
    #[instrument(skip(conn))]
    pub fn fetch_blob(&self, conn: &dyn Connection, sha1: Sha1) -> Result<Option<Vec<u8>>> {
        struct Grab {
            content: Option<Vec<u8>>,
        }
        impl PrintSink for Grab {
            fn file(&mut self, _depot_path: &str, _rev: u64, content: &[u8]) -> DepotResult<()> {
                self.content = Some(content.to_vec());
                Ok(())
            }
        }
        let mut sink = Grab { content: None };
        conn.print(&[self.blob_path(sha1)], &mut sink)?;
        match sink.content {
            Some(stored) => Ok(Some(decode_blob(&stored)?)),
            None => Ok(None),
        }
    }

    /// The changelist a commit was copied to on one branch, if recorded.
    #[instrument(skip(conn))]
    pub fn change_num_for_commit(
        &self,
        conn: &dyn Connection,
        sha1: Sha1,
        branch_id: &str,
    ) -> DepotResult<Option<u64>> {
        Ok(self
            .changes_for_commit(conn, sha1)?
            .into_iter()
            .find(|(recorded_branch, _)| recorded_branch == branch_id)
            .map(|(_, change_num)| change_num))
    }

    /// Every (branch id, changelist) pair a commit has been copied to.
    #[instrument(skip(conn))]
    pub fn changes_for_commit(
        &self,
        conn: &dyn Connection,
        sha1: Sha1,
    ) -> DepotResult<Vec<(String, u64)>> {
        let rows = conn.run_tagged("files", &["-e", &self.commit_record_pattern(Some(sha1))])?;
        let mut result = Vec::new();
        for row in rows {
            let depot_file = row.expect("files", "depotFile")?;
            if let Some((_, branch_id, change_num)) = self.parse_commit_record_path(depot_file) {
                result.push((branch_id, change_num));
            }
        }
        Ok(result)
    }

    /// The commit copied to a given (branch, changelist), if recorded.
    #[instrument(skip(conn))]
    pub fn commit_for_change(
        &self,
        conn: &dyn Connection,
        branch_id: &str,
        change_num: u64,
    ) -> DepotResult<Option<Sha1>> {
        let rows = conn.run_tagged("files", &["-e", &self.commit_record_pattern(None)])?;
        for row in rows {
            let depot_file = row.expect("files", "depotFile")?;
            if let Some((sha1, recorded_branch, recorded_change)) =
                self.parse_commit_record_path(depot_file)
            {
                if recorded_branch == branch_id && recorded_change == change_num {
                    return Ok(Some(sha1));
                }
            }
        }
        Ok(None)
    }

    /// The highest changelist recorded for a branch, the starting point of
    /// an incremental depot→Git copy.
    #[instrument(skip(conn))]
    pub fn highest_change_for_branch(
        &self,
        conn: &dyn Connection,
        branch_id: &str,
    ) -> DepotResult<Option<u64>> {
        let rows = conn.run_tagged("files", &["-e", &self.commit_record_pattern(None)])?;
        let mut best = None;
        for row in rows {
            let depot_file = row.expect("files", "depotFile")?;
            if let Some((_, recorded_branch, change_num)) =
                self.parse_commit_record_path(depot_file)
            {
                if recorded_branch == branch_id {
                    best = Some(best.map_or(change_num, |current: u64| current.max(change_num)));
                }
            }
        }
        Ok(best)
    }

    /// Begin a batch of mirror writes.
    pub fn batch(&self) -> MirrorBatch {
        MirrorBatch {
            mirror: self.clone(),
            files: Vec::new(),
        }
    }
}

fn path_exists(conn: &dyn Connection, depot_path: &str) -> DepotResult<bool> {
    let rows = conn.run_tagged("files", &["-e", depot_path])?;
    Ok(!rows.is_empty())
}

/// A pending set of mirror writes, submitted as one changelist.
///
/// Content-addressed paths make concurrent writes of the same object
/// idempotent: a path that already exists is skipped at submit time.
#[derive(Debug)]
pub struct MirrorBatch {
    mirror: ObjectMirror,
    files: Vec<(String, Vec<u8>)>,
}

impl MirrorBatch {
    /// Queue a blob write.
    pub fn add_blob(&mut self, sha1: Sha1, content: &[u8]) {
        self.files
            .push((self.mirror.blob_path(sha1), encode_blob(content)));
    }

    /// Queue a tree write.
    pub fn add_tree(&mut self, sha1: Sha1, stored: &[u8]) {
        self.files.push((self.mirror.tree_path(sha1), stored.to_vec()));
    }

    /// Queue a commit↔changelist association record.
    pub fn add_commit_record(&mut self, sha1: Sha1, branch_id: &str, change_num: u64) {
        self.files.push((
            self.mirror.commit_record_path(sha1, branch_id, change_num),
            Vec::new(),
        ));
    }

    /// Number of writes queued.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the batch has no queued writes.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Submit the batch on `conn`, which must be bound to a client whose
    /// view maps the Fusion depot. Already-present paths are skipped.
    /// Returns the submitted changelist number, or `None` for an empty (or
    /// fully-deduplicated) batch.
    #[instrument(skip(self, conn))]
    pub fn submit(self, conn: &dyn Connection, description: &str) -> Result<Option<u64>> {
        let mut to_write = Vec::new();
        for (depot_path, content) in self.files {
            if path_exists(conn, &depot_path)? {
                continue;
            }
            to_write.push((depot_path, content));
        }
        if to_write.is_empty() {
            return Ok(None);
        }
        let change = NumberedChangelist::create(conn, description)?;
        let change_arg = change.change_num().to_string();
        for (depot_path, content) in &to_write {
            write_client_file(conn, depot_path, content)?;
            conn.run_tagged("add", &["-c", &change_arg, depot_path])?;
        }
        let submitted = change.submit()?;
        Ok(Some(submitted))
    }
}

/// Materialize `content` at the workspace location the bound client maps
/// `depot_path` to.
pub fn write_client_file(
    conn: &dyn Connection,
    depot_path: &str,
    content: &[u8],
) -> DepotResult<()> {
    let root = conn.client_root().ok_or(DepotError::NotConnected)?;
    // The Fusion depot maps one-to-one under the client root.
    let relative = depot_path.trim_start_matches('/');
    let local = root.join(relative);
    if let Some(parent) = local.parent() {
        std::fs::create_dir_all(parent).map_err(|source| DepotError::WriteWorkspaceFile {
            source,
            path: local.clone(),
        })?;
    }
    std::fs::write(&local, content).map_err(|source| DepotError::WriteWorkspaceFile {
        source,
        path: local,
    })
}

#[cfg(test)]
mod tests {
    use crate::testing::InMemoryDepot;

    use super::*;

    fn sha(byte: &str) -> Sha1 {
        byte.repeat(20).parse().unwrap()
    }

    #[test]
    fn test_blob_codec_round_trip() {
        let content = b"file content\nwith lines\n";
        let stored = encode_blob(content);
        assert_eq!(decode_blob(&stored).unwrap(), content.to_vec());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_blob(b"not zlib at all").is_err());
    }

    #[test]
    fn test_commit_record_path_round_trip() {
        let mirror = ObjectMirror::new(".git-fusion", "repoA");
        let sha1 = sha("ab");
        let path = mirror.commit_record_path(sha1, "my-branch-id", 123);
        let (parsed_sha, branch_id, change_num) =
            mirror.parse_commit_record_path(&path).unwrap();
        assert_eq!(parsed_sha, sha1);
        assert_eq!(branch_id, "my-branch-id");
        assert_eq!(change_num, 123);
    }

    #[test]
    fn test_mirror_round_trip_through_depot() {
        let depot = InMemoryDepot::new();
        let conn = depot.connect_with_client("git-fusion-user", "gf-mirror-client");
        let mirror = ObjectMirror::new(".git-fusion", "repoA");
        let blob_sha = sha("cd");
        let commit_sha = sha("ef");

        let mut batch = mirror.batch();
        batch.add_blob(blob_sha, b"hello depot");
        batch.add_commit_record(commit_sha, "branch-one", 42);
        assert_eq!(batch.len(), 2);
        batch.submit(&conn, "mirror write").unwrap().unwrap();

        assert!(mirror.blob_exists(&conn, blob_sha).unwrap());
        assert_eq!(
            mirror.fetch_blob(&conn, blob_sha).unwrap().unwrap(),
            b"hello depot".to_vec()
        );
        assert_eq!(
            mirror
                .change_num_for_commit(&conn, commit_sha, "branch-one")
                .unwrap(),
            Some(42)
        );
        assert_eq!(
            mirror.changes_for_commit(&conn, commit_sha).unwrap(),
            vec![("branch-one".to_string(), 42)]
        );
        assert_eq!(
            mirror
                .commit_for_change(&conn, "branch-one", 42)
                .unwrap(),
            Some(commit_sha)
        );
        assert_eq!(
            mirror
                .highest_change_for_branch(&conn, "branch-one")
                .unwrap(),
            Some(42)
        );
    }

    #[test]
    fn test_duplicate_write_is_idempotent() {
        let depot = InMemoryDepot::new();
        let conn = depot.connect_with_client("git-fusion-user", "gf-mirror-client");
        let mirror = ObjectMirror::new(".git-fusion", "repoA");
        let blob_sha = sha("cd");

        let mut batch = mirror.batch();
        batch.add_blob(blob_sha, b"once");
        batch.submit(&conn, "first").unwrap().unwrap();

        let mut batch = mirror.batch();
        batch.add_blob(blob_sha, b"once");
        // Entire batch dedupes away: no new changelist.
        assert_eq!(batch.submit(&conn, "second").unwrap(), None);
    }
}
