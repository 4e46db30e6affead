//! Thin typed layer over the Git object database and Git plumbing
//! subprocesses. Every raw `git2` call is mapped to a typed error, and
//! "not found" results surface as `Option` rather than errors.

mod fast_import;
mod repo;
mod run;
mod sha1;
mod tree;

pub use fast_import::{FastImportScript, FileChange, Mark, ParentRef};
pub use repo::{CommitInfo, Error as GitError, GitRepo, Result as GitResult};
pub use run::{GitRunner, GitRunnerOutput};
pub use sha1::{MaybeZeroSha1, Sha1, Sha1ParseError};
pub use tree::{diff_entries, DeltaKind, GitFileMode, TreeDelta, TreeEntry};
