//! Builder for a `git fast-import` stream, used to emit all commits for a
//! depot→Git copy in one streamed operation.

use std::io::Write;
use std::str::FromStr;

use eyre::{eyre, Context};
use tracing::instrument;

use super::run::GitRunner;
use super::sha1::Sha1;
use super::tree::GitFileMode;

/// A fast-import mark (`:N`), identifying an object within one stream
/// before its real ID is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mark(pub u64);

impl std::fmt::Display for Mark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ":{}", self.0)
    }
}

/// Reference to a commit used as a parent: either a mark from this stream
/// or an existing commit ID.
#[derive(Clone, Copy, Debug)]
pub enum ParentRef {
    /// A mark assigned earlier in this stream.
    Mark(Mark),

    /// A commit already present in the object database.
    Sha1(Sha1),
}

impl std::fmt::Display for ParentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParentRef::Mark(mark) => write!(f, "{mark}"),
            ParentRef::Sha1(sha1) => write!(f, "{sha1}"),
        }
    }
}

/// One `filemodify`/`filedelete` line within a commit.
#[derive(Clone, Debug)]
pub enum FileChange {
    /// Create or update a file from a blob emitted earlier in the stream.
    Modify {
        /// The file's mode.
        mode: GitFileMode,

        /// The blob holding the file's content.
        blob: ParentRef,

        /// Repo-relative path.
        path: String,
    },

    /// Remove a file.
    Delete {
        /// Repo-relative path.
        path: String,
    },

    /// Remove every file, so that subsequent modifies rebuild the full
    /// tree. Used when copying a commit whose tree is mirrored verbatim.
    DeleteAll,
}

/// Incrementally builds a fast-import stream.
#[derive(Debug, Default)]
pub struct FastImportScript {
    buf: Vec<u8>,
    next_mark: u64,
}

impl FastImportScript {
    /// Construct an empty stream.
    pub fn new() -> Self {
        FastImportScript {
            buf: Vec::new(),
            next_mark: 1,
        }
    }

    fn take_mark(&mut self) -> Mark {
        let mark = Mark(self.next_mark);
        self.next_mark += 1;
        mark
    }

    /// Emit a blob and return its mark.
    pub fn blob(&mut self, content: &[u8]) -> Mark {
        let mark = self.take_mark();
        write!(self.buf, "blob\nmark {mark}\ndata {}\n", content.len())
            .expect("writing to in-memory stream");
        self.buf.extend_from_slice(content);
        self.buf.push(b'\n');
        mark
    }

    /// Emit a commit on `ref_name` and return its mark.
    ///
    /// `author` and `committer` are `(name, email, epoch_seconds)`
    /// tuples. The first element of `parents` becomes the `from` commit;
    /// the rest become `merge` lines.
    pub fn commit(
        &mut self,
        ref_name: &str,
        author: (&str, &str, i64),
        committer: (&str, &str, i64),
        message: &[u8],
        parents: &[ParentRef],
        file_changes: &[FileChange],
    ) -> Mark {
        let mark = self.take_mark();
        write!(self.buf, "commit {ref_name}\nmark {mark}\n").expect("writing commit header");
        let (author_name, author_email, author_time) = author;
        writeln!(
            self.buf,
            "author {author_name} <{author_email}> {author_time} +0000"
        )
        .expect("writing author");
        let (committer_name, committer_email, committer_time) = committer;
        writeln!(
            self.buf,
            "committer {committer_name} <{committer_email}> {committer_time} +0000"
        )
        .expect("writing committer");
        write!(self.buf, "data {}\n", message.len()).expect("writing message header");
        self.buf.extend_from_slice(message);
        self.buf.push(b'\n');
        let mut parents_iter = parents.iter();
        if let Some(first_parent) = parents_iter.next() {
            writeln!(self.buf, "from {first_parent}").expect("writing from");
        }
        for merge_parent in parents_iter {
            writeln!(self.buf, "merge {merge_parent}").expect("writing merge");
        }
        for change in file_changes {
            match change {
                FileChange::Modify { mode, blob, path } => {
                    writeln!(self.buf, "M {} {blob} {path}", mode.to_octal_string())
                        .expect("writing filemodify");
                }
                FileChange::Delete { path } => {
                    writeln!(self.buf, "D {path}").expect("writing filedelete");
                }
                FileChange::DeleteAll => {
                    writeln!(self.buf, "deleteall").expect("writing deleteall");
                }
            }
        }
        self.buf.push(b'\n');
        mark
    }

    /// Emit a `reset` so a ref is created or moved even with no new
    /// commits on it.
    pub fn reset(&mut self, ref_name: &str, to: ParentRef) {
        writeln!(self.buf, "reset {ref_name}\nfrom {to}\n").expect("writing reset");
    }

    /// The stream text accumulated so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Feed the stream to `git fast-import` and collect the (mark, sha1)
    /// pairs it exports.
    #[instrument(skip(self, runner))]
    pub fn run(self, runner: &GitRunner) -> eyre::Result<Vec<(Mark, Sha1)>> {
        let marks_file = tempfile::NamedTempFile::new().wrap_err("Creating marks file")?;
        let marks_arg = format!(
            "--export-marks={}",
            marks_file.path().to_string_lossy()
        );
        let output = runner.run_with_stdin(
            &["fast-import", "--quiet", marks_arg.as_str()],
            Some(&self.buf),
        )?;
        if !output.is_success() {
            return Err(eyre!(
                "git fast-import failed with exit code {}: {}",
                output.exit_code,
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        let marks_text =
            std::fs::read_to_string(marks_file.path()).wrap_err("Reading marks file")?;
        parse_marks(&marks_text)
    }
}

fn parse_marks(marks_text: &str) -> eyre::Result<Vec<(Mark, Sha1)>> {
    let mut result = Vec::new();
    for line in marks_text.lines() {
        let (mark, sha1) = line
            .split_once(' ')
            .ok_or_else(|| eyre!("malformed marks line: {line:?}"))?;
        let mark = mark
            .strip_prefix(':')
            .ok_or_else(|| eyre!("malformed mark: {mark:?}"))?;
        let mark = Mark(mark.parse().wrap_err("Parsing mark number")?);
        let sha1 = Sha1::from_str(sha1).map_err(|err| eyre!("{err}"))?;
        result.push((mark, sha1));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_shape() {
        let mut script = FastImportScript::new();
        let blob = script.blob(b"hello\n");
        let parent: Sha1 = "1f6e71b2b1b423bd0c79a4e29f7e34283f0d3367".parse().unwrap();
        script.commit(
            "refs/heads/master",
            ("Alice", "alice@example.com", 1400000000),
            ("Alice", "alice@example.com", 1400000000),
            b"add greeting",
            &[ParentRef::Sha1(parent)],
            &[FileChange::Modify {
                mode: GitFileMode::Blob,
                blob: ParentRef::Mark(blob),
                path: "greeting.txt".to_string(),
            }],
        );
        let text = String::from_utf8(script.buf).unwrap();
        assert!(text.starts_with("blob\nmark :1\ndata 6\nhello\n"));
        assert!(text.contains("commit refs/heads/master\nmark :2\n"));
        assert!(text.contains("author Alice <alice@example.com> 1400000000 +0000\n"));
        assert!(text.contains("from 1f6e71b2b1b423bd0c79a4e29f7e34283f0d3367\n"));
        assert!(text.contains("M 100644 :1 greeting.txt\n"));
    }

    #[test]
    fn test_merge_parents() {
        let mut script = FastImportScript::new();
        let p1: Sha1 = "aa".repeat(20).parse().unwrap();
        let p2: Sha1 = "bb".repeat(20).parse().unwrap();
        script.commit(
            "refs/heads/master",
            ("A", "a@example.com", 0),
            ("A", "a@example.com", 0),
            b"merge",
            &[ParentRef::Sha1(p1), ParentRef::Sha1(p2)],
            &[],
        );
        let text = String::from_utf8(script.buf).unwrap();
        assert!(text.contains(&format!("from {p1}\n")));
        assert!(text.contains(&format!("merge {p2}\n")));
    }

    #[test]
    fn test_parse_marks() {
        let parsed = parse_marks(
            ":1 1f6e71b2b1b423bd0c79a4e29f7e34283f0d3367\n:2 2f6e71b2b1b423bd0c79a4e29f7e34283f0d3367\n",
        )
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, Mark(1));
        assert_eq!(
            parsed[1].1.to_string(),
            "2f6e71b2b1b423bd0c79a4e29f7e34283f0d3367"
        );
    }
}
