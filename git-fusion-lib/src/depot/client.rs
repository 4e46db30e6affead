//! Tagged command execution against the depot.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum Error {
    #[error("depot command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("depot command `{command}` returned a row missing key `{key}`")]
    MissingKey { command: String, key: &'static str },

    #[error("could not parse `{field}` value {value:?} as an integer")]
    ParseInt { field: String, value: String },

    #[error("not connected to the depot")]
    NotConnected,

    #[error("could not read workspace file {path:?}: {source}")]
    ReadWorkspaceFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("could not write workspace file {path:?}: {source}")]
    WriteWorkspaceFile {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Result type for depot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// One row of tagged command output: a string-keyed dictionary.
///
/// List-valued spec fields arrive as numbered keys (`View0`, `View1`, …,
/// `Reviews0`, …), matching the tagged wire format.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TaggedDict {
    entries: BTreeMap<String, String>,
}

impl TaggedDict {
    /// Construct an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Look up a value by key and parse it as an integer.
    pub fn get_int(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| Error::ParseInt {
                field: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Look up a value by key, failing with [`Error::MissingKey`] if absent.
    /// `command` names the command whose output is being read, for
    /// diagnostics.
    pub fn expect(&self, command: &str, key: &'static str) -> Result<&str> {
        self.get(key).ok_or_else(|| Error::MissingKey {
            command: command.to_string(),
            key,
        })
    }

    /// Insert a key/value pair, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Collect the values of a numbered key sequence (`prefix0`, `prefix1`,
    /// …) in order, stopping at the first gap.
    pub fn get_numbered(&self, prefix: &str) -> Vec<String> {
        let mut values = Vec::new();
        for i in 0.. {
            match self.get(&format!("{prefix}{i}")) {
                Some(value) => values.push(value.to_string()),
                None => break,
            }
        }
        values
    }

    /// Store a list under a numbered key sequence.
    pub fn set_numbered(&mut self, prefix: &str, values: &[String]) {
        let stale: Vec<String> = self
            .entries
            .keys()
            .filter(|key| {
                key.strip_prefix(prefix)
                    .map(|rest| rest.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for key in stale {
            self.entries.remove(&key);
        }
        for (i, value) in values.iter().enumerate() {
            self.insert(format!("{prefix}{i}"), value.clone());
        }
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Debug for TaggedDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl FromIterator<(String, String)> for TaggedDict {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        TaggedDict {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Receives file content streamed by [`Connection::print`], one callback per
/// printed revision.
pub trait PrintSink {
    /// Called once per printed file revision with its depot path, revision
    /// number, and raw content bytes.
    fn file(&mut self, depot_path: &str, rev: u64, content: &[u8]) -> Result<()>;
}

impl<F> PrintSink for F
where
    F: FnMut(&str, u64, &[u8]) -> Result<()>,
{
    fn file(&mut self, depot_path: &str, rev: u64, content: &[u8]) -> Result<()> {
        self(depot_path, rev, content)
    }
}

/// A single connection to the depot, bound to one user and at most one
/// client workspace at a time.
///
/// Commands which merely find nothing ("no such file(s)", an empty
/// changelist range, a missing counter) return empty result lists or absent
/// keys; only genuine command failures surface as [`Error::CommandFailed`].
/// This keeps "query returned empty" distinguishable from "query failed"
/// without exception scoping.
pub trait Connection: fmt::Debug {
    /// Execute a tagged command, returning one dictionary per output row.
    fn run_tagged(&self, command: &str, args: &[&str]) -> Result<Vec<TaggedDict>>;

    /// Execute a tagged command with form input (`-i` style), e.g. saving a
    /// spec.
    fn run_tagged_with_input(
        &self,
        command: &str,
        args: &[&str],
        input: &TaggedDict,
    ) -> Result<Vec<TaggedDict>>;

    /// Stream the content of each `path#rev` (or plain path for the head
    /// revision) to `sink`. Nonexistent paths are skipped, not errors.
    fn print(&self, path_revs: &[String], sink: &mut dyn PrintSink) -> Result<()>;

    /// The depot user this connection authenticates as.
    fn user(&self) -> String;

    /// The client workspace this connection is currently bound to, if any.
    fn client(&self) -> Option<String>;

    /// Bind this connection to a client workspace. Subsequent commands that
    /// take client paths resolve against its view and root.
    fn set_client(&self, client: &str);

    /// Local filesystem root of the currently-bound client workspace.
    fn client_root(&self) -> Option<PathBuf>;
}

/// Run a tagged command and return the first output row, if any.
pub fn run_tagged_one(
    conn: &dyn Connection,
    command: &str,
    args: &[&str],
) -> Result<Option<TaggedDict>> {
    let mut rows = conn.run_tagged(command, args)?;
    if rows.is_empty() {
        Ok(None)
    } else {
        Ok(Some(rows.swap_remove(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_keys_round_trip() {
        let mut dict = TaggedDict::new();
        dict.set_numbered(
            "View",
            &[
                "//depot/main/... //client/...".to_string(),
                "-//depot/main/secret/... //client/secret/...".to_string(),
            ],
        );
        assert_eq!(
            dict.get_numbered("View"),
            vec![
                "//depot/main/... //client/...".to_string(),
                "-//depot/main/secret/... //client/secret/...".to_string(),
            ]
        );

        // Shrinking the list must drop stale numbered keys.
        dict.set_numbered("View", &["//depot/other/... //client/...".to_string()]);
        assert_eq!(dict.get_numbered("View").len(), 1);
        assert_eq!(dict.get("View1"), None);
    }

    #[test]
    fn test_get_int() {
        let mut dict = TaggedDict::new();
        dict.insert("change", "1234");
        dict.insert("status", "pending");
        assert_eq!(dict.get_int("change").unwrap(), Some(1234));
        assert_eq!(dict.get_int("missing").unwrap(), None);
        assert!(dict.get_int("status").is_err());
    }
}
