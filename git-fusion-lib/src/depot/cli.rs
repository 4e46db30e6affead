//! A [`Connection`] implementation that shells out to the depot's command
//! line client with tagged output, the same way the Git layer shells out
//! to `git` for streamed plumbing. Used by the depot-side triggers, which
//! run on the depot host where the CLI client is always present.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use std::io::Write as IoWrite;

use tracing::{debug, instrument};

use super::client::{Connection, Error, PrintSink, Result, TaggedDict};

/// Runs each command as `p4 -ztag ...`, parsing the record output.
pub struct CliConnection {
    /// Path to the CLI client executable.
    pub path_to_p4: PathBuf,

    /// Server address (`P4PORT`).
    pub port: String,

    user: String,
    client: RefCell<Option<String>>,
    client_root: RefCell<Option<PathBuf>>,
}

impl std::fmt::Debug for CliConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<CliConnection port={:?} user={:?} client={:?}>",
            self.port,
            self.user,
            self.client.borrow()
        )
    }
}

impl CliConnection {
    /// Construct for the given server address and user.
    pub fn new(path_to_p4: PathBuf, port: &str, user: &str) -> Self {
        CliConnection {
            path_to_p4,
            port: port.to_string(),
            user: user.to_string(),
            client: RefCell::new(None),
            client_root: RefCell::new(None),
        }
    }

    fn base_command(&self, tagged: bool) -> Command {
        let mut command = Command::new(&self.path_to_p4);
        if tagged {
            command.arg("-ztag");
        }
        command.arg("-p").arg(&self.port);
        command.arg("-u").arg(&self.user);
        if let Some(client) = self.client.borrow().as_ref() {
            command.arg("-c").arg(client);
        }
        command
    }

    fn run_capture(
        &self,
        command_name: &str,
        args: &[&str],
        input: Option<&[u8]>,
        tagged: bool,
    ) -> Result<Vec<u8>> {
        let mut command = self.base_command(tagged);
        command.arg(command_name);
        command.args(args);
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| Error::CommandFailed {
            command: command_name.to_string(),
            message: format!("could not spawn client: {err}"),
        })?;
        if let Some(input) = input {
            child
                .stdin
                .take()
                .expect("child stdin was requested piped")
                .write_all(input)
                .map_err(|err| Error::CommandFailed {
                    command: command_name.to_string(),
                    message: format!("could not write form: {err}"),
                })?;
        }
        let output = child.wait_with_output().map_err(|err| Error::CommandFailed {
            command: command_name.to_string(),
            message: format!("could not collect output: {err}"),
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        // "No such file(s)" and friends are empty results, not failures.
        if !output.status.success() && !is_expected_empty(&stderr) {
            return Err(Error::CommandFailed {
                command: command_name.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        debug!(command = command_name, bytes = output.stdout.len(), "cli command complete");
        Ok(output.stdout)
    }
}

fn is_expected_empty(stderr: &str) -> bool {
    stderr.contains("no such file(s)")
        || stderr.contains("file(s) not in client view")
        || stderr.contains("no such counter")
        || stderr.contains("not opened on this client")
}

/// Parse `-ztag` record output: `... key value` lines, records separated
/// by blank lines.
fn parse_ztag(stdout: &[u8]) -> Vec<TaggedDict> {
    let text = String::from_utf8_lossy(stdout);
    let mut records = Vec::new();
    let mut current: BTreeMap<String, String> = BTreeMap::new();
    for line in text.lines() {
        if line.is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current).into_iter().collect());
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("... ") {
            match rest.split_once(' ') {
                Some((key, value)) => {
                    current.insert(key.to_string(), value.to_string());
                }
                None => {
                    current.insert(rest.to_string(), String::new());
                }
            }
        }
    }
    if !current.is_empty() {
        records.push(current.into_iter().collect());
    }
    records
}

/// Render a tagged form as spec-file text for `-i` input: numbered keys
/// collapse back into multi-line fields.
fn render_spec_form(form: &TaggedDict) -> Vec<u8> {
    let mut list_fields: BTreeMap<String, Vec<(usize, String)>> = BTreeMap::new();
    let mut scalar_fields: Vec<(String, String)> = Vec::new();
    for (key, value) in form.iter() {
        let digits_at = key.find(|c: char| c.is_ascii_digit());
        match digits_at {
            Some(pos) if key[pos..].chars().all(|c| c.is_ascii_digit()) && pos > 0 => {
                let field = key[..pos].to_string();
                let index: usize = key[pos..].parse().unwrap_or(0);
                list_fields
                    .entry(field)
                    .or_default()
                    .push((index, value.to_string()));
            }
            _ => scalar_fields.push((key.to_string(), value.to_string())),
        }
    }
    let mut out = String::new();
    for (key, value) in scalar_fields {
        if value.contains('\n') {
            out.push_str(&format!("{key}:\n"));
            for line in value.lines() {
                out.push_str(&format!("\t{line}\n"));
            }
        } else {
            out.push_str(&format!("{key}: {value}\n"));
        }
        out.push('\n');
    }
    for (field, mut values) in list_fields {
        values.sort_by_key(|(index, _)| *index);
        out.push_str(&format!("{field}:\n"));
        for (_, value) in values {
            out.push_str(&format!("\t{value}\n"));
        }
        out.push('\n');
    }
    out.into_bytes()
}

impl Connection for CliConnection {
    #[instrument(skip(self))]
    fn run_tagged(&self, command: &str, args: &[&str]) -> Result<Vec<TaggedDict>> {
        let stdout = self.run_capture(command, args, None, true)?;
        Ok(parse_ztag(&stdout))
    }

    #[instrument(skip(self, input))]
    fn run_tagged_with_input(
        &self,
        command: &str,
        args: &[&str],
        input: &TaggedDict,
    ) -> Result<Vec<TaggedDict>> {
        let form = render_spec_form(input);
        let stdout = self.run_capture(command, args, Some(&form), true)?;
        Ok(parse_ztag(&stdout))
    }

    fn print(&self, path_revs: &[String], sink: &mut dyn PrintSink) -> Result<()> {
        for path_rev in path_revs {
            let (path, rev) = match path_rev.rsplit_once('#') {
                Some((path, rev)) => (path.to_string(), rev.parse().unwrap_or(0)),
                None => (path_rev.clone(), 0),
            };
            let stdout = self.run_capture("print", &["-q", path_rev], None, false)?;
            if stdout.is_empty() {
                continue;
            }
            sink.file(&path, rev, &stdout)?;
        }
        Ok(())
    }

    fn user(&self) -> String {
        self.user.clone()
    }

    fn client(&self) -> Option<String> {
        self.client.borrow().clone()
    }

    fn set_client(&self, client: &str) {
        *self.client.borrow_mut() = Some(client.to_string());
        *self.client_root.borrow_mut() = None;
    }

    fn client_root(&self) -> Option<PathBuf> {
        if let Some(root) = self.client_root.borrow().as_ref() {
            return Some(root.clone());
        }
        let client = self.client.borrow().clone()?;
        let row = self
            .run_tagged("client", &["-o", &client])
            .ok()?
            .into_iter()
            .next()?;
        let root = PathBuf::from(row.get("Root")?);
        *self.client_root.borrow_mut() = Some(root.clone());
        Some(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ztag() {
        let stdout = b"... change 42\n... status pending\n\n... change 43\n... status submitted\n";
        let records = parse_ztag(stdout);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("change"), Some("42"));
        assert_eq!(records[1].get("status"), Some("submitted"));
    }

    #[test]
    fn test_render_spec_form() {
        let mut form = TaggedDict::new();
        form.insert("Client", "my-client");
        form.insert("Description", "line one\nline two");
        form.set_numbered(
            "View",
            &[
                "//depot/... //my-client/...".to_string(),
                "-//depot/x/... //my-client/x/...".to_string(),
            ],
        );
        let text = String::from_utf8(render_spec_form(&form)).unwrap();
        assert!(text.contains("Client: my-client\n"));
        assert!(text.contains("Description:\n\tline one\n\tline two\n"));
        assert!(text.contains("View:\n\t//depot/... //my-client/...\n\t-//depot/x/... //my-client/x/...\n"));
    }

    #[test]
    fn test_expected_empty_detection() {
        assert!(is_expected_empty("//depot/nothing/... - no such file(s).\n"));
        assert!(!is_expected_empty("Perforce password (P4PASSWD) invalid or unset.\n"));
    }
}
