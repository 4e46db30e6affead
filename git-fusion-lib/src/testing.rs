//! Testing utilities. This module is only included in the crate when
//! building in test mode or when consumers opt in; the hermetic depot
//! below implements the whole [`Connection`] contract in memory so the
//! lock, mirror, copier, and trigger protocols are testable without a
//! depot server.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::view_map::pattern_matches;
use crate::depot::client::{Connection, Error, PrintSink, Result, TaggedDict};
use crate::git::{GitFileMode, GitRepo, GitRunner, Sha1};

/// One stored revision of one depot file.
#[derive(Clone, Debug)]
struct FileRev {
    rev: u64,
    change_num: u64,
    action: String,
    filetype: String,
    content: Vec<u8>,
    /// Integration source, when the revision came from an integ.
    source: Option<(String, u64)>,
}

/// A file opened in a pending changelist.
#[derive(Clone, Debug)]
struct OpenedFile {
    depot_path: String,
    action: String,
    source: Option<(String, u64)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ChangeStatus {
    Pending,
    Submitted,
}

#[derive(Clone, Debug)]
struct ChangeRecord {
    user: String,
    client: Option<String>,
    description: String,
    status: ChangeStatus,
    opened: Vec<OpenedFile>,
    time: i64,
}

#[derive(Debug, Default)]
struct DepotState {
    counters: BTreeMap<String, String>,
    users: BTreeMap<String, TaggedDict>,
    clients: BTreeMap<String, TaggedDict>,
    files: BTreeMap<String, Vec<FileRev>>,
    changes: BTreeMap<u64, ChangeRecord>,
    next_change: u64,
    /// (user, path pattern, perm). Empty table means everyone may write.
    protects: Vec<(String, String, String)>,
}

impl DepotState {
    fn head(&self, depot_path: &str) -> Option<&FileRev> {
        self.files.get(depot_path).and_then(|revs| revs.last())
    }

    fn rev_at_change(&self, depot_path: &str, change_num: u64) -> Option<&FileRev> {
        self.files.get(depot_path).and_then(|revs| {
            revs.iter()
                .rev()
                .find(|file_rev| file_rev.change_num <= change_num)
        })
    }

    fn rev(&self, depot_path: &str, rev: u64) -> Option<&FileRev> {
        self.files
            .get(depot_path)
            .and_then(|revs| revs.iter().find(|file_rev| file_rev.rev == rev))
    }
}

/// A hermetic depot. Clone-free: connections share state through an
/// `Arc`, so one test can hold several connections as several users.
#[derive(Clone, Debug)]
pub struct InMemoryDepot {
    state: Arc<Mutex<DepotState>>,
    workspace_root: Arc<tempfile::TempDir>,
    clock: Arc<AtomicI64>,
}

impl Default for InMemoryDepot {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDepot {
    /// Construct an empty depot.
    pub fn new() -> Self {
        let mut state = DepotState::default();
        state.next_change = 1;
        InMemoryDepot {
            state: Arc::new(Mutex::new(state)),
            workspace_root: Arc::new(
                tempfile::tempdir().expect("creating depot workspace root"),
            ),
            clock: Arc::new(AtomicI64::new(1_600_000_000)),
        }
    }

    /// Open a connection as `user`, bound to no client.
    pub fn connect(&self, user: &str) -> InMemoryConnection {
        InMemoryConnection {
            depot: self.clone(),
            user: user.to_string(),
            client: Mutex::new(None),
        }
    }

    /// Open a connection bound to a client workspace, creating the client
    /// with a scratch root if it does not exist.
    pub fn connect_with_client(&self, user: &str, client: &str) -> InMemoryConnection {
        {
            let mut state = self.state.lock().expect("depot state lock");
            if !state.clients.contains_key(client) {
                let root = self.workspace_root.path().join(client);
                let mut spec = TaggedDict::new();
                spec.insert("Client", client);
                spec.insert("Root", root.display().to_string());
                spec.insert("Access", "set");
                state.clients.insert(client.to_string(), spec);
            }
        }
        let conn = self.connect(user);
        conn.set_client(client);
        conn
    }

    /// Create a user spec with an empty reviews list.
    pub fn create_user(&self, user: &str) {
        let mut state = self.state.lock().expect("depot state lock");
        let mut spec = TaggedDict::new();
        spec.insert("User", user);
        spec.insert("Email", format!("{user}@depot"));
        state.users.entry(user.to_string()).or_insert(spec);
    }

    /// Create a user spec with an email address, for author lookup tests.
    pub fn create_user_with_email(&self, user: &str, email: &str) {
        let mut state = self.state.lock().expect("depot state lock");
        let mut spec = TaggedDict::new();
        spec.insert("User", user);
        spec.insert("Email", email);
        state.users.insert(user.to_string(), spec);
    }

    /// Install a protections line. Once any line exists, access defaults
    /// to none and must be granted explicitly.
    pub fn add_protects(&self, user: &str, path_pattern: &str, perm: &str) {
        let mut state = self.state.lock().expect("depot state lock");
        state
            .protects
            .push((user.to_string(), path_pattern.to_string(), perm.to_string()));
    }

    /// Directly submit a changelist of file contents, as a fixture.
    pub fn submit_change(
        &self,
        user: &str,
        files: &[(&str, Vec<u8>)],
        description: &str,
    ) -> u64 {
        let mut state = self.state.lock().expect("depot state lock");
        let change_num = state.next_change;
        state.next_change += 1;
        let time = self.clock.fetch_add(1, Ordering::SeqCst);
        for (depot_path, content) in files {
            let next_rev = state
                .head(depot_path)
                .map(|file_rev| file_rev.rev + 1)
                .unwrap_or(1);
            let action = if next_rev == 1 { "add" } else { "edit" };
            state
                .files
                .entry(depot_path.to_string())
                .or_default()
                .push(FileRev {
                    rev: next_rev,
                    change_num,
                    action: action.to_string(),
                    filetype: "text".to_string(),
                    content: content.clone(),
                    source: None,
                });
        }
        state.changes.insert(
            change_num,
            ChangeRecord {
                user: user.to_string(),
                client: None,
                description: description.to_string(),
                status: ChangeStatus::Submitted,
                opened: files
                    .iter()
                    .map(|(depot_path, _)| OpenedFile {
                        depot_path: depot_path.to_string(),
                        action: "add".to_string(),
                        source: None,
                    })
                    .collect(),
                time,
            },
        );
        change_num
    }

    /// Create a pending changelist with files opened for edit, as the
    /// trigger tests' stand-in for an in-flight non-Fusion submit.
    pub fn create_pending_change(&self, conn: &InMemoryConnection, paths: &[&str]) -> u64 {
        let mut state = self.state.lock().expect("depot state lock");
        let change_num = state.next_change;
        state.next_change += 1;
        let time = self.clock.fetch_add(1, Ordering::SeqCst);
        state.changes.insert(
            change_num,
            ChangeRecord {
                user: conn.user(),
                client: conn.client(),
                description: "pending non-Fusion change".to_string(),
                status: ChangeStatus::Pending,
                opened: paths
                    .iter()
                    .map(|depot_path| OpenedFile {
                        depot_path: depot_path.to_string(),
                        action: "edit".to_string(),
                        source: None,
                    })
                    .collect(),
                time,
            },
        );
        change_num
    }

    /// Whether a pending changelist with this number exists.
    pub fn has_pending_change(&self, change_num: u64) -> bool {
        let state = self.state.lock().expect("depot state lock");
        state
            .changes
            .get(&change_num)
            .map(|record| record.status == ChangeStatus::Pending)
            .unwrap_or(false)
    }

    /// Depot paths currently opened on the connection's pending changes.
    pub fn opened_files(&self, conn: &InMemoryConnection) -> Vec<String> {
        let state = self.state.lock().expect("depot state lock");
        state
            .changes
            .values()
            .filter(|record| {
                record.status == ChangeStatus::Pending && record.user == conn.user
            })
            .flat_map(|record| {
                record
                    .opened
                    .iter()
                    .map(|opened| opened.depot_path.clone())
            })
            .collect()
    }

    /// The head content of a depot file, for assertions.
    pub fn head_content(&self, depot_path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().expect("depot state lock");
        state.head(depot_path).and_then(|file_rev| {
            if file_rev.action.contains("delete") {
                None
            } else {
                Some(file_rev.content.clone())
            }
        })
    }

    /// The description of a submitted changelist, for assertions.
    pub fn change_description(&self, change_num: u64) -> Option<String> {
        let state = self.state.lock().expect("depot state lock");
        state
            .changes
            .get(&change_num)
            .map(|record| record.description.clone())
    }

    /// The owner of a changelist, for assertions.
    pub fn change_owner(&self, change_num: u64) -> Option<String> {
        let state = self.state.lock().expect("depot state lock");
        state
            .changes
            .get(&change_num)
            .map(|record| record.user.clone())
    }

    /// `(depot_path, action)` rows of a submitted changelist.
    pub fn change_files(&self, change_num: u64) -> Vec<(String, String)> {
        let state = self.state.lock().expect("depot state lock");
        let mut result = Vec::new();
        for (depot_path, revs) in &state.files {
            for file_rev in revs {
                if file_rev.change_num == change_num {
                    result.push((depot_path.clone(), file_rev.action.clone()));
                }
            }
        }
        result
    }

    /// Write `content` where the connection's client maps `depot_path`.
    pub fn write_client_file(
        &self,
        conn: &InMemoryConnection,
        depot_path: &str,
        content: &[u8],
    ) {
        crate::core::mirror::write_client_file(conn, depot_path, content)
            .expect("writing client file");
    }
}

/// One connection to an [`InMemoryDepot`].
pub struct InMemoryConnection {
    depot: InMemoryDepot,
    user: String,
    client: Mutex<Option<String>>,
}

impl std::fmt::Debug for InMemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<InMemoryConnection user={:?} client={:?}>",
            self.user,
            self.client.lock().expect("client lock")
        )
    }
}

/// Split `pattern[@rev]` / `pattern[#rev]` into the path pattern and its
/// revision specifier.
fn split_rev_spec(arg: &str) -> (&str, Option<&str>) {
    if let Some(at) = arg.find('@') {
        (&arg[..at], Some(&arg[at..]))
    } else if let Some(hash) = arg.find('#') {
        (&arg[..hash], Some(&arg[hash..]))
    } else {
        (arg, None)
    }
}

impl InMemoryConnection {
    fn with_state<T>(&self, f: impl FnOnce(&mut DepotState) -> T) -> T {
        let mut state = self.depot.state.lock().expect("depot state lock");
        f(&mut state)
    }

    fn local_path_for(&self, depot_path: &str) -> Option<PathBuf> {
        let root = self.client_root()?;
        Some(root.join(depot_path.trim_start_matches('/')))
    }

    fn cmd_counter(&self, args: &[&str]) -> Result<Vec<TaggedDict>> {
        match args {
            ["-u", name] => self.with_state(|state| {
                Ok(match state.counters.get(*name) {
                    Some(value) => {
                        let mut row = TaggedDict::new();
                        row.insert("counter", *name);
                        row.insert("value", value.clone());
                        vec![row]
                    }
                    None => Vec::new(),
                })
            }),
            ["-u", "-i", name] => self.with_state(|state| {
                let value: u64 = state
                    .counters
                    .get(*name)
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(0);
                let value = value + 1;
                state.counters.insert(name.to_string(), value.to_string());
                let mut row = TaggedDict::new();
                row.insert("counter", *name);
                row.insert("value", value.to_string());
                Ok(vec![row])
            }),
            ["-u", "-d", name] => self.with_state(|state| {
                state.counters.remove(*name);
                Ok(Vec::new())
            }),
            ["-u", name, value] => self.with_state(|state| {
                state.counters.insert(name.to_string(), value.to_string());
                Ok(Vec::new())
            }),
            _ => Err(Error::CommandFailed {
                command: "counter".to_string(),
                message: format!("unsupported arguments: {args:?}"),
            }),
        }
    }

    fn cmd_counters(&self, args: &[&str]) -> Result<Vec<TaggedDict>> {
        let pattern = match args {
            ["-u", "-e", pattern] => *pattern,
            _ => {
                return Err(Error::CommandFailed {
                    command: "counters".to_string(),
                    message: format!("unsupported arguments: {args:?}"),
                })
            }
        };
        self.with_state(|state| {
            let mut rows = Vec::new();
            for (name, value) in &state.counters {
                if pattern_matches(pattern, name) {
                    let mut row = TaggedDict::new();
                    row.insert("counter", name.clone());
                    row.insert("value", value.clone());
                    rows.push(row);
                }
            }
            Ok(rows)
        })
    }

    fn cmd_files(&self, args: &[&str]) -> Result<Vec<TaggedDict>> {
        let patterns: Vec<&str> = args
            .iter()
            .copied()
            .filter(|arg| !arg.starts_with('-'))
            .collect();
        self.with_state(|state| {
            let mut rows = Vec::new();
            for pattern_arg in patterns {
                let (pattern, rev_spec) = split_rev_spec(pattern_arg);
                match rev_spec {
                    Some(spec) if spec.starts_with("@=") => {
                        // Files touched by one changelist, pending or
                        // submitted.
                        let change_num: u64 =
                            spec[2..].parse().map_err(|_| Error::CommandFailed {
                                command: "files".to_string(),
                                message: format!("bad change spec {spec:?}"),
                            })?;
                        if let Some(record) = state.changes.get(&change_num) {
                            if record.status == ChangeStatus::Pending {
                                for opened in &record.opened {
                                    if !pattern_matches(pattern, &opened.depot_path) {
                                        continue;
                                    }
                                    let mut row = TaggedDict::new();
                                    row.insert("depotFile", opened.depot_path.clone());
                                    row.insert("action", opened.action.clone());
                                    row.insert("change", change_num.to_string());
                                    rows.push(row);
                                }
                                continue;
                            }
                        }
                        for (depot_path, revs) in &state.files {
                            if !pattern_matches(pattern, depot_path) {
                                continue;
                            }
                            for file_rev in revs {
                                if file_rev.change_num == change_num {
                                    rows.push(file_rev_row(depot_path, file_rev));
                                }
                            }
                        }
                    }
                    Some(spec) if spec.starts_with('@') => {
                        let change_num: u64 =
                            spec[1..].parse().map_err(|_| Error::CommandFailed {
                                command: "files".to_string(),
                                message: format!("bad change spec {spec:?}"),
                            })?;
                        for (depot_path, _) in state.files.clone() {
                            if !pattern_matches(pattern, &depot_path) {
                                continue;
                            }
                            if let Some(file_rev) = state.rev_at_change(&depot_path, change_num)
                            {
                                if !file_rev.action.contains("delete") {
                                    rows.push(file_rev_row(&depot_path, file_rev));
                                }
                            }
                        }
                    }
                    _ => {
                        for (depot_path, _) in state.files.clone() {
                            if !pattern_matches(pattern, &depot_path) {
                                continue;
                            }
                            if let Some(file_rev) = state.head(&depot_path) {
                                if !file_rev.action.contains("delete") {
                                    rows.push(file_rev_row(&depot_path, file_rev));
                                }
                            }
                        }
                    }
                }
            }
            Ok(rows)
        })
    }

    fn cmd_changes(&self, args: &[&str]) -> Result<Vec<TaggedDict>> {
        let limit_one = args.contains(&"-m1");
        let patterns: Vec<&str> = args
            .iter()
            .copied()
            .filter(|arg| !arg.starts_with('-'))
            .collect();
        self.with_state(|state| {
            let mut matched: BTreeMap<u64, TaggedDict> = BTreeMap::new();
            for pattern_arg in patterns {
                let (pattern, rev_spec) = split_rev_spec(pattern_arg);
                // `path#rev,#rev`: the change that created one revision.
                if let Some(spec) = rev_spec.filter(|spec| spec.starts_with('#')) {
                    let rev: u64 = spec
                        .trim_start_matches('#')
                        .split(",#")
                        .next()
                        .and_then(|rev| rev.parse().ok())
                        .unwrap_or(0);
                    if let Some(file_rev) = state.rev(pattern, rev) {
                        if let Some(record) = state.changes.get(&file_rev.change_num) {
                            matched.insert(
                                file_rev.change_num,
                                change_row(file_rev.change_num, record),
                            );
                        }
                    }
                    continue;
                }
                let (start, stop) = match rev_spec {
                    Some(spec) => {
                        let range = spec.trim_start_matches('@');
                        match range.split_once(',') {
                            Some((start, stop)) => {
                                let start: u64 = start.parse().unwrap_or(0);
                                let stop: u64 = if stop == "now" || stop == "#head" {
                                    u64::MAX
                                } else {
                                    stop.parse().unwrap_or(u64::MAX)
                                };
                                (start, stop)
                            }
                            None => (0, range.parse().unwrap_or(u64::MAX)),
                        }
                    }
                    None => (0, u64::MAX),
                };
                for (change_num, record) in &state.changes {
                    if record.status != ChangeStatus::Submitted {
                        continue;
                    }
                    if *change_num < start || *change_num > stop {
                        continue;
                    }
                    let touches = state.files.iter().any(|(depot_path, revs)| {
                        pattern_matches(pattern, depot_path)
                            && revs
                                .iter()
                                .any(|file_rev| file_rev.change_num == *change_num)
                    });
                    if touches {
                        matched.insert(*change_num, change_row(*change_num, record));
                    }
                }
            }
            let mut rows: Vec<TaggedDict> = matched.into_values().collect();
            rows.reverse();
            if limit_one {
                rows.truncate(1);
            }
            Ok(rows)
        })
    }

    fn cmd_describe(&self, args: &[&str]) -> Result<Vec<TaggedDict>> {
        let change_num: u64 = args
            .iter()
            .find(|arg| !arg.starts_with('-'))
            .and_then(|arg| arg.parse().ok())
            .ok_or_else(|| Error::CommandFailed {
                command: "describe".to_string(),
                message: "missing changelist number".to_string(),
            })?;
        self.with_state(|state| {
            let record = match state.changes.get(&change_num) {
                Some(record) => record.clone(),
                None => return Ok(Vec::new()),
            };
            let mut row = change_row(change_num, &record);
            let mut index = 0;
            for (depot_path, revs) in &state.files {
                for file_rev in revs {
                    if file_rev.change_num != change_num {
                        continue;
                    }
                    row.insert(format!("depotFile{index}"), depot_path.clone());
                    row.insert(format!("rev{index}"), file_rev.rev.to_string());
                    row.insert(format!("action{index}"), file_rev.action.clone());
                    row.insert(format!("type{index}"), file_rev.filetype.clone());
                    index += 1;
                }
            }
            Ok(vec![row])
        })
    }

    fn cmd_filelog(&self, args: &[&str]) -> Result<Vec<TaggedDict>> {
        let pattern_arg = args
            .iter()
            .find(|arg| !arg.starts_with('-'))
            .copied()
            .unwrap_or("//...");
        let (pattern, rev_spec) = split_rev_spec(pattern_arg);
        let change_num: Option<u64> = rev_spec
            .and_then(|spec| spec.strip_prefix("@="))
            .and_then(|change| change.parse().ok());
        self.with_state(|state| {
            let mut rows = Vec::new();
            for (depot_path, revs) in &state.files {
                if !pattern_matches(pattern, depot_path) {
                    continue;
                }
                for file_rev in revs {
                    if let Some(change_num) = change_num {
                        if file_rev.change_num != change_num {
                            continue;
                        }
                    }
                    let mut row = TaggedDict::new();
                    row.insert("depotFile", depot_path.clone());
                    row.insert("rev0", file_rev.rev.to_string());
                    row.insert("action0", file_rev.action.clone());
                    row.insert("change0", file_rev.change_num.to_string());
                    if let Some((source_path, source_rev)) = &file_rev.source {
                        row.insert("sourceFile0", format!("{source_path}#{source_rev}"));
                    }
                    rows.push(row);
                }
            }
            Ok(rows)
        })
    }

    fn cmd_open_file(&self, action: &str, args: &[&str]) -> Result<Vec<TaggedDict>> {
        let mut change_num: Option<u64> = None;
        let mut paths: Vec<&str> = Vec::new();
        let mut iter = args.iter().peekable();
        while let Some(arg) = iter.next() {
            match *arg {
                "-c" => {
                    change_num = iter.next().and_then(|value| value.parse().ok());
                }
                arg if arg.starts_with('-') => {}
                path => paths.push(path),
            }
        }
        let change_num = change_num.ok_or_else(|| Error::CommandFailed {
            command: action.to_string(),
            message: "missing -c changelist".to_string(),
        })?;
        self.with_state(|state| {
            for depot_path in &paths {
                if action == "delete" && state.head(depot_path).is_none() {
                    return Err(Error::CommandFailed {
                        command: "delete".to_string(),
                        message: format!("{depot_path} - file(s) not on client."),
                    });
                }
                let record =
                    state
                        .changes
                        .get_mut(&change_num)
                        .ok_or_else(|| Error::CommandFailed {
                            command: action.to_string(),
                            message: format!("change {change_num} unknown"),
                        })?;
                record.opened.push(OpenedFile {
                    depot_path: depot_path.to_string(),
                    action: action.to_string(),
                    source: None,
                });
            }
            Ok(Vec::new())
        })
    }

    fn cmd_integ(&self, args: &[&str]) -> Result<Vec<TaggedDict>> {
        let mut change_num: Option<u64> = None;
        let mut paths: Vec<&str> = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match *arg {
                "-c" => change_num = iter.next().and_then(|value| value.parse().ok()),
                arg if arg.starts_with('-') => {}
                path => paths.push(path),
            }
        }
        let (source_arg, dest) = match paths.as_slice() {
            [source, dest] => (*source, *dest),
            _ => {
                return Err(Error::CommandFailed {
                    command: "integ".to_string(),
                    message: format!("expected source and dest, got {paths:?}"),
                })
            }
        };
        let change_num = change_num.ok_or_else(|| Error::CommandFailed {
            command: "integ".to_string(),
            message: "missing -c changelist".to_string(),
        })?;
        let (source_path, source_rev_spec) = split_rev_spec(source_arg);
        self.with_state(|state| {
            let source_rev = match source_rev_spec {
                Some(spec) if spec.starts_with('#') => spec[1..].parse().ok(),
                Some(spec) if spec.starts_with('@') => spec[1..]
                    .parse()
                    .ok()
                    .and_then(|change| state.rev_at_change(source_path, change))
                    .map(|file_rev| file_rev.rev),
                _ => state.head(source_path).map(|file_rev| file_rev.rev),
            };
            let source_rev = match source_rev {
                Some(source_rev) => source_rev,
                None => {
                    return Err(Error::CommandFailed {
                        command: "integ".to_string(),
                        message: format!("{source_path} - no such file(s)."),
                    })
                }
            };
            let dest_exists = state.head(dest).map(|h| !h.action.contains("delete"));
            let action = match dest_exists {
                Some(true) => "integrate",
                _ => "branch",
            };
            let record =
                state
                    .changes
                    .get_mut(&change_num)
                    .ok_or_else(|| Error::CommandFailed {
                        command: "integ".to_string(),
                        message: format!("change {change_num} unknown"),
                    })?;
            record.opened.push(OpenedFile {
                depot_path: dest.to_string(),
                action: action.to_string(),
                source: Some((source_path.to_string(), source_rev)),
            });
            let mut row = TaggedDict::new();
            row.insert("depotFile", dest);
            row.insert("fromFile", source_path);
            row.insert("action", action);
            Ok(vec![row])
        })
    }

    fn cmd_submit(&self, args: &[&str]) -> Result<Vec<TaggedDict>> {
        let change_num: u64 = args
            .iter()
            .skip_while(|arg| **arg != "-c")
            .nth(1)
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| Error::CommandFailed {
                command: "submit".to_string(),
                message: "missing -c changelist".to_string(),
            })?;
        let time = self.depot.clock.fetch_add(1, Ordering::SeqCst);
        self.with_state(|state| {
            let record = state
                .changes
                .get(&change_num)
                .cloned()
                .ok_or_else(|| Error::CommandFailed {
                    command: "submit".to_string(),
                    message: format!("change {change_num} unknown"),
                })?;
            if record.opened.is_empty() {
                return Err(Error::CommandFailed {
                    command: "submit".to_string(),
                    message: "No files to submit.".to_string(),
                });
            }
            let client_root = record
                .client
                .as_ref()
                .and_then(|client| state.clients.get(client))
                .and_then(|spec| spec.get("Root").map(PathBuf::from));
            for opened in record.opened.clone() {
                let next_rev = state
                    .head(&opened.depot_path)
                    .map(|file_rev| file_rev.rev + 1)
                    .unwrap_or(1);
                let (content, filetype) = match opened.action.as_str() {
                    "delete" => (Vec::new(), "text".to_string()),
                    "branch" | "integrate" => {
                        let source = opened
                            .source
                            .as_ref()
                            .and_then(|(source_path, source_rev)| {
                                state.rev(source_path, *source_rev).cloned()
                            })
                            .ok_or_else(|| Error::CommandFailed {
                                command: "submit".to_string(),
                                message: format!(
                                    "integration source missing for {}",
                                    opened.depot_path
                                ),
                            })?;
                        (source.content, source.filetype)
                    }
                    _ => {
                        let root = client_root.as_ref().ok_or(Error::NotConnected)?;
                        let local =
                            root.join(opened.depot_path.trim_start_matches('/'));
                        let content = std::fs::read(&local).map_err(|source| {
                            Error::ReadWorkspaceFile {
                                source,
                                path: local,
                            }
                        })?;
                        (content, "text".to_string())
                    }
                };
                state
                    .files
                    .entry(opened.depot_path.clone())
                    .or_default()
                    .push(FileRev {
                        rev: next_rev,
                        change_num,
                        action: opened.action.clone(),
                        filetype,
                        content,
                        source: opened.source.clone(),
                    });
            }
            let record = state
                .changes
                .get_mut(&change_num)
                .expect("checked above");
            record.status = ChangeStatus::Submitted;
            record.time = time;
            let mut row = TaggedDict::new();
            row.insert("submittedChange", change_num.to_string());
            Ok(vec![row])
        })
    }

    fn cmd_change(&self, args: &[&str], input: Option<&TaggedDict>) -> Result<Vec<TaggedDict>> {
        match (args, input) {
            (["-i"] | ["-i", "-f"], Some(form)) => {
                let change_field = form.get("Change").unwrap_or("new");
                if change_field == "new" {
                    let user = self.user();
                    let client = self.client();
                    let description =
                        form.get("Description").unwrap_or_default().to_string();
                    let time = self.depot.clock.fetch_add(1, Ordering::SeqCst);
                    self.with_state(|state| {
                        let change_num = state.next_change;
                        state.next_change += 1;
                        state.changes.insert(
                            change_num,
                            ChangeRecord {
                                user,
                                client,
                                description,
                                status: ChangeStatus::Pending,
                                opened: Vec::new(),
                                time,
                            },
                        );
                        let mut row = TaggedDict::new();
                        row.insert("change", change_num.to_string());
                        Ok(vec![row])
                    })
                } else {
                    let change_num: u64 =
                        change_field.parse().map_err(|_| Error::CommandFailed {
                            command: "change".to_string(),
                            message: format!("bad change number {change_field:?}"),
                        })?;
                    let description = form.get("Description").map(str::to_string);
                    let user = form.get("User").map(str::to_string);
                    self.with_state(|state| {
                        let record = state.changes.get_mut(&change_num).ok_or_else(|| {
                            Error::CommandFailed {
                                command: "change".to_string(),
                                message: format!("change {change_num} unknown"),
                            }
                        })?;
                        if let Some(description) = description {
                            record.description = description;
                        }
                        if let Some(user) = user {
                            record.user = user;
                        }
                        let mut row = TaggedDict::new();
                        row.insert("change", change_num.to_string());
                        Ok(vec![row])
                    })
                }
            }
            (["-o", change_arg], None) => {
                let change_num: u64 = change_arg.parse().map_err(|_| Error::CommandFailed {
                    command: "change".to_string(),
                    message: format!("bad change number {change_arg:?}"),
                })?;
                self.with_state(|state| {
                    Ok(match state.changes.get(&change_num) {
                        Some(record) => {
                            let mut row = TaggedDict::new();
                            row.insert("Change", change_num.to_string());
                            row.insert("User", record.user.clone());
                            row.insert("Description", record.description.clone());
                            vec![row]
                        }
                        None => Vec::new(),
                    })
                })
            }
            (["-d", change_arg], None) => {
                let change_num: u64 = change_arg.parse().map_err(|_| Error::CommandFailed {
                    command: "change".to_string(),
                    message: format!("bad change number {change_arg:?}"),
                })?;
                self.with_state(|state| {
                    if let Some(record) = state.changes.get(&change_num) {
                        if record.status == ChangeStatus::Pending {
                            state.changes.remove(&change_num);
                        }
                    }
                    Ok(Vec::new())
                })
            }
            _ => Err(Error::CommandFailed {
                command: "change".to_string(),
                message: format!("unsupported arguments: {args:?}"),
            }),
        }
    }

    fn cmd_revert(&self, args: &[&str]) -> Result<Vec<TaggedDict>> {
        let change_num: Option<u64> = args
            .iter()
            .skip_while(|arg| **arg != "-c")
            .nth(1)
            .and_then(|value| value.parse().ok());
        self.with_state(|state| {
            if let Some(change_num) = change_num {
                if let Some(record) = state.changes.get_mut(&change_num) {
                    record.opened.clear();
                }
            }
            Ok(Vec::new())
        })
    }

    fn cmd_spec_fetch(
        &self,
        kind: &str,
        name: &str,
    ) -> Result<Vec<TaggedDict>> {
        self.with_state(|state| {
            let table = match kind {
                "user" => &state.users,
                "client" => &state.clients,
                _ => unreachable!("spec kinds are fixed"),
            };
            Ok(table.get(name).cloned().into_iter().collect())
        })
    }

    fn cmd_spec_save(&self, kind: &str, form: &TaggedDict) -> Result<Vec<TaggedDict>> {
        self.with_state(|state| {
            match kind {
                "user" => {
                    let name = form.expect("user", "User")?.to_string();
                    state.users.insert(name, form.clone());
                }
                "client" => {
                    let name = form.expect("client", "Client")?.to_string();
                    let mut form = form.clone();
                    if form.get("Access").is_none() {
                        form.insert("Access", "set");
                    }
                    state.clients.insert(name, form);
                }
                _ => unreachable!("spec kinds are fixed"),
            }
            Ok(Vec::new())
        })
    }

    fn cmd_protects(&self, args: &[&str]) -> Result<Vec<TaggedDict>> {
        let (user, path) = match args {
            ["-u", user, path] => (*user, *path),
            _ => {
                return Err(Error::CommandFailed {
                    command: "protects".to_string(),
                    message: format!("unsupported arguments: {args:?}"),
                })
            }
        };
        self.with_state(|state| {
            if state.protects.is_empty() {
                let mut row = TaggedDict::new();
                row.insert("perm", "super");
                return Ok(vec![row]);
            }
            let mut rows = Vec::new();
            for (line_user, pattern, perm) in &state.protects {
                if line_user == user && pattern_matches(pattern, path) {
                    let mut row = TaggedDict::new();
                    row.insert("perm", perm.clone());
                    rows.push(row);
                }
            }
            Ok(rows)
        })
    }

    fn cmd_users(&self) -> Result<Vec<TaggedDict>> {
        self.with_state(|state| Ok(state.users.values().cloned().collect()))
    }
}

fn file_rev_row(depot_path: &str, file_rev: &FileRev) -> TaggedDict {
    let mut row = TaggedDict::new();
    row.insert("depotFile", depot_path);
    row.insert("rev", file_rev.rev.to_string());
    row.insert("action", file_rev.action.clone());
    row.insert("type", file_rev.filetype.clone());
    row.insert("change", file_rev.change_num.to_string());
    row
}

fn change_row(change_num: u64, record: &ChangeRecord) -> TaggedDict {
    let mut row = TaggedDict::new();
    row.insert("change", change_num.to_string());
    row.insert("desc", record.description.clone());
    row.insert("user", record.user.clone());
    row.insert("time", record.time.to_string());
    row.insert(
        "status",
        match record.status {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Submitted => "submitted",
        },
    );
    row
}

impl Connection for InMemoryConnection {
    fn run_tagged(&self, command: &str, args: &[&str]) -> Result<Vec<TaggedDict>> {
        match command {
            "counter" => self.cmd_counter(args),
            "counters" => self.cmd_counters(args),
            "files" => self.cmd_files(args),
            "changes" => self.cmd_changes(args),
            "describe" => self.cmd_describe(args),
            "filelog" => self.cmd_filelog(args),
            "add" | "edit" | "delete" => self.cmd_open_file(command, args),
            "integ" => self.cmd_integ(args),
            "resolve" => Ok(Vec::new()),
            "submit" => self.cmd_submit(args),
            "change" => self.cmd_change(args, None),
            "revert" => self.cmd_revert(args),
            "protects" => self.cmd_protects(args),
            "users" => self.cmd_users(),
            "user" => match args {
                ["-o", name] => self.cmd_spec_fetch("user", name),
                _ => Err(Error::CommandFailed {
                    command: "user".to_string(),
                    message: format!("unsupported arguments: {args:?}"),
                }),
            },
            "client" => match args {
                ["-o", name] => self.cmd_spec_fetch("client", name),
                ["-d", name] => self.with_state(|state| {
                    state.clients.remove(*name);
                    Ok(Vec::new())
                }),
                _ => Err(Error::CommandFailed {
                    command: "client".to_string(),
                    message: format!("unsupported arguments: {args:?}"),
                }),
            },
            other => Err(Error::CommandFailed {
                command: other.to_string(),
                message: "unknown command".to_string(),
            }),
        }
    }

    fn run_tagged_with_input(
        &self,
        command: &str,
        args: &[&str],
        input: &TaggedDict,
    ) -> Result<Vec<TaggedDict>> {
        match command {
            "change" => self.cmd_change(args, Some(input)),
            "user" => self.cmd_spec_save("user", input),
            "client" => self.cmd_spec_save("client", input),
            other => Err(Error::CommandFailed {
                command: other.to_string(),
                message: "unknown form command".to_string(),
            }),
        }
    }

    fn print(&self, path_revs: &[String], sink: &mut dyn PrintSink) -> Result<()> {
        for path_rev in path_revs {
            let (pattern, rev_spec) = split_rev_spec(path_rev);
            let hits = self.with_state(|state| {
                let mut hits = Vec::new();
                for (depot_path, _) in state.files.clone() {
                    if !pattern_matches(pattern, &depot_path) {
                        continue;
                    }
                    let file_rev = match rev_spec {
                        Some(spec) if spec.starts_with('#') => {
                            let rev: u64 = spec[1..].parse().unwrap_or(0);
                            state.rev(&depot_path, rev).cloned()
                        }
                        Some(spec) if spec.starts_with('@') => {
                            let change: u64 = spec[1..].parse().unwrap_or(u64::MAX);
                            state.rev_at_change(&depot_path, change).cloned()
                        }
                        _ => state.head(&depot_path).cloned(),
                    };
                    if let Some(file_rev) = file_rev {
                        if !file_rev.action.contains("delete") {
                            hits.push((depot_path, file_rev.rev, file_rev.content));
                        }
                    }
                }
                hits
            });
            for (depot_path, rev, content) in hits {
                sink.file(&depot_path, rev, &content)?;
            }
        }
        Ok(())
    }

    fn user(&self) -> String {
        self.user.clone()
    }

    fn client(&self) -> Option<String> {
        self.client.lock().expect("client lock").clone()
    }

    fn set_client(&self, client: &str) {
        *self.client.lock().expect("client lock") = Some(client.to_string());
    }

    fn client_root(&self) -> Option<PathBuf> {
        let client = self.client()?;
        self.with_state(|state| {
            state
                .clients
                .get(&client)
                .and_then(|spec| spec.get("Root").map(PathBuf::from))
        })
    }
}

// ---------------------------------------------------------------------
// Git scratch repositories
// ---------------------------------------------------------------------

/// A throwaway Git repository whose commits are built directly in the
/// object database, no working copy required.
pub struct ScratchGitRepo {
    _dir: tempfile::TempDir,
    /// Path to the repository.
    pub repo_path: PathBuf,
    commit_count: std::cell::Cell<i64>,
}

impl ScratchGitRepo {
    /// Create an empty repository.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("creating scratch git dir");
        let repo_path = dir.path().join("repo");
        git2::Repository::init(&repo_path).expect("initializing scratch git repo");
        ScratchGitRepo {
            _dir: dir,
            repo_path,
            commit_count: std::cell::Cell::new(0),
        }
    }

    /// Create a commit of plain files, returning its sha.
    pub fn commit(&self, parents: &[Sha1], files: &[(&str, &str)]) -> Sha1 {
        let entries: Vec<(String, Vec<u8>, GitFileMode)> = files
            .iter()
            .map(|(path, content)| {
                (
                    path.to_string(),
                    content.as_bytes().to_vec(),
                    GitFileMode::Blob,
                )
            })
            .collect();
        self.commit_entries(parents, &entries)
    }

    /// Create a commit with explicit file modes (symlinks, executables).
    pub fn commit_entries(
        &self,
        parents: &[Sha1],
        entries: &[(String, Vec<u8>, GitFileMode)],
    ) -> Sha1 {
        let repo = git2::Repository::open(&self.repo_path).expect("opening scratch repo");
        let tree_oid = build_tree(&repo, entries);
        let tree = repo.find_tree(tree_oid).expect("finding built tree");
        let n = self.commit_count.get() + 1;
        self.commit_count.set(n);
        let signature = git2::Signature::new(
            "Test Author",
            "author@example.com",
            &git2::Time::new(1_400_000_000 + n, 0),
        )
        .expect("creating signature");
        let parent_commits: Vec<git2::Commit> = parents
            .iter()
            .map(|parent| {
                repo.find_commit((*parent).into())
                    .expect("finding parent commit")
            })
            .collect();
        let parent_refs: Vec<&git2::Commit> = parent_commits.iter().collect();
        let oid = repo
            .commit(
                None,
                &signature,
                &signature,
                &format!("commit {n}"),
                &tree,
                &parent_refs,
            )
            .expect("creating commit");
        Sha1::from(oid)
    }

    /// Point a branch ref at a commit.
    pub fn set_ref(&self, ref_name: &str, sha1: Sha1) {
        let repo = git2::Repository::open(&self.repo_path).expect("opening scratch repo");
        repo.reference(ref_name, sha1.into(), true, "test")
            .expect("setting ref");
    }

    /// Open the scratch repository through the crate's typed wrapper.
    pub fn git_repo(&self) -> GitRepo {
        GitRepo::open(&self.repo_path).expect("opening scratch repo")
    }

    /// A plumbing runner working inside the scratch repository. `PATH`
    /// rides along so the subprocess can be resolved from a cleared
    /// environment.
    pub fn git_runner(&self) -> GitRunner {
        let mut env = std::collections::HashMap::new();
        for key in ["PATH", "HOME"] {
            if let Some(value) = std::env::var_os(key) {
                env.insert(key.into(), value);
            }
        }
        GitRunner {
            path_to_git: PathBuf::from("git"),
            working_directory: self.repo_path.clone(),
            env,
        }
    }
}

impl Default for ScratchGitRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn build_tree(repo: &git2::Repository, entries: &[(String, Vec<u8>, GitFileMode)]) -> git2::Oid {
    // Group by leading path component; blobs at this level go straight
    // into the builder, subdirectories recurse.
    let mut here: Vec<(&str, &[u8], GitFileMode)> = Vec::new();
    let mut subdirs: BTreeMap<&str, Vec<(String, Vec<u8>, GitFileMode)>> = BTreeMap::new();
    for (path, content, mode) in entries {
        match path.split_once('/') {
            None => here.push((path, content, *mode)),
            Some((dir, rest)) => subdirs.entry(dir).or_default().push((
                rest.to_string(),
                content.clone(),
                *mode,
            )),
        }
    }
    let mut builder = repo.treebuilder(None).expect("creating tree builder");
    for (name, content, mode) in here {
        let blob = repo.blob(content).expect("writing blob");
        builder
            .insert(name, blob, mode.into())
            .expect("inserting blob entry");
    }
    for (dir, dir_entries) in subdirs {
        let sub_oid = build_tree(repo, &dir_entries);
        builder
            .insert(dir, sub_oid, i32::from(GitFileMode::Tree))
            .expect("inserting tree entry");
    }
    builder.write().expect("writing tree")
}

// ---------------------------------------------------------------------
// Context fixtures
// ---------------------------------------------------------------------

/// The default repo config used by context fixtures: one fully-populated
/// `master` branch over `//depot/main/...`.
pub const TEST_REPO_CONFIG: &str = "\
[master]
git-branch-name = master
view = //depot/main/... ...
";

/// Build a context over the in-memory depot, branch dict preloaded from
/// [`TEST_REPO_CONFIG`], sequential id generation.
pub fn test_context(depot: &InMemoryDepot, repo: &str) -> crate::core::context::Context {
    use crate::core::context::{ConnectionSet, Context, ContextConfig, IdGenerator};

    let mut config = ContextConfig::new(repo, "test-server");
    config.id_gen = IdGenerator::sequential();
    let conns = ConnectionSet {
        repo: Box::new(depot.connect_with_client(
            crate::depot::spec::GF_USER,
            &format!("git-fusion-{repo}-client"),
        )),
        mirror: Box::new(depot.connect_with_client(
            crate::depot::spec::GF_USER,
            &format!("git-fusion-{repo}-mirror"),
        )),
        reviews: Box::new(depot.connect(crate::depot::spec::GF_USER)),
        reviews_union: Box::new(depot.connect(crate::depot::spec::GF_USER)),
    };
    let ctx = Context::new(config, conns).expect("creating test context");
    let repo_config =
        crate::core::config::RepoConfig::parse(TEST_REPO_CONFIG).expect("parsing test config");
    *ctx.branch_dict.borrow_mut() =
        crate::core::branch::dict_from_config(&repo_config).expect("building branch dict");
    *ctx.repo_config.borrow_mut() = repo_config;
    ctx
}

/// [`test_context`] plus an attached scratch Git repository.
pub fn test_context_with_git(
    depot: &InMemoryDepot,
    repo: &str,
    scratch: &ScratchGitRepo,
) -> crate::core::context::Context {
    test_context(depot, repo).with_git(scratch.git_repo(), scratch.git_runner())
}

/// Shorthand for building a `Sha1` from a repeated hex byte in tests.
pub fn sha1_of_byte(byte: &str) -> Sha1 {
    byte.repeat(20).parse().expect("building test sha")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use maplit::btreemap;

    use super::*;

    #[test]
    fn test_fake_depot_change_ranges() {
        let depot = InMemoryDepot::new();
        let one = depot.submit_change("alice", &[("//depot/main/f", b"1".to_vec())], "add f");
        let two = depot.submit_change("alice", &[("//depot/main/f", b"2".to_vec())], "edit f");
        let conn = depot.connect("git-fusion-user");

        let rows = conn
            .run_tagged("changes", &["//depot/main/...@1,now"])
            .unwrap();
        let by_change: BTreeMap<u64, String> = rows
            .iter()
            .map(|row| {
                (
                    row.get_int("change").unwrap().unwrap(),
                    row.get("desc").unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            by_change,
            btreemap! {
                one => "add f".to_string(),
                two => "edit f".to_string(),
            }
        );

        // A bounded range excludes later changes.
        let rows = conn
            .run_tagged("changes", &[&format!("//depot/main/...@1,{one}")])
            .unwrap();
        assert_eq!(rows.len(), 1);

        // `-m1` keeps only the newest.
        let rows = conn
            .run_tagged("changes", &["-m1", "//depot/main/...@1,now"])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_int("change").unwrap(), Some(two));
    }

    #[test]
    fn test_fake_depot_files_at_change() {
        let depot = InMemoryDepot::new();
        let one = depot.submit_change("alice", &[("//depot/main/f", b"1".to_vec())], "add f");
        let _two = depot.submit_change(
            "alice",
            &[("//depot/main/g", b"2".to_vec())],
            "add g",
        );
        let conn = depot.connect("git-fusion-user");

        // `@=N`: files touched by exactly that change.
        let rows = conn
            .run_tagged("files", &["-e", &format!("//...@={one}")])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("depotFile"), Some("//depot/main/f"));

        // `@N`: state as of that change.
        let rows = conn
            .run_tagged("files", &["-e", &format!("//depot/main/...@{one}")])
            .unwrap();
        assert_eq!(rows.len(), 1);
        let rows = conn.run_tagged("files", &["-e", "//depot/main/..."]).unwrap();
        assert_eq!(rows.len(), 2);
    }
}
