//! Per-repo operating context: connections, branch dictionary,
//! depot-branch index, temp client pool, heartbeat state, and command
//! history for crash diagnostics.

use std::cell::RefCell;
use std::collections::hash_map::RandomState;
use std::collections::VecDeque;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::eyre;
use tracing::instrument;

use crate::depot::{counter, Connection, DepotResult, NumberedChangelist};
use crate::git::{GitRepo, GitRunner};

use super::branch::{calc_branch_union_view, Branch, BranchDict};
use super::config::RepoConfig;
use super::depot_branch::DepotBranchIndex;
use super::error::Result as CoreResult;
use super::lock::{Heartbeat, LockConfig, ViewLock};
use super::mirror::ObjectMirror;
use super::view_map::{MapFlag, ViewLine};

/// How many depot commands the crash-diagnostics ring remembers.
const HISTORY_CAPACITY: usize = 50;

/// Source of new branch and depot-branch identifiers.
///
/// Production uses process-random tokens; tests use a sequential counter
/// so identifiers are stable across runs.
#[derive(Debug)]
pub enum IdGenerator {
    /// Process-random hex tokens.
    Random,

    /// Deterministic `0001`, `0002`, … tokens.
    Sequential(AtomicU64),
}

impl IdGenerator {
    /// A sequential generator starting at 1.
    pub fn sequential() -> Self {
        IdGenerator::Sequential(AtomicU64::new(1))
    }

    /// Produce the next identifier token.
    pub fn next_id(&self) -> String {
        match self {
            IdGenerator::Random => {
                let mut hasher = RandomState::new().build_hasher();
                hasher.write_u64(0);
                format!("{:016x}", hasher.finish())
            }
            IdGenerator::Sequential(counter) => {
                format!("{:04}", counter.fetch_add(1, Ordering::SeqCst))
            }
        }
    }
}

/// Static configuration for one repo context.
#[derive(Debug)]
pub struct ContextConfig {
    /// The repo name.
    pub repo: String,

    /// This Fusion instance's server identity.
    pub server_id: String,

    /// The Fusion-dedicated depot name.
    pub depot: String,

    /// Lock polling and heartbeat timing.
    pub lock: LockConfig,

    /// Identifier source for new branches.
    pub id_gen: IdGenerator,
}

impl ContextConfig {
    /// Standard configuration for a repo on a server.
    pub fn new(repo: &str, server_id: &str) -> Self {
        ContextConfig {
            repo: repo.to_string(),
            server_id: server_id.to_string(),
            depot: ".git-fusion".to_string(),
            lock: LockConfig::default(),
            id_gen: IdGenerator::Random,
        }
    }
}

/// The connection set a context operates over: one for repo data, one for
/// object-mirror data, two for interest-list maintenance.
pub struct ConnectionSet {
    /// Repo file data and changelists.
    pub repo: Box<dyn Connection>,

    /// Object-mirror reads and writes.
    pub mirror: Box<dyn Connection>,

    /// This server's reviews account.
    pub reviews: Box<dyn Connection>,

    /// The all-Fusion union reviews account.
    pub reviews_union: Box<dyn Connection>,
}

impl std::fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<ConnectionSet>")
    }
}

/// Everything one push or fetch operates through.
pub struct Context {
    /// Static configuration.
    pub config: ContextConfig,

    conns: ConnectionSet,

    /// Parsed repo configuration.
    pub repo_config: RefCell<RepoConfig>,

    /// The branch dictionary, mutated as pushes mint new branches.
    pub branch_dict: RefCell<BranchDict>,

    /// Loaded depot-branch-info records.
    pub depot_branch_index: RefCell<DepotBranchIndex>,

    temp_clients: TempClientPool,
    view_dirs: tempfile::TempDir,
    history: RefCell<VecDeque<String>>,
    heartbeat: RefCell<Option<Heartbeat>>,
    git_repo: Option<GitRepo>,
    git_runner: Option<GitRunner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Context repo={:?} server_id={:?}>",
            self.config.repo, self.config.server_id
        )
    }
}

impl Context {
    /// Construct a context over the given connections.
    pub fn new(config: ContextConfig, conns: ConnectionSet) -> eyre::Result<Self> {
        let view_dirs = tempfile::tempdir().map_err(|err| eyre!("creating view dirs: {err}"))?;
        let temp_clients = TempClientPool::new(&config.repo);
        Ok(Context {
            config,
            conns,
            repo_config: RefCell::new(RepoConfig::default()),
            branch_dict: RefCell::new(BranchDict::new()),
            depot_branch_index: RefCell::new(DepotBranchIndex::new()),
            temp_clients,
            view_dirs,
            history: RefCell::new(VecDeque::new()),
            heartbeat: RefCell::new(None),
            git_repo: None,
            git_runner: None,
        })
    }

    /// Attach the local Git repository and plumbing runner.
    pub fn with_git(mut self, git_repo: GitRepo, git_runner: GitRunner) -> Self {
        self.git_repo = Some(git_repo);
        self.git_runner = Some(git_runner);
        self
    }

    /// The repo-data connection.
    pub fn conn(&self) -> &dyn Connection {
        self.conns.repo.as_ref()
    }

    /// The object-mirror connection.
    pub fn mirror_conn(&self) -> &dyn Connection {
        self.conns.mirror.as_ref()
    }

    /// The per-server reviews connection.
    pub fn reviews_conn(&self) -> &dyn Connection {
        self.conns.reviews.as_ref()
    }

    /// The all-Fusion union reviews connection.
    pub fn reviews_union_conn(&self) -> &dyn Connection {
        self.conns.reviews_union.as_ref()
    }

    /// The local Git repository.
    pub fn git_repo(&self) -> eyre::Result<&GitRepo> {
        self.git_repo
            .as_ref()
            .ok_or_else(|| eyre!("context has no attached Git repository"))
    }

    /// The Git plumbing runner.
    pub fn git_runner(&self) -> eyre::Result<&GitRunner> {
        self.git_runner
            .as_ref()
            .ok_or_else(|| eyre!("context has no attached Git runner"))
    }

    /// The object mirror for this repo.
    pub fn object_mirror(&self) -> ObjectMirror {
        ObjectMirror::new(&self.config.depot, &self.config.repo)
    }

    /// Record a depot command line in the diagnostics ring.
    pub fn record_cmd(&self, line: impl Into<String>) {
        let mut history = self.history.borrow_mut();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(line.into());
    }

    /// The recent depot command lines, oldest first.
    pub fn recent_history(&self) -> Vec<String> {
        self.history.borrow().iter().cloned().collect()
    }

    /// Install a heartbeat for the duration of an operation.
    pub fn set_heartbeat(&self, heartbeat: Heartbeat) {
        *self.heartbeat.borrow_mut() = Some(heartbeat);
    }

    /// Drop the installed heartbeat, stopping any background thread.
    pub fn clear_heartbeat(&self) {
        *self.heartbeat.borrow_mut() = None;
    }

    /// Raise [`super::error::CoreError::LockCanceled`] if a third party
    /// cleared the lock. Called at suspension points.
    pub fn heartbeat_check(&self) -> CoreResult<()> {
        match self.heartbeat.borrow().as_ref() {
            Some(heartbeat) => heartbeat.check(),
            None => Ok(()),
        }
    }

    /// Read the last-copied-change high-water mark.
    #[instrument]
    pub fn read_last_copied_change(&self) -> DepotResult<Option<u64>> {
        let name =
            counter::last_copied_change_name(&self.config.repo, &self.config.server_id);
        match counter::get(self.conn(), &name)? {
            counter::CounterValue::Int(0) => Ok(None),
            counter::CounterValue::Int(value) => Ok(Some(value)),
            counter::CounterValue::Text(_) => Ok(None),
        }
    }

    /// Advance the last-copied-change high-water mark.
    #[instrument]
    pub fn write_last_copied_change(&self, change_num: u64) -> DepotResult<()> {
        let name =
            counter::last_copied_change_name(&self.config.repo, &self.config.server_id);
        counter::set(self.conn(), &name, &change_num.to_string())
    }

    /// Factory for numbered pending changelists on the repo connection.
    pub fn new_numbered_changelist(
        &self,
        description: &str,
    ) -> DepotResult<NumberedChangelist<'_>> {
        NumberedChangelist::create(self.conn(), description)
    }

    /// Acquire this repo's view lock and register the repo's full view as
    /// an interest list under the server's reviews account. The write
    /// phase of a push or fetch runs entirely inside this lock.
    #[instrument]
    pub fn acquire_view_lock(&self) -> CoreResult<ViewLock<'_>> {
        let mut lock = ViewLock::acquire(
            self.reviews_conn(),
            &self.config.repo,
            &self.config.lock,
        )?;
        let patterns: Vec<String> = {
            let dict = self.branch_dict.borrow();
            dict.values()
                .filter(|branch| !branch.deleted)
                .flat_map(|branch| branch.view.as_lines().iter())
                .filter(|line| line.flag != MapFlag::Exclude)
                .map(|line| line.lhs.clone())
                .collect()
        };
        let account = crate::depot::spec::reviews_user_name(&self.config.server_id);
        let tag = format!("push-{}", self.config.repo);
        lock.register_interest(&account, &tag, &patterns)?;
        Ok(lock)
    }

    /// Look up a branch by its Git ref short name.
    pub fn branch_for_git_name(&self, git_branch_name: &str) -> Option<Branch> {
        self.branch_dict
            .borrow()
            .values()
            .find(|branch| branch.git_branch_name.as_deref() == Some(git_branch_name))
            .cloned()
    }

    /// Bind the repo connection to a temp client carrying the given view
    /// lines. The binding reverts when the returned scope drops.
    #[instrument(skip(view_lines))]
    pub fn switch_to_view(&self, view_lines: Vec<ViewLine>) -> DepotResult<ViewScope<'_>> {
        let client_name = self.temp_clients.take();
        let root = self.view_dirs.path().join(&client_name);
        let view = view_lines
            .iter()
            .map(|line| {
                // Temp client views always carry the client-prefixed rhs.
                let rhs = if line.rhs.starts_with("//") {
                    rebind_client_rhs(&line.rhs, &client_name)
                } else {
                    format!("//{client_name}/{}", line.rhs)
                };
                ViewLine {
                    flag: line.flag,
                    lhs: line.lhs.clone(),
                    rhs,
                }
                .to_string()
            })
            .collect();
        let spec = crate::depot::ClientSpec::new(&client_name, root, view);
        spec.save(self.conn())?;
        let previous_client = self.conn().client();
        self.conn().set_client(&client_name);
        Ok(ViewScope {
            ctx: self,
            client_name,
            previous_client,
        })
    }

    /// Bind the repo connection to a temp client carrying one branch's
    /// view.
    pub fn switch_to_branch(&self, branch: &Branch) -> DepotResult<ViewScope<'_>> {
        self.switch_to_view(branch.view.as_lines().to_vec())
    }

    /// Bind the repo connection to a temp client carrying the union of
    /// every branch's view.
    pub fn switch_to_union_view(&self) -> DepotResult<ViewScope<'_>> {
        let lines = {
            let dict = self.branch_dict.borrow();
            // The rhs is rebound per-client inside switch_to_view; the
            // placeholder name here only shapes the repo-relative paths.
            calc_branch_union_view("placeholder", &dict)
        };
        self.switch_to_view(lines)
    }
}

fn rebind_client_rhs(rhs: &str, client_name: &str) -> String {
    match rhs.trim_start_matches('/').split_once('/') {
        Some((_old_client, rest)) => format!("//{client_name}/{rest}"),
        None => format!("//{client_name}/..."),
    }
}

/// RAII scope restoring the previous client binding and returning the temp
/// client to the pool.
#[derive(Debug)]
pub struct ViewScope<'ctx> {
    ctx: &'ctx Context,
    client_name: String,
    previous_client: Option<String>,
}

impl ViewScope<'_> {
    /// The temp client bound for this scope.
    pub fn client_name(&self) -> &str {
        &self.client_name
    }
}

impl Drop for ViewScope<'_> {
    fn drop(&mut self) {
        if let Some(previous_client) = &self.previous_client {
            self.ctx.conn().set_client(previous_client);
        }
        self.ctx.temp_clients.give_back(self.client_name.clone());
    }
}

/// A pool of temp client names, reused across repeated queries against
/// different branches within one operation.
#[derive(Debug)]
struct TempClientPool {
    repo: String,
    next_index: AtomicU64,
    free: RefCell<Vec<String>>,
}

impl TempClientPool {
    fn new(repo: &str) -> Self {
        TempClientPool {
            repo: repo.to_string(),
            next_index: AtomicU64::new(1),
            free: RefCell::new(Vec::new()),
        }
    }

    fn take(&self) -> String {
        if let Some(name) = self.free.borrow_mut().pop() {
            return name;
        }
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        format!("git-fusion-temp-{}-{index}", self.repo)
    }

    fn give_back(&self, name: String) {
        self.free.borrow_mut().push(name);
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{test_context, InMemoryDepot};

    use super::*;

    #[test]
    fn test_sequential_ids() {
        let id_gen = IdGenerator::sequential();
        assert_eq!(id_gen.next_id(), "0001");
        assert_eq!(id_gen.next_id(), "0002");
    }

    #[test]
    fn test_history_ring_caps() {
        let depot = InMemoryDepot::new();
        let ctx = test_context(&depot, "repoA");
        for i in 0..(HISTORY_CAPACITY + 10) {
            ctx.record_cmd(format!("cmd {i}"));
        }
        let history = ctx.recent_history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0], "cmd 10");
    }

    #[test]
    fn test_view_scope_restores_and_pools() {
        let depot = InMemoryDepot::new();
        let ctx = test_context(&depot, "repoA");
        let first_name = {
            let scope = ctx
                .switch_to_view(vec![ViewLine::new("//depot/main/...", "...")])
                .unwrap();
            assert_eq!(ctx.conn().client().as_deref(), Some(scope.client_name()));
            scope.client_name().to_string()
        };
        // The pooled name is reused by the next scope.
        let scope = ctx
            .switch_to_view(vec![ViewLine::new("//depot/other/...", "...")])
            .unwrap();
        assert_eq!(scope.client_name(), first_name);
    }

    #[test]
    fn test_acquire_view_lock_registers_interest() {
        use crate::core::lock::{interest_intersects, read_interest};
        use crate::depot::spec::reviews_user_name;

        let depot = InMemoryDepot::new();
        depot.create_user(&reviews_user_name("test-server"));
        let ctx = test_context(&depot, "repoA");
        let lock = ctx.acquire_view_lock().unwrap();
        let conn = depot.connect("git-fusion-user");
        let interest = read_interest(&conn, &reviews_user_name("test-server")).unwrap();
        assert!(interest_intersects(&interest, vec!["//depot/main/a.txt"]));
        lock.release().unwrap();
        let interest = read_interest(&conn, &reviews_user_name("test-server")).unwrap();
        assert!(interest.is_empty());
    }

    #[test]
    fn test_last_copied_change_round_trip() {
        let depot = InMemoryDepot::new();
        let ctx = test_context(&depot, "repoA");
        assert_eq!(ctx.read_last_copied_change().unwrap(), None);
        ctx.write_last_copied_change(123).unwrap();
        assert_eq!(ctx.read_last_copied_change().unwrap(), Some(123));
    }
}
