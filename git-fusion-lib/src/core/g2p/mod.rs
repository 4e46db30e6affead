//! The Git→depot copier: for each pushed commit, in topological order,
//! build the discovery matrix, decide per-file actions, submit ghost
//! changelists where the branch must first be rearranged, then submit the
//! real changelist and record the association in the object mirror.

pub mod matrix;
pub mod row_decider;

use std::collections::BTreeMap;
use std::path::PathBuf;

use eyre::{eyre, Context as EyreContext};
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::depot::client::run_tagged_one;
use crate::depot::{spec, DepotError, DepotResult, NumberedChangelist, PrintSink};
use crate::git::{CommitInfo, GitFileMode, Sha1};

use super::assign::{Assignments, PreReceiveTuple};
use super::branch::Branch;
use super::changedesc::{ChangeDesc, PushState};
use super::config::ChangeOwner;
use super::context::Context;
use super::depot_branch::{new_region_root, DepotBranchInfo, ParentChange};
use super::error::CoreError;
use super::mirror::write_client_file;

use matrix::Matrix;
use row_decider::{decide, ghost_decide, GhostActionKind, GhostPlan, RequestVerb};

/// Path opened when a commit would otherwise produce an empty changelist.
pub const EMPTY_CHANGELIST_PLACEHOLDER: &str = ".p4gf_empty_changelist_placeholder";

/// Summary of one Git→depot copy.
#[derive(Clone, Debug, Default)]
pub struct G2PSummary {
    /// Submitted (commit sha, branch id, changelist) triples, in submit
    /// order.
    pub submitted: Vec<(Sha1, String, u64)>,

    /// Ghost changelists submitted, in submit order.
    pub ghost_changes: Vec<u64>,
}

/// Serialized on failure for post-mortem diagnosis.
#[derive(Debug, Serialize)]
struct FailureDump<'a> {
    sha1: String,
    branch_id: &'a str,
    message: String,
    recent_commands: Vec<String>,
    matrix: Option<&'a Matrix>,
}

/// The Git→depot copier for one push.
pub struct G2P<'ctx> {
    ctx: &'ctx Context,
    assignments: Assignments,
    /// Changelists submitted by this push per (sha, branch), so later
    /// commits can resolve their parents before the mirror records land.
    submitted: BTreeMap<(Sha1, String), u64>,
}

impl<'ctx> G2P<'ctx> {
    /// Construct over the assigner's output.
    pub fn new(ctx: &'ctx Context, assignments: Assignments) -> Self {
        G2P {
            ctx,
            assignments,
            submitted: BTreeMap::new(),
        }
    }

    /// Copy every assigned commit, then record tag and review artifacts
    /// for the push's non-branch refs.
    #[instrument(skip(self, tuples))]
    pub fn copy(&mut self, tuples: &[PreReceiveTuple]) -> eyre::Result<G2PSummary> {
        self.preflight(tuples)?;
        let mut summary = G2PSummary::default();

        let order = self.assignments.commits_in_order().to_vec();
        for (index, sha1) in order.iter().enumerate() {
            let is_last = index + 1 == order.len();
            let branch_ids = self.assignments.branch_ids(*sha1).to_vec();
            for branch_id in branch_ids {
                self.ctx.heartbeat_check().map_err(eyre::Report::new)?;
                self.copy_commit(*sha1, &branch_id, is_last, &mut summary)?;
            }
        }

        self.record_pushed_tags(tuples)?;
        self.record_review_refs(tuples, &summary)?;
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Preflight
    // ------------------------------------------------------------------

    /// Reject the whole push before any submit: illegal filenames,
    /// symlink-ancestor paths, disabled merge commits or submodules,
    /// disabled branch creation, missing write permission, and commits
    /// that would produce an empty changelist on a branch with no
    /// placeholder mapping.
    fn preflight(&self, tuples: &[PreReceiveTuple]) -> eyre::Result<()> {
        let git_repo = self.ctx.git_repo()?;
        let repo_settings = self.ctx.repo_config.borrow().repo.clone();

        for tuple in tuples {
            if tuple.git_branch_name().is_some()
                && tuple.old_sha1.into_option().is_none()
                && !repo_settings.enable_branch_creation
                && self
                    .ctx
                    .branch_for_git_name(tuple.git_branch_name().expect("checked above"))
                    .is_none()
            {
                return Err(illegal(format!(
                    "branch creation is disabled for this repo; cannot create {}",
                    tuple.ref_name
                )));
            }
        }

        for sha1 in self.assignments.commits_in_order() {
            let commit = git_repo
                .find_commit(*sha1)?
                .ok_or_else(|| eyre!("pushed commit {sha1} not found"))?;

            if commit.parents.len() > 1 && !repo_settings.enable_merge_commits {
                return Err(illegal(format!(
                    "merge commits are disabled for this repo; rejecting {sha1}"
                )));
            }

            let entries = git_repo.ls_tree(*sha1)?;
            let mut symlink_dirs = Vec::new();
            for entry in &entries {
                if entry.mode == GitFileMode::GitLink && !repo_settings.enable_submodules {
                    return Err(illegal(format!(
                        "submodules are disabled for this repo; {} in {sha1}",
                        entry.path
                    )));
                }
                if entry.mode == GitFileMode::Symlink {
                    symlink_dirs.push(entry.path.clone());
                }
                check_valid_filename(&entry.path, *sha1)?;
            }
            for entry in &entries {
                if let Some(symlink) = symlink_dirs
                    .iter()
                    .find(|symlink| entry.path.starts_with(&format!("{symlink}/")))
                {
                    return Err(illegal(format!(
                        "cannot add {} under symlink {symlink} in commit {sha1}",
                        entry.path
                    )));
                }
            }

            self.check_protects(&commit, &repo_settings)?;
        }
        Ok(())
    }

    /// The author (and pusher, unless `ignore-author-perms`) must hold
    /// write permission for every path the commit touches.
    fn check_protects(
        &self,
        commit: &CommitInfo,
        repo_settings: &super::config::RepoSettings,
    ) -> eyre::Result<()> {
        let branch_ids = self.assignments.branch_ids(commit.sha1).to_vec();
        let mut depot_paths = Vec::new();
        {
            let dict = self.ctx.branch_dict.borrow();
            let git_repo = self.ctx.git_repo()?;
            let implied_parent = commit.parents.first().copied();
            let deltas = git_repo.diff_commits(implied_parent, commit.sha1)?;
            for branch_id in &branch_ids {
                let branch = match dict.get(branch_id) {
                    Some(branch) => branch,
                    None => continue,
                };
                for delta in &deltas {
                    if let Some(depot_path) = branch.repo_to_depot_path(&delta.path) {
                        depot_paths.push(depot_path);
                    }
                }
            }
        }
        let author_user = self.depot_user_for_email(&commit.author.1)?;
        let mut users = vec![author_user.clone()];
        if !repo_settings.ignore_author_perms {
            users.push(spec::GF_USER.to_string());
        }
        for user in users.iter().unique() {
            let denied = self.paths_denied_write(user, &depot_paths)?;
            if !denied.is_empty() {
                return Err(eyre::Report::new(CoreError::PermissionDenied {
                    user: user.clone(),
                    paths: denied,
                }));
            }
        }
        Ok(())
    }

    fn paths_denied_write(
        &self,
        user: &str,
        depot_paths: &[String],
    ) -> DepotResult<Vec<String>> {
        let conn = self.ctx.conn();
        let mut denied = Vec::new();
        for depot_path in depot_paths.iter().unique() {
            let rows = conn.run_tagged("protects", &["-u", user, depot_path])?;
            let writable = rows.iter().any(|row| {
                matches!(
                    row.get("perm"),
                    Some("write") | Some("admin") | Some("super") | Some("owner")
                )
            });
            if !writable {
                denied.push(depot_path.clone());
            }
        }
        Ok(denied)
    }

    /// Resolve a Git author email to a depot user, falling back to the
    /// Fusion service account for unknown authors.
    fn depot_user_for_email(&self, email: &str) -> DepotResult<String> {
        let rows = self.ctx.conn().run_tagged("users", &[])?;
        for row in rows {
            if row.get("Email") == Some(email) {
                if let Some(user) = row.get("User") {
                    return Ok(user.to_string());
                }
            }
        }
        Ok(spec::GF_USER.to_string())
    }

    // ------------------------------------------------------------------
    // Per-commit copy
    // ------------------------------------------------------------------

    #[instrument(skip(self, summary))]
    fn copy_commit(
        &mut self,
        sha1: Sha1,
        branch_id: &str,
        is_last: bool,
        summary: &mut G2PSummary,
    ) -> eyre::Result<()> {
        // Idempotence: a (commit, branch) already mirrored is a no-op.
        let mirror = self.ctx.object_mirror();
        if mirror
            .change_num_for_commit(self.ctx.mirror_conn(), sha1, branch_id)?
            .is_some()
        {
            debug!(%sha1, branch_id, "already copied; skipping");
            return Ok(());
        }

        let git_repo = self.ctx.git_repo()?;
        let commit = git_repo
            .find_commit(sha1)?
            .ok_or_else(|| eyre!("commit {sha1} not found"))?;

        self.ensure_branch(&commit, branch_id)?;
        let branch = self
            .ctx
            .branch_dict
            .borrow()
            .get(branch_id)
            .cloned()
            .ok_or_else(|| eyre!("assigned branch {branch_id} missing from dict"))?;

        let parent_branches = self.parent_branches(&commit)?;
        let mut m = Matrix::discover(self.ctx, &commit, &branch, &parent_branches)?;
        m.resolve_parent_changes(self.ctx.mirror_conn(), &mirror)?;

        // Ghost changelists rearrange the branch before the real commit.
        let plan = ghost_decide(&m);
        if !plan.is_empty() {
            let ghost_change = self.submit_ghost(&commit, &branch, &m, &plan, false)?;
            if let Some(ghost_change) = ghost_change {
                summary.ghost_changes.push(ghost_change);
            }
            if !plan.phase_two.is_empty() {
                let second = self.submit_ghost(&commit, &branch, &m, &plan, true)?;
                if let Some(second) = second {
                    summary.ghost_changes.push(second);
                }
            }
            let latest_ghost = summary.ghost_changes.last().copied().unwrap_or_default();
            m.rediscover_after_ghost(self.ctx, &branch, latest_ghost)?;
        }

        // Mirror the commit's objects before the changelist publishes: any
        // sha visible from a submitted description must already be
        // content-addressed in the depot.
        self.mirror_objects(&commit)?;

        let change_num =
            match self.execute_and_submit(&commit, &branch, &m, &parent_branches, is_last) {
                Ok(change_num) => change_num,
                Err(err) => {
                    let dump_path = self.write_failure_dump(sha1, branch_id, &err, Some(&m));
                    return Err(eyre::Report::new(CoreError::SubmitFailed {
                        sha1,
                        message: format!("{err}"),
                        dump_path,
                    }));
                }
            };

        let change_num = match change_num {
            Some(change_num) => change_num,
            None => return Ok(()),
        };

        // Mirror record lands only after the successful submit, so partial
        // pushes leave a consistent mirror.
        self.record_in_mirror(&commit, &branch, change_num)?;
        self.resolve_provisional_parents(&branch, sha1, change_num)?;
        self.submitted
            .insert((sha1, branch_id.to_string()), change_num);
        summary
            .submitted
            .push((sha1, branch_id.to_string(), change_num));
        Ok(())
    }

    /// Pair each Git parent with its assigned branch and, where known, the
    /// changelist it maps to.
    fn parent_branches(
        &self,
        commit: &CommitInfo,
    ) -> eyre::Result<Vec<(Sha1, String, Option<u64>)>> {
        let mirror = self.ctx.object_mirror();
        let mut result = Vec::new();
        for parent_sha1 in &commit.parents {
            let mut branch_ids = self.assignments.branch_ids(*parent_sha1).to_vec();
            if branch_ids.is_empty() {
                // Parent predates this push; consult the mirror.
                for (branch_id, _change) in
                    mirror.changes_for_commit(self.ctx.mirror_conn(), *parent_sha1)?
                {
                    branch_ids.push(branch_id);
                }
            }
            for branch_id in branch_ids {
                let change_num = self
                    .submitted
                    .get(&(*parent_sha1, branch_id.clone()))
                    .copied();
                let change_num = match change_num {
                    Some(change_num) => Some(change_num),
                    None => mirror.change_num_for_commit(
                        self.ctx.mirror_conn(),
                        *parent_sha1,
                        &branch_id,
                    )?,
                };
                result.push((*parent_sha1, branch_id, change_num));
            }
        }
        Ok(result)
    }

    /// Step 1: first changelist on a new lightweight branch allocates its
    /// storage region and reroots the view.
    fn ensure_branch(&mut self, commit: &CommitInfo, branch_id: &str) -> eyre::Result<()> {
        let needs_region = {
            let dict = self.ctx.branch_dict.borrow();
            match dict.get(branch_id) {
                Some(branch) => branch.is_lightweight && branch.depot_branch_id.is_none(),
                None => false,
            }
        };
        if !needs_region {
            return Ok(());
        }

        let region_id = format!("{branch_id}-{}", self.ctx.config.id_gen.next_id());
        let root = new_region_root(&self.ctx.config.depot, &region_id);
        let mut info = DepotBranchInfo::new(&region_id, &root);

        // Parents: each Git parent's branch at its mirrored changelist,
        // provisional marks for parents submitted later in this push.
        for (parent_sha1, parent_branch_id, change_num) in &self.parent_branches(commit)? {
            let parent_region = {
                let dict = self.ctx.branch_dict.borrow();
                dict.get(parent_branch_id)
                    .and_then(|parent| parent.depot_branch_id.clone())
            };
            let parent_region = match parent_region {
                Some(parent_region) => parent_region,
                // A fully-populated parent has no region record; the basis
                // relationship is carried by the view itself.
                None => parent_branch_id.clone(),
            };
            match change_num {
                Some(change_num) => {
                    info.push_parent(&parent_region, ParentChange::Num(*change_num))
                }
                None => info.push_parent(
                    &parent_region,
                    ParentChange::Provisional(parent_sha1.to_string()),
                ),
            }
        }

        // Reroot the view onto the new region, modeled on the first
        // parent's branch (or the current view for parentless commits).
        {
            let mut dict = self.ctx.branch_dict.borrow_mut();
            let template = commit
                .parents
                .first()
                .and_then(|parent_sha1| {
                    self.assignments
                        .branch_ids(*parent_sha1)
                        .first()
                        .and_then(|parent_branch_id| dict.get(parent_branch_id).cloned())
                })
                .or_else(|| dict.get(branch_id).cloned())
                .ok_or_else(|| eyre!("no view template for new branch {branch_id}"))?;
            let rerooted = template.copy_rerooted(branch_id, &info);
            let branch = dict
                .get_mut(branch_id)
                .ok_or_else(|| eyre!("branch {branch_id} missing from dict"))?;
            branch.view = rerooted.view;
            branch.depot_branch_id = Some(region_id.clone());
            branch.is_new = false;
        }

        self.write_branch_info_record(&info)?;
        self.ctx.depot_branch_index.borrow_mut().add(info);
        Ok(())
    }

    fn write_branch_info_record(&self, info: &DepotBranchInfo) -> eyre::Result<()> {
        let conn = self.ctx.mirror_conn();
        let depot_path = info.record_depot_path(&self.ctx.config.depot);
        let change = NumberedChangelist::create(
            conn,
            &format!("branch-info: {}", info.depot_branch_id),
        )?;
        write_client_file(conn, &depot_path, info.render().as_bytes())?;
        let change_arg = change.change_num().to_string();
        conn.run_tagged("add", &["-c", &change_arg, &depot_path])?;
        change.submit()?;
        Ok(())
    }

    /// Replace provisional parent marks in regions created earlier in this
    /// push, now that the referenced commit has a real changelist.
    fn resolve_provisional_parents(
        &self,
        _branch: &Branch,
        sha1: Sha1,
        change_num: u64,
    ) -> eyre::Result<()> {
        let mark = sha1.to_string();
        let mut index = self.ctx.depot_branch_index.borrow_mut();
        let pending_ids = index
            .iter()
            .filter(|info| info.has_provisional_parent())
            .map(|info| info.depot_branch_id.clone())
            .collect_vec();
        for region_id in pending_ids {
            if let Some(info) = index.get_mut(&region_id) {
                info.resolve_provisional(&mark, change_num);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ghost changelists
    // ------------------------------------------------------------------

    /// Submit one ghost changelist. Phase two carries only the deletes of
    /// files phase one branched in.
    fn submit_ghost(
        &self,
        commit: &CommitInfo,
        branch: &Branch,
        m: &Matrix,
        plan: &GhostPlan,
        phase_two: bool,
    ) -> eyre::Result<Option<u64>> {
        let conn = self.ctx.conn();
        let actions = if phase_two {
            &plan.phase_two
        } else {
            &plan.phase_one
        };
        if actions.is_empty() {
            return Ok(None);
        }

        let desc = ChangeDesc {
            message: "Git Fusion branch management".to_string(),
            ghost: super::changedesc::GhostInfo {
                of_sha1: commit.parents.first().copied(),
                of_change_num: m
                    .imply_index()
                    .and_then(|imply_index| m.columns[imply_index].change_num),
                precedes_sha1: Some(commit.sha1),
            },
            depot_branch_id: branch.depot_branch_id.clone(),
            pusher: Some(spec::GF_USER.to_string()),
            ..Default::default()
        };
        let change = self.ctx.new_numbered_changelist(&desc.render())?;
        let change_arg = change.change_num().to_string();

        for action in actions {
            let dest_depot_path = branch
                .repo_to_depot_path(&action.gwt_path)
                .ok_or_else(|| eyre!("ghost path {} unmapped", action.gwt_path))?;
            match &action.kind {
                GhostActionKind::BranchFromBasis { basis_depot_path } => {
                    conn.run_tagged(
                        "integ",
                        &["-c", &change_arg, basis_depot_path, &dest_depot_path],
                    )?;
                    conn.run_tagged("resolve", &["-at", "-c", &change_arg])?;
                }
                GhostActionKind::PopulateFrom { source_column } => {
                    let source_path = m
                        .rows
                        .get(&action.gwt_path)
                        .and_then(|row| row.cell(*source_column))
                        .and_then(|cell| cell.depot_path.clone());
                    match source_path {
                        Some(source_path) => {
                            conn.run_tagged(
                                "integ",
                                &["-c", &change_arg, &source_path, &dest_depot_path],
                            )?;
                            conn.run_tagged("resolve", &["-at", "-c", &change_arg])?;
                        }
                        None => {
                            // Content exists only in Git; add it outright.
                            let blob_sha1 = m
                                .rows
                                .get(&action.gwt_path)
                                .and_then(|row| {
                                    m.parent_indexes()
                                        .iter()
                                        .find_map(|&parent_index| row.cell(parent_index))
                                        .and_then(|cell| cell.blob_sha1)
                                })
                                .ok_or_else(|| {
                                    eyre!("no content source for ghost add {}", action.gwt_path)
                                })?;
                            let content = self
                                .ctx
                                .git_repo()?
                                .read_blob(blob_sha1)?
                                .ok_or_else(|| eyre!("blob {blob_sha1} missing"))?;
                            write_client_file(conn, &dest_depot_path, &content)?;
                            conn.run_tagged("add", &["-c", &change_arg, &dest_depot_path])?;
                        }
                    }
                }
                GhostActionKind::Delete => {
                    conn.run_tagged("delete", &["-c", &change_arg, &dest_depot_path])?;
                }
            }
        }

        let submitted = change.submit()?;
        debug!(change_num = submitted, phase_two, "submitted ghost changelist");
        Ok(Some(submitted))
    }

    // ------------------------------------------------------------------
    // Execute and submit
    // ------------------------------------------------------------------

    /// Apply decided actions in batches: integrations first, then
    /// content-bearing adds and edits, then deletions, then submit.
    fn execute_and_submit(
        &self,
        commit: &CommitInfo,
        branch: &Branch,
        m: &Matrix,
        parent_branches: &[(Sha1, String, Option<u64>)],
        is_last: bool,
    ) -> eyre::Result<Option<u64>> {
        let conn = self.ctx.conn();
        let git_repo = self.ctx.git_repo()?;

        let decisions = m
            .rows
            .values()
            .map(|row| (row.gwt_path.clone(), decide(m, row)))
            .filter(|(_, decided)| !decided.is_noop())
            .collect_vec();

        let desc = self.change_description(commit, branch, parent_branches, is_last)?;
        let change = self.ctx.new_numbered_changelist(&desc.render())?;
        let change_arg = change.change_num().to_string();
        let mut opened_any = false;

        // Integrations first, grouped by flag combination. Each satisfied
        // row remembers its source so the content re-check below can
        // compare what the integ produced against what Git expects.
        let mut integ_satisfied: BTreeMap<String, String> = BTreeMap::new();
        let grouped = decisions
            .iter()
            .flat_map(|(gwt_path, decided)| {
                decided
                    .integs
                    .iter()
                    .map(move |integ| (integ.integ_flags.clone(), gwt_path.clone(), integ))
            })
            .into_group_map_by(|(flags, _, _)| flags.clone());
        for (_flags, group) in grouped {
            for (_, gwt_path, integ) in group {
                let row = &m.rows[&gwt_path];
                let source_path = row
                    .cell(integ.source_column)
                    .and_then(|cell| cell.depot_path.clone());
                let source_path = match source_path {
                    Some(source_path) => source_path,
                    None => continue,
                };
                let dest_path = &row.depot_path;
                self.ctx
                    .record_cmd(format!("integ -c {change_arg} {source_path} {dest_path}"));
                let integ_result =
                    conn.run_tagged("integ", &["-c", &change_arg, &source_path, dest_path]);
                match integ_result {
                    Ok(_) => {
                        conn.run_tagged("resolve", &[&integ.resolve_flags, "-c", &change_arg])?;
                        integ_satisfied.insert(gwt_path.clone(), source_path.clone());
                        opened_any = true;
                    }
                    Err(DepotError::CommandFailed { message, .. }) => {
                        if integ.fallback.is_none() {
                            return Err(eyre::Report::new(CoreError::IntegFailed {
                                depot_path: dest_path.clone(),
                                sha1: commit.sha1,
                                message,
                            }));
                        }
                        warn!(%dest_path, "integration refused; using fallback");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        // Content-bearing adds and edits. After an integration, re-check
        // the file's content against Git's expected bytes; a mismatch
        // forces an edit on top of the integ.
        for (gwt_path, decided) in &decisions {
            let verb = match decided.verb {
                Some(RequestVerb::Add) | Some(RequestVerb::Edit) => {
                    decided.verb.expect("matched above")
                }
                _ => continue,
            };
            let row = &m.rows[gwt_path];
            let expected = row
                .cell(m.gdest_index())
                .and_then(|cell| cell.blob_sha1)
                .and_then(|blob_sha1| git_repo.read_blob(blob_sha1).transpose())
                .transpose()?;
            let expected = match expected {
                Some(expected) => expected,
                None => continue,
            };
            if let Some(source_path) = integ_satisfied.get(gwt_path) {
                let integrated = self.printed_content(source_path)?;
                if integrated.as_deref() == Some(expected.as_slice()) {
                    continue;
                }
                write_client_file(conn, &row.depot_path, &expected)?;
                conn.run_tagged("edit", &["-c", &change_arg, &row.depot_path])?;
                opened_any = true;
                continue;
            }
            write_client_file(conn, &row.depot_path, &expected)?;
            let verb_cmd = match verb {
                RequestVerb::Add => "add",
                RequestVerb::Edit => "edit",
                RequestVerb::Delete => unreachable!("filtered above"),
            };
            self.ctx
                .record_cmd(format!("{verb_cmd} -c {change_arg} {}", row.depot_path));
            conn.run_tagged(verb_cmd, &["-c", &change_arg, &row.depot_path])?;
            opened_any = true;
        }

        // Deletions last.
        for (gwt_path, decided) in &decisions {
            if decided.verb != Some(RequestVerb::Delete) {
                continue;
            }
            let row = &m.rows[gwt_path];
            self.ctx
                .record_cmd(format!("delete -c {change_arg} {}", row.depot_path));
            conn.run_tagged("delete", &["-c", &change_arg, &row.depot_path])?;
            opened_any = true;
        }

        if !opened_any {
            // A zero-file commit survives only on branches mapping the
            // placeholder path.
            let placeholder = branch
                .repo_to_depot_path(EMPTY_CHANGELIST_PLACEHOLDER)
                .ok_or_else(|| {
                    eyre::Report::new(CoreError::IllegalInput {
                        reason: format!(
                            "commit {} is empty and branch {} maps no placeholder path",
                            commit.sha1, branch.branch_id
                        ),
                    })
                })?;
            write_client_file(conn, &placeholder, b"")?;
            if self.printed_content(&placeholder)?.is_some() {
                conn.run_tagged("edit", &["-c", &change_arg, &placeholder])?;
            } else {
                conn.run_tagged("add", &["-c", &change_arg, &placeholder])?;
            }
        }

        self.ctx.record_cmd(format!("submit -c {change_arg}"));
        let submitted = change.submit()?;
        self.reassign_owner(submitted, commit)?;
        Ok(Some(submitted))
    }

    fn printed_content(&self, depot_path: &str) -> DepotResult<Option<Vec<u8>>> {
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
        self.ctx
            .conn()
            .print(&[depot_path.to_string()], &mut sink)?;
        Ok(sink.content)
    }

    /// Compose the Fusion-written changelist description.
    fn change_description(
        &self,
        commit: &CommitInfo,
        branch: &Branch,
        parent_branches: &[(Sha1, String, Option<u64>)],
        is_last: bool,
    ) -> eyre::Result<ChangeDesc> {
        let gitlinks = self
            .ctx
            .git_repo()?
            .ls_tree(commit.sha1)?
            .into_iter()
            .filter(|entry| entry.mode == GitFileMode::GitLink)
            .map(|entry| (entry.sha1, entry.path))
            .collect_vec();

        // When the branch's first changelist diverges from another branch,
        // note the cross-branch parent for later depot→Git reconstruction.
        let parent_branch = parent_branches
            .iter()
            .find(|(_, parent_branch_id, change)| {
                parent_branch_id != &branch.branch_id && change.is_some()
            })
            .and_then(|(_, parent_branch_id, change)| {
                let dict = self.ctx.branch_dict.borrow();
                let parent_region = dict
                    .get(parent_branch_id)
                    .and_then(|parent| parent.depot_branch_id.clone())
                    .unwrap_or_else(|| parent_branch_id.clone());
                change.map(|change| (parent_region, change))
            });

        Ok(ChangeDesc {
            message: commit.message.to_string(),
            sha1: Some(commit.sha1),
            parents: commit.parents.clone(),
            author: Some(format_signature(&commit.author)),
            committer: Some(format_signature(&commit.committer)),
            pusher: Some(spec::GF_USER.to_string()),
            push_state: Some(if is_last {
                PushState::Complete
            } else {
                PushState::Incomplete
            }),
            depot_branch_id: branch.depot_branch_id.clone(),
            parent_branch,
            gitlinks,
            ghost: Default::default(),
        })
    }

    /// Reassign the submitted changelist's owner from the service account
    /// to the Git author (or leave it with the pusher, per config).
    fn reassign_owner(&self, change_num: u64, commit: &CommitInfo) -> eyre::Result<()> {
        let owner = match self.ctx.repo_config.borrow().repo.change_owner {
            ChangeOwner::Author => self.depot_user_for_email(&commit.author.1)?,
            ChangeOwner::Pusher => return Ok(()),
        };
        let conn = self.ctx.conn();
        let row = run_tagged_one(conn, "change", &["-o", &change_num.to_string()])?;
        if let Some(mut form) = row {
            form.insert("User", owner);
            conn.run_tagged_with_input("change", &["-i", "-f"], &form)?;
        }
        Ok(())
    }

    /// Mirror the commit's blob content under content-addressed paths.
    /// Runs before the real submit.
    fn mirror_objects(&self, commit: &CommitInfo) -> eyre::Result<()> {
        let mirror = self.ctx.object_mirror();
        let git_repo = self.ctx.git_repo()?;
        let conn = self.ctx.mirror_conn();

        let mut batch = mirror.batch();
        for entry in git_repo.ls_tree(commit.sha1)? {
            if entry.mode == GitFileMode::GitLink {
                continue;
            }
            if let Some(content) = git_repo.read_blob(entry.sha1)? {
                if !mirror.blob_exists(conn, entry.sha1)? {
                    batch.add_blob(entry.sha1, &content);
                }
            }
        }
        batch
            .submit(conn, &format!("mirror objects {}", commit.sha1))
            .wrap_err("Submitting mirror object batch")?;
        Ok(())
    }

    /// Record the commit↔changelist association. Runs after the real
    /// submit, which supplies the changelist number.
    fn record_in_mirror(
        &self,
        commit: &CommitInfo,
        branch: &Branch,
        change_num: u64,
    ) -> eyre::Result<()> {
        let mirror = self.ctx.object_mirror();
        let conn = self.ctx.mirror_conn();
        let mut batch = mirror.batch();
        batch.add_commit_record(commit.sha1, &branch.branch_id, change_num);
        batch
            .submit(conn, &format!("mirror commit {}", commit.sha1))
            .wrap_err("Submitting mirror record batch")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tags, reviews, failure dump
    // ------------------------------------------------------------------

    /// Record pushed `refs/tags/...` refs in the depot so a later fetch
    /// (possibly on another instance) can materialize them.
    fn record_pushed_tags(&self, tuples: &[PreReceiveTuple]) -> eyre::Result<()> {
        for tuple in tuples {
            let tag_name = match tuple.ref_name.strip_prefix("refs/tags/") {
                Some(tag_name) => tag_name,
                None => continue,
            };
            let sha1 = match tuple.new_sha1.into_option() {
                Some(sha1) => sha1,
                None => continue,
            };
            let conn = self.ctx.mirror_conn();
            let depot_path = format!(
                "//{}/repos/{}/tags/{tag_name}",
                self.ctx.config.depot, self.ctx.config.repo
            );
            let change = NumberedChangelist::create(conn, &format!("tag {tag_name}"))?;
            write_client_file(conn, &depot_path, format!("{sha1}\n").as_bytes())?;
            let change_arg = change.change_num().to_string();
            if self.printed_content(&depot_path)?.is_some() {
                conn.run_tagged("edit", &["-c", &change_arg, &depot_path])?;
            } else {
                conn.run_tagged("add", &["-c", &change_arg, &depot_path])?;
            }
            change.submit()?;
        }
        Ok(())
    }

    /// Record review metadata for pushed `refs/review/...` refs: the
    /// per-review ancestry file consumed by review tooling.
    fn record_review_refs(
        &self,
        tuples: &[PreReceiveTuple],
        summary: &G2PSummary,
    ) -> eyre::Result<()> {
        for tuple in tuples {
            let review_name = match tuple.ref_name.strip_prefix("refs/review/") {
                Some(review_name) => review_name,
                None => continue,
            };
            let head = match tuple.new_sha1.into_option() {
                Some(head) => head,
                None => continue,
            };
            let changes = summary
                .submitted
                .iter()
                .map(|(_, _, change_num)| change_num.to_string())
                .join(" ");
            let content = format!("review: {review_name}\nhead: {head}\nchanges: {changes}\n");
            let conn = self.ctx.mirror_conn();
            let last_change = match summary.submitted.last() {
                Some((_, _, change_num)) => *change_num,
                None => continue,
            };
            let depot_path = format!(
                "//{}/repos/{}/changelists/{last_change}",
                self.ctx.config.depot, self.ctx.config.repo
            );
            let change = NumberedChangelist::create(conn, &format!("review {review_name}"))?;
            write_client_file(conn, &depot_path, content.as_bytes())?;
            let change_arg = change.change_num().to_string();
            conn.run_tagged("add", &["-c", &change_arg, &depot_path])?;
            change.submit()?;
        }
        Ok(())
    }

    fn write_failure_dump(
        &self,
        sha1: Sha1,
        branch_id: &str,
        err: &eyre::Report,
        m: Option<&Matrix>,
    ) -> Option<PathBuf> {
        let dump = FailureDump {
            sha1: sha1.to_string(),
            branch_id,
            message: format!("{err}"),
            recent_commands: self.ctx.recent_history(),
            matrix: m,
        };
        let path = std::env::temp_dir().join(format!(
            "git-fusion-failure-{}-{sha1}.json",
            self.ctx.config.repo
        ));
        match serde_json::to_vec_pretty(&dump) {
            Ok(bytes) => match std::fs::write(&path, bytes) {
                Ok(()) => Some(path),
                Err(write_err) => {
                    warn!(?write_err, "could not write failure dump");
                    None
                }
            },
            Err(serialize_err) => {
                warn!(?serialize_err, "could not serialize failure dump");
                None
            }
        }
    }
}

fn illegal(reason: String) -> eyre::Report {
    eyre::Report::new(CoreError::IllegalInput { reason })
}

/// Reject filenames the depot cannot store: non-printable characters and
/// the `...` wildcard sequence.
pub fn check_valid_filename(gwt_path: &str, sha1: Sha1) -> eyre::Result<()> {
    if gwt_path.contains("...") {
        return Err(illegal(format!(
            "filename {gwt_path:?} in commit {sha1} contains \"...\""
        )));
    }
    if gwt_path
        .chars()
        .any(|c| c.is_control() || c == '\u{7f}')
    {
        return Err(illegal(format!(
            "filename {gwt_path:?} in commit {sha1} contains non-printable characters"
        )));
    }
    if gwt_path.is_empty() || gwt_path.ends_with('/') {
        return Err(illegal(format!(
            "filename {gwt_path:?} in commit {sha1} is not a valid file path"
        )));
    }
    Ok(())
}

fn format_signature(signature: &(String, String, i64)) -> String {
    let (name, email, epoch) = signature;
    format!("{name} <{email}> {epoch}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(byte: &str) -> Sha1 {
        byte.repeat(20).parse().unwrap()
    }

    #[test]
    fn test_check_valid_filename() {
        assert!(check_valid_filename("src/normal.c", sha("aa")).is_ok());
        assert!(check_valid_filename("has...dots", sha("aa")).is_err());
        assert!(check_valid_filename("ctrl\u{1}char", sha("aa")).is_err());
        assert!(check_valid_filename("", sha("aa")).is_err());
        assert!(check_valid_filename("trailing/", sha("aa")).is_err());
    }

    #[test]
    fn test_placeholder_requires_view_mapping() {
        use super::super::config::BranchSection;
        use crate::core::branch::Branch;

        // A branch mapping the repo root can host empty commits via the
        // placeholder; a docs-only branch cannot.
        let full = Branch::from_section(
            "full",
            &BranchSection {
                git_branch_name: Some("full".to_string()),
                view: Some(vec!["//depot/main/... ...".to_string()]),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(full
            .repo_to_depot_path(EMPTY_CHANGELIST_PLACEHOLDER)
            .is_some());

        let docs_only = Branch::from_section(
            "docs",
            &BranchSection {
                git_branch_name: Some("docs".to_string()),
                view: Some(vec!["//depot/main/docs/... docs/...".to_string()]),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(docs_only
            .repo_to_depot_path(EMPTY_CHANGELIST_PLACEHOLDER)
            .is_none());
    }

    #[test]
    fn test_format_signature() {
        assert_eq!(
            format_signature(&(
                "Alice".to_string(),
                "alice@example.com".to_string(),
                1400000000
            )),
            "Alice <alice@example.com> 1400000000"
        );
    }
}
