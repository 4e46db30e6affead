//! Assign a branch to every pushed commit.
//!
//! The decision of which depot branch each Git commit lands on happens
//! before any copying. Named refs claim paths through the commit DAG in a
//! fixed priority order; whatever remains unassigned is parceled out to
//! anonymous lightweight branches. The walks below are explicit work
//! queues over a loaded node map; nothing mutates a collection while
//! iterating it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use eyre::{eyre, Context as EyreContext};
use itertools::Itertools;
use tracing::{debug, instrument};

use crate::git::{MaybeZeroSha1, Sha1};

use super::branch::{assignment_order, Branch};
use super::context::Context;

/// One line of pre-receive input: `<old-sha1> <new-sha1> <ref>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreReceiveTuple {
    /// The ref's previous head; zero when the ref is being created.
    pub old_sha1: MaybeZeroSha1,

    /// The ref's pushed head; zero when the ref is being deleted.
    pub new_sha1: MaybeZeroSha1,

    /// The full ref name, e.g. `refs/heads/master`.
    pub ref_name: String,
}

impl PreReceiveTuple {
    /// Parse one pre-receive line.
    pub fn from_line(line: &str) -> eyre::Result<Self> {
        let (old, rest) = line
            .trim()
            .split_once(' ')
            .ok_or_else(|| eyre!("malformed pre-receive line: {line:?}"))?;
        let (new, ref_name) = rest
            .split_once(' ')
            .ok_or_else(|| eyre!("malformed pre-receive line: {line:?}"))?;
        Ok(PreReceiveTuple {
            old_sha1: old.parse().map_err(|err| eyre!("{err}"))?,
            new_sha1: new.parse().map_err(|err| eyre!("{err}"))?,
            ref_name: ref_name.to_string(),
        })
    }

    /// Render back to the pre-receive line form.
    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.old_sha1, self.new_sha1, self.ref_name)
    }

    /// The ref's short branch name, for `refs/heads/...` refs.
    pub fn git_branch_name(&self) -> Option<&str> {
        self.ref_name.strip_prefix("refs/heads/")
    }
}

/// Per-commit working state during assignment.
#[derive(Debug)]
struct AssignNode {
    parents: Vec<Sha1>,
    children: BTreeSet<Sha1>,
    branch_ids: BTreeSet<String>,
    /// True for heads outside the pushed range, loaded only so ref heads
    /// resolve; their parents are not loaded.
    placeholder: bool,
}

impl AssignNode {
    fn placeholder() -> Self {
        AssignNode {
            parents: Vec::new(),
            children: BTreeSet::new(),
            branch_ids: BTreeSet::new(),
            placeholder: true,
        }
    }

    fn is_assigned(&self) -> bool {
        !self.branch_ids.is_empty()
    }
}

/// The finalized assignment: per commit, only the branch-id set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assignments {
    by_sha1: BTreeMap<Sha1, Vec<String>>,
    /// Pushed commits in topological order, parents first.
    order: Vec<Sha1>,
}

impl Assignments {
    /// The branch ids assigned to one commit.
    pub fn branch_ids(&self, sha1: Sha1) -> &[String] {
        self.by_sha1
            .get(&sha1)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Pushed commits in submit order (parents before children).
    pub fn commits_in_order(&self) -> &[Sha1] {
        &self.order
    }

    /// Whether any commit was assigned.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Assigns branch IDs to every pushed commit.
pub struct Assigner<'ctx> {
    ctx: &'ctx Context,
    tuples: Vec<PreReceiveTuple>,
    nodes: HashMap<Sha1, AssignNode>,
    /// Topological order over the loaded (non-placeholder) nodes, parents
    /// first.
    topo: Vec<Sha1>,
}

impl<'ctx> Assigner<'ctx> {
    /// Construct for one push's pre-receive tuples.
    pub fn new(ctx: &'ctx Context, tuples: Vec<PreReceiveTuple>) -> Self {
        Assigner {
            ctx,
            tuples,
            nodes: HashMap::new(),
            topo: Vec::new(),
        }
    }

    /// Run the assignment and produce the finalized records.
    #[instrument(skip(self))]
    pub fn assign(mut self) -> eyre::Result<Assignments> {
        self.load_commit_dag()?;
        self.seed_from_mirror()?;
        self.ensure_ref_head_nodes()?;
        self.link_children();
        self.topo = self.topo_order();
        self.assign_branches_named()?;
        self.assign_branches_anon()?;
        self.force_assign_pushed_ref_heads()?;
        Ok(self.freeze())
    }

    /// Step 1: load the pushed commit DAG. One combined pass over all
    /// refs, then one pass per ref to fill in commits the combined range
    /// elided (a ref's old head excludes only that ref's history).
    fn load_commit_dag(&mut self) -> eyre::Result<()> {
        let git_repo = self.ctx.git_repo()?;
        let new_heads = self
            .tuples
            .iter()
            .filter_map(|tuple| tuple.new_sha1.into_option())
            .collect_vec();
        let old_heads = self
            .tuples
            .iter()
            .filter_map(|tuple| tuple.old_sha1.into_option())
            .collect_vec();

        let mut loaded: HashSet<Sha1> = HashSet::new();
        let combined = git_repo.rev_list_topo(&new_heads, &old_heads)?;
        for sha1 in combined {
            loaded.insert(sha1);
        }
        for tuple in &self.tuples {
            let new_sha1 = match tuple.new_sha1.into_option() {
                Some(new_sha1) => new_sha1,
                None => continue,
            };
            let exclude = tuple.old_sha1.into_option().into_iter().collect_vec();
            for sha1 in git_repo.rev_list_topo(&[new_sha1], &exclude)? {
                loaded.insert(sha1);
            }
        }

        for sha1 in &loaded {
            let info = git_repo
                .find_commit(*sha1)?
                .ok_or_else(|| eyre!("pushed commit {sha1} not found in Git"))?;
            // Full parent lists are kept; parents outside the push become
            // placeholder nodes and act only as stopping points.
            self.nodes.insert(
                *sha1,
                AssignNode {
                    parents: info.parents,
                    children: BTreeSet::new(),
                    branch_ids: BTreeSet::new(),
                    placeholder: false,
                },
            );
        }
        debug!(commits = self.nodes.len(), "loaded pushed commit DAG");
        Ok(())
    }

    /// Reverse links, second pass. Runs after placeholder nodes exist so
    /// old heads know their pushed children.
    fn link_children(&mut self) {
        let edges = self
            .nodes
            .iter()
            .flat_map(|(child, node)| {
                node.parents
                    .iter()
                    .map(|parent| (*parent, *child))
                    .collect_vec()
            })
            .collect_vec();
        for (parent, child) in edges {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.insert(child);
            }
        }
    }

    /// Kahn's algorithm over the loaded subgraph, tie-broken by sha so
    /// reruns produce the same order.
    fn topo_order(&self) -> Vec<Sha1> {
        let loaded_parent_count = |node: &AssignNode| {
            node.parents
                .iter()
                .filter(|parent| {
                    self.nodes
                        .get(parent)
                        .map(|parent_node| !parent_node.placeholder)
                        .unwrap_or(false)
                })
                .count()
        };
        let mut in_degree: BTreeMap<Sha1, usize> = self
            .nodes
            .iter()
            .filter(|(_, node)| !node.placeholder)
            .map(|(sha1, node)| (*sha1, loaded_parent_count(node)))
            .collect();
        let mut ready: BTreeSet<Sha1> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(sha1, _)| *sha1)
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(sha1) = ready.iter().next().copied() {
            ready.remove(&sha1);
            order.push(sha1);
            if let Some(node) = self.nodes.get(&sha1) {
                for child in &node.children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(*child);
                        }
                    }
                }
            }
        }
        order
    }

    /// Step 2: seed with assignments recorded by previous pushes.
    fn seed_from_mirror(&mut self) -> eyre::Result<()> {
        let mirror = self.ctx.object_mirror();
        let conn = self.ctx.mirror_conn();
        let shas = self.nodes.keys().copied().collect_vec();
        for sha1 in shas {
            let recorded = mirror
                .changes_for_commit(conn, sha1)
                .wrap_err("Reading mirror records for assignment seed")?;
            if recorded.is_empty() {
                continue;
            }
            let node = self.nodes.get_mut(&sha1).expect("node loaded above");
            for (branch_id, _change_num) in recorded {
                node.branch_ids.insert(branch_id);
            }
        }
        Ok(())
    }

    /// Step 3: every pushed-ref head and previously-known ref head gets a
    /// node, placeholder if outside the pushed range.
    fn ensure_ref_head_nodes(&mut self) -> eyre::Result<()> {
        let mut heads = Vec::new();
        for tuple in &self.tuples {
            if let Some(new_sha1) = tuple.new_sha1.into_option() {
                heads.push(new_sha1);
            }
            if let Some(old_sha1) = tuple.old_sha1.into_option() {
                heads.push(old_sha1);
            }
        }
        let git_repo = self.ctx.git_repo()?;
        for (_name, sha1) in git_repo.list_refs("refs/heads/")? {
            heads.push(sha1);
        }
        for sha1 in heads {
            self.nodes
                .entry(sha1)
                .or_insert_with(AssignNode::placeholder);
        }
        Ok(())
    }

    /// Resolve the branch a pushed ref lands on, minting a new named
    /// lightweight branch when the ref is new to the repo.
    fn ref_to_branch_id(&self, tuple: &PreReceiveTuple) -> eyre::Result<String> {
        let git_branch_name = tuple
            .git_branch_name()
            .ok_or_else(|| eyre!("unsupported ref for branch mapping: {}", tuple.ref_name))?;
        if let Some(branch) = self.ctx.branch_for_git_name(git_branch_name) {
            return Ok(branch.branch_id);
        }
        let template = {
            let dict = self.ctx.branch_dict.borrow();
            super::branch::most_equal(&dict)
                .cloned()
                .ok_or_else(|| eyre!("repo has no default branch to model new branches on"))?
        };
        let branch_id = format!("{git_branch_name}-{}", self.ctx.config.id_gen.next_id());
        let branch = Branch {
            branch_id: branch_id.clone(),
            git_branch_name: Some(git_branch_name.to_string()),
            stream_name: None,
            original_view: None,
            view: template.view.clone(),
            depot_branch_id: None,
            deleted: false,
            is_lightweight: true,
            is_new: true,
            more_equal: false,
        };
        self.ctx
            .branch_dict
            .borrow_mut()
            .insert(branch_id.clone(), branch);
        Ok(branch_id)
    }

    /// The pushed refs in priority order: the more-equal branch first,
    /// then named fully-populated branches alphabetically, then named
    /// lightweight branches in id order, then refs new to the repo.
    fn pushed_ref_sequence(&self) -> eyre::Result<Vec<(PreReceiveTuple, String)>> {
        let mut by_branch_id: BTreeMap<String, PreReceiveTuple> = BTreeMap::new();
        for tuple in &self.tuples {
            if tuple.new_sha1.into_option().is_none() {
                continue;
            }
            let branch_id = self.ref_to_branch_id(tuple)?;
            by_branch_id.insert(branch_id, tuple.clone());
        }
        let ordered_ids = {
            let dict = self.ctx.branch_dict.borrow();
            assignment_order(&dict)
                .into_iter()
                .map(|branch| branch.branch_id.clone())
                .collect_vec()
        };
        let mut sequence = Vec::new();
        for branch_id in ordered_ids {
            if let Some(tuple) = by_branch_id.remove(&branch_id) {
                sequence.push((tuple, branch_id));
            }
        }
        // Anything left is a ref whose branch the dict ordering skipped;
        // keep deterministic id order.
        for (branch_id, tuple) in by_branch_id {
            sequence.push((tuple, branch_id));
        }
        Ok(sequence)
    }

    /// Step 4: walk each pushed ref from its new head backward, claiming
    /// commits.
    fn assign_branches_named(&mut self) -> eyre::Result<()> {
        for (tuple, branch_id) in self.pushed_ref_sequence()? {
            let new_head = tuple.new_sha1.into_option().expect("deletes filtered");
            match tuple.old_sha1.into_option() {
                Some(old_head) => {
                    let reachable = self.descendants_of(old_head);
                    self.assign_path(&branch_id, new_head, Some(old_head), Some(&reachable));
                }
                None => {
                    self.assign_path(&branch_id, new_head, None, None);
                }
            }
        }
        Ok(())
    }

    /// All nodes from which `old_head` is reachable via parent links,
    /// i.e. the old head's descendants, plus the old head itself.
    fn descendants_of(&self, old_head: Sha1) -> HashSet<Sha1> {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::new();
        reachable.insert(old_head);
        queue.push_back(old_head);
        while let Some(current) = queue.pop_front() {
            let node = match self.nodes.get(&current) {
                Some(node) => node,
                None => continue,
            };
            for child in &node.children {
                if reachable.insert(*child) {
                    queue.push_back(*child);
                }
            }
        }
        reachable
    }

    /// Walk from `head` back toward `stop_at` (or the earliest unassigned
    /// ancestor), adding `branch_id` to unassigned nodes along the way.
    ///
    /// Parent selection, first match wins: unassigned first-parent,
    /// unassigned any parent, assigned first-parent, assigned any parent,
    /// all constrained to `reachable` when an old head exists.
    fn assign_path(
        &mut self,
        branch_id: &str,
        head: Sha1,
        stop_at: Option<Sha1>,
        reachable: Option<&HashSet<Sha1>>,
    ) {
        let mut current = head;
        let mut visited = HashSet::new();
        loop {
            if Some(current) == stop_at {
                break;
            }
            if !visited.insert(current) {
                break;
            }
            {
                let node = match self.nodes.get_mut(&current) {
                    Some(node) => node,
                    None => break,
                };
                if node.placeholder {
                    break;
                }
                if !node.is_assigned() || current == head {
                    node.branch_ids.insert(branch_id.to_string());
                }
            }
            let next = self.best_parent(current, reachable);
            match next {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }

    fn best_parent(&self, sha1: Sha1, reachable: Option<&HashSet<Sha1>>) -> Option<Sha1> {
        let node = self.nodes.get(&sha1)?;
        let eligible = |parent: &Sha1| -> bool {
            if let Some(reachable) = reachable {
                if !reachable.contains(parent) {
                    return false;
                }
            }
            self.nodes
                .get(parent)
                .map(|parent_node| !parent_node.placeholder)
                .unwrap_or(false)
        };
        let assigned = |parent: &Sha1| -> bool {
            self.nodes
                .get(parent)
                .map(AssignNode::is_assigned)
                .unwrap_or(false)
        };

        let first_parent = node.parents.first();
        if let Some(parent) = first_parent {
            if eligible(parent) && !assigned(parent) {
                return Some(*parent);
            }
        }
        if let Some(parent) = node
            .parents
            .iter()
            .find(|parent| eligible(parent) && !assigned(parent))
        {
            return Some(*parent);
        }
        if let Some(parent) = first_parent {
            if eligible(parent) {
                return Some(*parent);
            }
        }
        node.parents.iter().find(|parent| eligible(parent)).copied()
    }

    /// Step 5: anonymous branches for whatever named walks missed,
    /// newest-to-oldest so each anonymous branch covers a contiguous run.
    fn assign_branches_anon(&mut self) -> eyre::Result<()> {
        let mut pool = self.anon_branch_pool();
        let order = self.topo.iter().rev().copied().collect_vec();
        for sha1 in order {
            let needs_branch = self
                .nodes
                .get(&sha1)
                .map(|node| !node.placeholder && !node.is_assigned())
                .unwrap_or(false);
            if !needs_branch {
                continue;
            }
            let branch_id = match pool.pop_front() {
                Some(branch_id) => branch_id,
                None => self.mint_anon_branch()?,
            };
            self.assign_path(&branch_id, sha1, None, None);
        }
        Ok(())
    }

    /// Existing anonymous branches not yet claimed by this push, in id
    /// order.
    fn anon_branch_pool(&self) -> VecDeque<String> {
        let assigned_ids: HashSet<String> = self
            .nodes
            .values()
            .flat_map(|node| node.branch_ids.iter().cloned())
            .collect();
        self.ctx
            .branch_dict
            .borrow()
            .values()
            .filter(|branch| {
                branch.git_branch_name.is_none()
                    && !branch.deleted
                    && !assigned_ids.contains(&branch.branch_id)
            })
            .map(|branch| branch.branch_id.clone())
            .collect()
    }

    fn mint_anon_branch(&self) -> eyre::Result<String> {
        let template = {
            let dict = self.ctx.branch_dict.borrow();
            super::branch::most_equal(&dict)
                .cloned()
                .ok_or_else(|| eyre!("repo has no default branch to model new branches on"))?
        };
        let branch_id = format!("anon-{}", self.ctx.config.id_gen.next_id());
        let branch = Branch {
            branch_id: branch_id.clone(),
            git_branch_name: None,
            stream_name: None,
            original_view: None,
            view: template.view.clone(),
            depot_branch_id: None,
            deleted: false,
            is_lightweight: true,
            is_new: true,
            more_equal: false,
        };
        self.ctx
            .branch_dict
            .borrow_mut()
            .insert(branch_id.clone(), branch);
        Ok(branch_id)
    }

    /// Step 6: every pushed head carries its ref's branch, as a secondary
    /// assignment if something else claimed the commit first.
    fn force_assign_pushed_ref_heads(&mut self) -> eyre::Result<()> {
        for (tuple, branch_id) in self.pushed_ref_sequence()? {
            let new_head = tuple.new_sha1.into_option().expect("deletes filtered");
            if let Some(node) = self.nodes.get_mut(&new_head) {
                if !node.placeholder {
                    node.branch_ids.insert(branch_id);
                }
            }
        }
        Ok(())
    }

    /// Step 7: compact finalized records.
    fn freeze(self) -> Assignments {
        let by_sha1 = self
            .nodes
            .iter()
            .filter(|(_, node)| !node.placeholder && node.is_assigned())
            .map(|(sha1, node)| (*sha1, node.branch_ids.iter().cloned().collect_vec()))
            .collect();
        let order = self
            .topo
            .iter()
            .filter(|sha1| {
                self.nodes
                    .get(sha1)
                    .map(|node| !node.placeholder)
                    .unwrap_or(false)
            })
            .copied()
            .collect_vec();
        Assignments { by_sha1, order }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{test_context_with_git, InMemoryDepot, ScratchGitRepo};

    use super::*;

    fn tuple(old: Option<Sha1>, new: Sha1, ref_name: &str) -> PreReceiveTuple {
        PreReceiveTuple {
            old_sha1: old.into(),
            new_sha1: MaybeZeroSha1::from(new),
            ref_name: ref_name.to_string(),
        }
    }

    #[test]
    fn test_pre_receive_tuple_round_trip() {
        let line = "0000000000000000000000000000000000000000 \
                    1f6e71b2b1b423bd0c79a4e29f7e34283f0d3367 refs/heads/master";
        let parsed = PreReceiveTuple::from_line(line).unwrap();
        assert_eq!(parsed.old_sha1, MaybeZeroSha1::Zero);
        assert_eq!(parsed.git_branch_name(), Some("master"));
        assert_eq!(parsed.to_line(), line.split_whitespace().join(" "));
    }

    #[test]
    fn test_linear_push_single_branch() {
        let scratch = ScratchGitRepo::new();
        let a = scratch.commit(&[], &[("f", "x")]);
        let b = scratch.commit(&[a], &[("f", "y")]);
        let c = scratch.commit(&[b], &[("f", "y"), ("g", "z")]);
        let depot = InMemoryDepot::new();
        let ctx = test_context_with_git(&depot, "repoA", &scratch);

        let assigner = Assigner::new(&ctx, vec![tuple(None, c, "refs/heads/master")]);
        let assignments = assigner.assign().unwrap();

        let master_id = ctx.branch_for_git_name("master").unwrap().branch_id;
        assert_eq!(assignments.commits_in_order(), &[a, b, c]);
        for sha1 in [a, b, c] {
            assert_eq!(assignments.branch_ids(sha1), &[master_id.clone()]);
        }
    }

    #[test]
    fn test_feature_branch_claims_only_new_commits() {
        let scratch = ScratchGitRepo::new();
        let a = scratch.commit(&[], &[("f", "1")]);
        let b = scratch.commit(&[a], &[("f", "2")]);
        let f1 = scratch.commit(&[b], &[("g", "1")]);
        let f2 = scratch.commit(&[f1], &[("g", "2")]);
        let depot = InMemoryDepot::new();
        let ctx = test_context_with_git(&depot, "repoA", &scratch);

        // master already at `b`; push only the feature ref.
        let assigner = Assigner::new(
            &ctx,
            vec![tuple(Some(b), f2, "refs/heads/feature")],
        );
        let assignments = assigner.assign().unwrap();

        let feature_id = ctx.branch_for_git_name("feature").unwrap().branch_id;
        assert_eq!(assignments.commits_in_order(), &[f1, f2]);
        assert_eq!(assignments.branch_ids(f1), &[feature_id.clone()]);
        assert_eq!(assignments.branch_ids(f2), &[feature_id]);
        // The old head is not part of the push.
        assert!(assignments.branch_ids(b).is_empty());
    }

    #[test]
    fn test_two_refs_same_head_get_both_branches() {
        let scratch = ScratchGitRepo::new();
        let a = scratch.commit(&[], &[("f", "1")]);
        let depot = InMemoryDepot::new();
        let ctx = test_context_with_git(&depot, "repoA", &scratch);

        let assigner = Assigner::new(
            &ctx,
            vec![
                tuple(None, a, "refs/heads/master"),
                tuple(None, a, "refs/heads/mirror-of-master"),
            ],
        );
        let assignments = assigner.assign().unwrap();
        assert_eq!(assignments.branch_ids(a).len(), 2);
    }

    #[test]
    fn test_side_branch_of_merge_goes_anonymous() {
        let scratch = ScratchGitRepo::new();
        let a = scratch.commit(&[], &[("f", "1")]);
        let side = scratch.commit(&[a], &[("s", "1")]);
        let main2 = scratch.commit(&[a], &[("f", "2")]);
        let merge = scratch.commit(&[main2, side], &[("f", "2"), ("s", "1")]);
        let depot = InMemoryDepot::new();
        let ctx = test_context_with_git(&depot, "repoA", &scratch);

        let assigner = Assigner::new(&ctx, vec![tuple(None, merge, "refs/heads/master")]);
        let assignments = assigner.assign().unwrap();

        let master_id = ctx.branch_for_git_name("master").unwrap().branch_id;
        // First-parent chain belongs to master.
        assert_eq!(assignments.branch_ids(merge), &[master_id.clone()]);
        assert_eq!(assignments.branch_ids(main2), &[master_id.clone()]);
        assert_eq!(assignments.branch_ids(a), &[master_id]);
        // The side commit falls to an anonymous lightweight branch.
        let side_branches = assignments.branch_ids(side);
        assert_eq!(side_branches.len(), 1);
        assert!(side_branches[0].starts_with("anon-"));
    }

    #[test]
    fn test_rerun_is_stable() {
        let scratch = ScratchGitRepo::new();
        let a = scratch.commit(&[], &[("f", "1")]);
        let side = scratch.commit(&[a], &[("s", "1")]);
        let main2 = scratch.commit(&[a], &[("f", "2")]);
        let merge = scratch.commit(&[main2, side], &[("f", "2"), ("s", "1")]);

        let run = || {
            let depot = InMemoryDepot::new();
            let ctx = test_context_with_git(&depot, "repoA", &scratch);
            Assigner::new(&ctx, vec![tuple(None, merge, "refs/heads/master")])
                .assign()
                .unwrap()
        };
        assert_eq!(run(), run());
    }
}
