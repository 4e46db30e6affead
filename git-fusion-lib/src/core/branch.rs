//! A Git↔depot branch association: a Git ref short name bound to a view
//! mapping into the depot, possibly lightweight.

use std::collections::BTreeMap;

use itertools::Itertools;
use tracing::instrument;

use crate::depot::{Connection, DepotResult};

use super::config::{BranchSection, RepoConfig};
use super::depot_branch::{DepotBranchIndex, DepotBranchInfo};
use super::view_map::{Direction, MapFlag, ViewLine, ViewMap};

/// The branch dictionary for one repo, keyed by branch id.
pub type BranchDict = BTreeMap<String, Branch>;

/// A named (or anonymous) association between a Git ref and a region of
/// the depot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Branch {
    /// Stable identifier, unique per repo. Also the config section name.
    pub branch_id: String,

    /// Git ref short name (minus `refs/heads/`); `None` for anonymous
    /// branches.
    pub git_branch_name: Option<String>,

    /// Stream this branch is bound to, for stream branches.
    pub stream_name: Option<String>,

    /// Snapshot of the stream's view at branch-creation time.
    pub original_view: Option<ViewMap>,

    /// The branch's view into the depot. The right-hand side is
    /// repo-relative until [`Branch::set_rhs_client`] rewrites it.
    pub view: ViewMap,

    /// Storage region for lightweight branches.
    pub depot_branch_id: Option<String>,

    /// Latched when Git deletes the branch; the branch remains addressable
    /// for history.
    pub deleted: bool,

    /// Whether the branch stores only files changed on it.
    pub is_lightweight: bool,

    /// Whether this branch was created during the current push/fetch.
    pub is_new: bool,

    /// Whether this is the repo's default branch (the first section in the
    /// config file).
    pub more_equal: bool,
}

impl Branch {
    /// Construct from a config section.
    pub fn from_section(branch_id: &str, section: &BranchSection) -> super::view_map::Result<Self> {
        let view = match &section.view {
            Some(lines) => ViewMap::from_string(&lines.join("\n"))?,
            None => ViewMap::default(),
        };
        let original_view = match &section.original_view {
            Some(lines) => Some(ViewMap::from_string(&lines.join("\n"))?),
            None => None,
        };
        let is_lightweight = section.depot_branch_id.is_some() || section.git_branch_name.is_none();
        Ok(Branch {
            branch_id: branch_id.to_string(),
            git_branch_name: section.git_branch_name.clone(),
            stream_name: section.stream.clone(),
            original_view,
            view,
            depot_branch_id: section.depot_branch_id.clone(),
            deleted: section.deleted,
            is_lightweight,
            is_new: false,
            more_equal: false,
        })
    }

    /// Serialize back to a config section.
    pub fn to_section(&self) -> BranchSection {
        BranchSection {
            git_branch_name: self.git_branch_name.clone(),
            view: if self.view.is_empty() {
                None
            } else {
                Some(
                    self.view
                        .as_lines()
                        .iter()
                        .map(ViewLine::to_string)
                        .collect(),
                )
            },
            stream: self.stream_name.clone(),
            original_view: self.original_view.as_ref().map(|view| {
                view.as_lines()
                    .iter()
                    .map(ViewLine::to_string)
                    .collect()
            }),
            depot_branch_id: self.depot_branch_id.clone(),
            deleted: self.deleted,
        }
    }

    /// Whether a depot path is visible through this branch's view.
    pub fn intersects_depot_path(&self, depot_path: &str) -> bool {
        self.view.contains_lhs(depot_path)
    }

    /// Whether any path of a list is visible through this branch's view.
    pub fn intersects_depot_file_list<'a>(
        &self,
        depot_paths: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        depot_paths
            .into_iter()
            .any(|path| self.intersects_depot_path(path))
    }

    /// Rewrite the right-hand side to use a named client prefix:
    /// `docs/...` becomes `//<client>/docs/...`.
    pub fn set_rhs_client(&mut self, client_name: &str) {
        let lines = self
            .view
            .as_lines()
            .iter()
            .map(|line| {
                let rhs = if line.rhs.starts_with("//") {
                    line.rhs.clone()
                } else {
                    format!("//{client_name}/{}", line.rhs)
                };
                ViewLine {
                    flag: line.flag,
                    lhs: line.lhs.clone(),
                    rhs,
                }
            })
            .collect_vec();
        self.view = ViewMap::compile(lines).expect("recompiling client-prefixed view");
    }

    /// Copy this branch onto a new storage region: same shape, left-hand
    /// side rerooted to the new region's root.
    pub fn copy_rerooted(&self, new_branch_id: &str, new_region: &DepotBranchInfo) -> Branch {
        let old_root = self
            .depot_branch_root()
            .unwrap_or_else(|| lhs_root(&self.view).unwrap_or_default());
        let view = self
            .view
            .reroot_lhs(&old_root, &new_region.root_depot_path);
        Branch {
            branch_id: new_branch_id.to_string(),
            git_branch_name: None,
            stream_name: None,
            original_view: None,
            view,
            depot_branch_id: Some(new_region.depot_branch_id.clone()),
            deleted: false,
            is_lightweight: true,
            is_new: true,
            more_equal: false,
        }
    }

    fn depot_branch_root(&self) -> Option<String> {
        lhs_root(&self.view)
    }

    /// The view a lightweight branch would have if it were fully
    /// populated: every left-hand side rerooted from the branch's storage
    /// region onto `//`.
    pub fn fully_populated_view(&self, region_root: &str) -> ViewMap {
        let region_root = region_root.trim_end_matches('/');
        let lines = self
            .view
            .as_lines()
            .iter()
            .map(|line| {
                let lhs = match line.lhs.strip_prefix(region_root) {
                    // The remainder begins with `/`, so prefixing one more
                    // slash yields the `//`-rooted form.
                    Some(rest) => format!("/{rest}"),
                    None => line.lhs.clone(),
                };
                ViewLine {
                    flag: line.flag,
                    lhs,
                    rhs: line.rhs.clone(),
                }
            })
            .collect_vec();
        ViewMap::compile(lines).expect("recompiling fully-populated view")
    }

    /// Find the depot-branch-info record backing this branch.
    pub fn find_depot_branch<'index>(
        &self,
        index: &'index DepotBranchIndex,
    ) -> Option<&'index DepotBranchInfo> {
        if let Some(depot_branch_id) = &self.depot_branch_id {
            return index.get(depot_branch_id);
        }
        let root = self.depot_branch_root()?;
        index.find_by_depot_path(&format!("{root}/placeholder"))
    }

    /// The most recent changelist number on this branch, or `None` if no
    /// changelist intersects its view.
    #[instrument(skip(conn))]
    pub fn head_change_num(&self, conn: &dyn Connection) -> DepotResult<Option<u64>> {
        let patterns = self.included_lhs_patterns();
        if patterns.is_empty() {
            return Ok(None);
        }
        let mut args = vec!["-m1"];
        args.extend(patterns.iter().map(String::as_str));
        let rows = conn.run_tagged("changes", &args)?;
        let mut best = None;
        for row in rows {
            if let Some(change) = row.get_int("change")? {
                best = Some(best.map_or(change, |current: u64| current.max(change)));
            }
        }
        Ok(best)
    }

    /// Whether any changelist exists on this branch.
    #[instrument(skip(conn))]
    pub fn is_populated(&self, conn: &dyn Connection) -> DepotResult<bool> {
        Ok(self.head_change_num(conn)?.is_some())
    }

    /// The changelist at which this branch first diverged from its
    /// fully-populated basis.
    pub fn find_fully_populated_change_num(
        &self,
        index: &DepotBranchIndex,
    ) -> super::depot_branch::Result<Option<u64>> {
        match &self.depot_branch_id {
            Some(depot_branch_id) => index.basis_change_num(depot_branch_id),
            None => Ok(None),
        }
    }

    /// The non-excluded left-hand patterns of the view.
    pub fn included_lhs_patterns(&self) -> Vec<String> {
        self.view
            .as_lines()
            .iter()
            .filter(|line| line.flag != MapFlag::Exclude)
            .map(|line| line.lhs.clone())
            .collect()
    }

    /// Translate a depot path to the branch's repo-relative path.
    pub fn depot_to_repo_path(&self, depot_path: &str) -> Option<String> {
        self.view.translate(depot_path, Direction::LhsToRhs)
    }

    /// Translate a repo-relative path to the branch's depot path.
    pub fn repo_to_depot_path(&self, repo_path: &str) -> Option<String> {
        self.view.translate(repo_path, Direction::RhsToLhs)
    }
}

fn lhs_root(view: &ViewMap) -> Option<String> {
    let first = view
        .as_lines()
        .iter()
        .find(|line| line.flag != MapFlag::Exclude)?;
    let lhs = &first.lhs;
    let end = lhs.find("/...").unwrap_or(lhs.len());
    Some(lhs[..end].to_string())
}

/// Build the branch dictionary from a parsed repo config. The first branch
/// section becomes the "more equal" default branch.
pub fn dict_from_config(config: &RepoConfig) -> super::view_map::Result<BranchDict> {
    let mut dict = BranchDict::new();
    for (index, (branch_id, section)) in config.branches.iter().enumerate() {
        let mut branch = Branch::from_section(branch_id, section)?;
        branch.more_equal = index == 0;
        dict.insert(branch_id.clone(), branch);
    }
    Ok(dict)
}

/// The repo's default branch, used for `HEAD`.
pub fn most_equal(dict: &BranchDict) -> Option<&Branch> {
    dict.values().find(|branch| branch.more_equal)
}

/// All branches not latched deleted.
pub fn undeleted_branches(dict: &BranchDict) -> impl Iterator<Item = &Branch> {
    dict.values().filter(|branch| !branch.deleted)
}

/// Compute the union client view across every undeleted branch in the
/// dict: each branch's inclusion lines, right-hand side bound to
/// `client_name`, deduplicated in first-seen order. Used for the union
/// temp client and the instance's interest list.
pub fn calc_branch_union_view(client_name: &str, dict: &BranchDict) -> Vec<ViewLine> {
    let mut seen = std::collections::HashSet::new();
    let mut lines = Vec::new();
    for branch in undeleted_branches(dict) {
        for line in branch.view.as_lines() {
            if line.flag == MapFlag::Exclude {
                continue;
            }
            let rhs = if line.rhs.starts_with("//") {
                line.rhs.clone()
            } else {
                format!("//{client_name}/{}", line.rhs)
            };
            // Identical lhs patterns from different branches collapse; the
            // union view only needs each depot region once.
            if !seen.insert(line.lhs.clone()) {
                continue;
            }
            lines.push(ViewLine {
                flag: MapFlag::Include,
                lhs: line.lhs.clone(),
                rhs,
            });
        }
    }
    lines
}

/// Deterministic ordering of pushed branches for assignment: the
/// more-equal branch first, then named fully-populated branches in
/// alphabetical order, then named lightweight branches in id order.
pub fn assignment_order(dict: &BranchDict) -> Vec<&Branch> {
    let mut more_equal = Vec::new();
    let mut named_fp = Vec::new();
    let mut named_lw = Vec::new();
    for branch in undeleted_branches(dict) {
        if branch.more_equal {
            more_equal.push(branch);
        } else if branch.git_branch_name.is_some() && !branch.is_lightweight {
            named_fp.push(branch);
        } else if branch.git_branch_name.is_some() {
            named_lw.push(branch);
        }
    }
    named_fp.sort_by(|lhs, rhs| lhs.git_branch_name.cmp(&rhs.git_branch_name));
    named_lw.sort_by(|lhs, rhs| lhs.branch_id.cmp(&rhs.branch_id));
    more_equal
        .into_iter()
        .chain(named_fp)
        .chain(named_lw)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch_with_view(branch_id: &str, lines: &[&str]) -> Branch {
        let section = BranchSection {
            git_branch_name: Some(branch_id.to_string()),
            view: Some(lines.iter().map(|l| l.to_string()).collect()),
            ..Default::default()
        };
        Branch::from_section(branch_id, &section).unwrap()
    }

    #[test]
    fn test_intersects_depot_path() {
        let branch = branch_with_view("master", &["//depot/main/... ..."]);
        assert!(branch.intersects_depot_path("//depot/main/a.txt"));
        assert!(!branch.intersects_depot_path("//depot/other/a.txt"));
        assert!(branch.intersects_depot_file_list(vec![
            "//depot/other/a.txt",
            "//depot/main/b.txt",
        ]));
    }

    #[test]
    fn test_set_rhs_client() {
        let mut branch = branch_with_view("master", &["//depot/main/... ..."]);
        branch.set_rhs_client("p4gf_repoA");
        assert_eq!(
            branch.view.as_lines()[0].rhs,
            "//p4gf_repoA/...".to_string()
        );
        assert_eq!(
            branch.depot_to_repo_path("//depot/main/x.c"),
            Some("//p4gf_repoA/x.c".to_string())
        );
    }

    #[test]
    fn test_fully_populated_view() {
        let branch = branch_with_view(
            "task1",
            &["//.git-fusion/branches/anon-0001/... ..."],
        );
        let fp = branch.fully_populated_view("//.git-fusion/branches/anon-0001");
        assert_eq!(fp.as_lines()[0].lhs, "//...");
    }

    #[test]
    fn test_copy_rerooted() {
        let parent = branch_with_view("master", &["//depot/main/... ..."]);
        let region = DepotBranchInfo::new("anon-0001", "//.git-fusion/branches/anon-0001");
        let child = parent.copy_rerooted("anon-0001-branch", &region);
        assert!(child.is_lightweight);
        assert!(child.is_new);
        assert_eq!(
            child.view.as_lines()[0].lhs,
            "//.git-fusion/branches/anon-0001/..."
        );
        assert_eq!(child.view.as_lines()[0].rhs, "...");
    }

    #[test]
    fn test_assignment_order() {
        let mut dict = BranchDict::new();
        let mut master = branch_with_view("id-master", &["//depot/main/... ..."]);
        master.more_equal = true;
        master.git_branch_name = Some("master".to_string());
        dict.insert(master.branch_id.clone(), master);

        let mut beta = branch_with_view("id-beta", &["//depot/beta/... ..."]);
        beta.git_branch_name = Some("beta".to_string());
        dict.insert(beta.branch_id.clone(), beta);

        let mut alpha = branch_with_view("id-alpha", &["//depot/alpha/... ..."]);
        alpha.git_branch_name = Some("alpha".to_string());
        dict.insert(alpha.branch_id.clone(), alpha);

        let mut task = branch_with_view("id-task", &["//depot/task/... ..."]);
        task.git_branch_name = Some("task".to_string());
        task.is_lightweight = true;
        dict.insert(task.branch_id.clone(), task);

        let order: Vec<&str> = assignment_order(&dict)
            .into_iter()
            .map(|branch| branch.branch_id.as_str())
            .collect();
        assert_eq!(order, vec!["id-master", "id-alpha", "id-beta", "id-task"]);
    }

    #[test]
    fn test_union_view_dedupes() {
        let mut dict = BranchDict::new();
        let one = branch_with_view("one", &["//depot/main/... ..."]);
        let two = branch_with_view("two", &["//depot/main/... ...", "//depot/doc/... doc/..."]);
        dict.insert(one.branch_id.clone(), one);
        dict.insert(two.branch_id.clone(), two);
        let union = calc_branch_union_view("p4gf_repo", &dict);
        let lhs: Vec<&str> = union.iter().map(|line| line.lhs.as_str()).collect();
        assert_eq!(lhs, vec!["//depot/main/...", "//depot/doc/..."]);
        assert!(union[0].rhs.starts_with("//p4gf_repo/"));
    }

    #[test]
    fn test_section_round_trip() {
        let branch = branch_with_view(
            "master",
            &["//depot/main/... ...", "-//depot/main/tmp/... tmp/..."],
        );
        let section = branch.to_section();
        let reparsed = Branch::from_section("master", &section).unwrap();
        assert_eq!(reparsed.view, branch.view);
        assert_eq!(reparsed.git_branch_name, branch.git_branch_name);
    }
}
