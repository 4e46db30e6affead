//! The per-commit discovery matrix.
//!
//! Copying one Git commit to the depot means reconciling several states:
//! what Git wants the destination tree to be, what the destination branch
//! currently holds, what each Git parent's branch holds, and what the
//! fully-populated basis could supply. Each of those is a column; rows are
//! repo-relative paths. Discovery fills cells from depot queries and Git
//! tree walks; the row decider turns cells into per-file actions.

use std::collections::BTreeMap;

use eyre::eyre;
use itertools::Itertools;
use serde::Serialize;
use tracing::instrument;

use crate::depot::Connection;
use crate::git::{CommitInfo, DeltaKind, GitFileMode, Sha1};

use super::super::branch::Branch;
use super::super::context::Context;
use super::super::mirror::ObjectMirror;

/// What a column represents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ColumnKind {
    /// The destination: current commit on the current branch.
    GDest,

    /// The current branch's fully-populated basis.
    P4JitFp,

    /// The previous changelist on this branch, when no Git parent already
    /// sits on this branch.
    P4Imply,

    /// One Git parent, paired with its assigned branch.
    GParN {
        /// Parent ordinal; 0 is the first parent.
        nth: usize,
    },

    /// The fully-populated basis of a lightweight `GParN`.
    GParFpN {
        /// Parent ordinal this basis belongs to.
        nth: usize,
    },

    /// The post-ghost destination state, present when a preparatory
    /// changelist must rearrange the branch first.
    Ghost,
}

/// One column of the matrix.
#[derive(Clone, Debug, Serialize)]
pub struct Column {
    /// What the column represents.
    pub kind: ColumnKind,

    /// The branch the column reads, where applicable.
    pub branch_id: Option<String>,

    /// The changelist at which the column's branch is read.
    pub change_num: Option<u64>,

    /// The Git commit backing the column, where applicable.
    #[serde(skip)]
    pub sha1: Option<Sha1>,
}

/// Discovery results for one (row, column) intersection.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Cell {
    /// Depot path of the file in this column's branch.
    pub depot_path: Option<String>,

    /// File revision at the column's changelist.
    pub depot_rev: Option<u64>,

    /// Head action at that revision (`add`, `edit`, `delete`, …).
    pub depot_action: Option<String>,

    /// Depot filetype string.
    pub depot_filetype: Option<String>,

    /// Git file mode, for Git-backed columns.
    #[serde(skip)]
    pub mode: Option<GitFileMode>,

    /// Git blob ID, for Git-backed columns.
    #[serde(skip)]
    pub blob_sha1: Option<Sha1>,
}

impl Cell {
    /// Whether this cell discovered a live file (present and not deleted
    /// at the column's changelist).
    pub fn exists(&self) -> bool {
        if let Some(action) = &self.depot_action {
            if action.contains("delete") {
                return false;
            }
        }
        self.depot_path.is_some() || self.blob_sha1.is_some()
    }
}

/// One row: a repo-relative path, its cells, and the Git delta for the
/// destination commit.
#[derive(Clone, Debug, Serialize)]
pub struct Row {
    /// Repo-relative ("Git working tree") path.
    pub gwt_path: String,

    /// The path's location on the destination branch.
    pub depot_path: String,

    /// One cell per column, in column order.
    pub cells: Vec<Option<Cell>>,

    /// What Git wants done to this path, from diff-tree between the
    /// implied parent and the destination.
    pub git_delta: Option<DeltaKind>,
}

impl Row {
    /// The cell under a column index.
    pub fn cell(&self, column_index: usize) -> Option<&Cell> {
        self.cells.get(column_index).and_then(Option::as_ref)
    }

    /// Whether the path exists in the destination commit's Git tree.
    pub fn exists_in_git_dest(&self, gdest_index: usize) -> bool {
        self.cell(gdest_index)
            .map(|cell| cell.blob_sha1.is_some())
            .unwrap_or(false)
    }
}

/// The discovery matrix for one commit on one branch.
#[derive(Debug, Serialize)]
pub struct Matrix {
    /// Columns, `GDest` always first.
    pub columns: Vec<Column>,

    /// Rows keyed by repo-relative path.
    pub rows: BTreeMap<String, Row>,
}

impl Matrix {
    /// Index of the destination column.
    pub fn gdest_index(&self) -> usize {
        0
    }

    /// Index of the `P4JitFp` column, if present.
    pub fn jitfp_index(&self) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.kind == ColumnKind::P4JitFp)
    }

    /// Index of the `P4Imply` column, if present.
    pub fn imply_index(&self) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.kind == ColumnKind::P4Imply)
    }

    /// Indexes of all Git-parent columns, first parent first.
    pub fn parent_indexes(&self) -> Vec<usize> {
        self.columns
            .iter()
            .positions(|column| matches!(column.kind, ColumnKind::GParN { .. }))
            .collect()
    }

    /// Index of the basis column paired with a parent column, if any.
    pub fn parent_basis_index(&self, parent_index: usize) -> Option<usize> {
        let nth = match self.columns.get(parent_index)?.kind {
            ColumnKind::GParN { nth } => nth,
            _ => return None,
        };
        self.columns
            .iter()
            .position(|column| column.kind == ColumnKind::GParFpN { nth })
    }

    /// Build and populate the matrix for `commit` landing on `branch`.
    ///
    /// `parent_branches` pairs each Git parent with its assigned branch
    /// and the changelist it was (or will be) copied to.
    #[instrument(skip_all, fields(sha1 = %commit.sha1, branch_id = %branch.branch_id))]
    pub fn discover(
        ctx: &Context,
        commit: &CommitInfo,
        branch: &Branch,
        parent_branches: &[(Sha1, String, Option<u64>)],
    ) -> eyre::Result<Matrix> {
        let mut columns = vec![Column {
            kind: ColumnKind::GDest,
            branch_id: Some(branch.branch_id.clone()),
            change_num: None,
            sha1: Some(commit.sha1),
        }];

        // P4JITFP: the branch's fully-populated basis, if lightweight.
        let basis_change = branch
            .find_fully_populated_change_num(&ctx.depot_branch_index.borrow())
            .map_err(|err| eyre!("{err}"))?;
        if branch.is_lightweight {
            if let Some(basis_change) = basis_change {
                columns.push(Column {
                    kind: ColumnKind::P4JitFp,
                    branch_id: None,
                    change_num: Some(basis_change),
                    sha1: None,
                });
            }
        }

        // P4IMPLY: the previous changelist on this branch, when no Git
        // parent is already assigned here.
        let parent_on_this_branch = parent_branches
            .iter()
            .any(|(_, parent_branch_id, _)| parent_branch_id == &branch.branch_id);
        let head_change = branch.head_change_num(ctx.conn())?;
        if !parent_on_this_branch {
            if let Some(head_change) = head_change {
                columns.push(Column {
                    kind: ColumnKind::P4Imply,
                    branch_id: Some(branch.branch_id.clone()),
                    change_num: Some(head_change),
                    sha1: None,
                });
            }
        }

        for (nth, (parent_sha1, parent_branch_id, parent_change)) in
            parent_branches.iter().enumerate()
        {
            columns.push(Column {
                kind: ColumnKind::GParN { nth },
                branch_id: Some(parent_branch_id.clone()),
                change_num: *parent_change,
                sha1: Some(*parent_sha1),
            });
            let parent_branch = ctx.branch_dict.borrow().get(parent_branch_id).cloned();
            if let Some(parent_branch) = parent_branch {
                if parent_branch.is_lightweight {
                    let parent_basis = parent_branch
                        .find_fully_populated_change_num(&ctx.depot_branch_index.borrow())
                        .map_err(|err| eyre!("{err}"))?;
                    if let Some(parent_basis) = parent_basis {
                        columns.push(Column {
                            kind: ColumnKind::GParFpN { nth },
                            branch_id: None,
                            change_num: Some(parent_basis),
                            sha1: None,
                        });
                    }
                }
            }
        }

        let mut matrix = Matrix {
            columns,
            rows: BTreeMap::new(),
        };
        matrix.populate(ctx, commit, branch)?;
        Ok(matrix)
    }

    fn ensure_row(&mut self, gwt_path: &str, branch: &Branch) -> &mut Row {
        let column_count = self.columns.len();
        self.rows
            .entry(gwt_path.to_string())
            .or_insert_with(|| Row {
                gwt_path: gwt_path.to_string(),
                depot_path: branch.repo_to_depot_path(gwt_path).unwrap_or_default(),
                cells: vec![None; column_count],
                git_delta: None,
            })
    }

    /// Fill cells: enumeration queries per depot column, Git tree walks
    /// for Git-backed columns, and the diff-tree delta for the
    /// destination.
    fn populate(
        &mut self,
        ctx: &Context,
        commit: &CommitInfo,
        branch: &Branch,
    ) -> eyre::Result<()> {
        let git_repo = ctx.git_repo()?;

        // GDEST git tree walk.
        let gdest_index = self.gdest_index();
        for entry in git_repo.ls_tree(commit.sha1)? {
            let row = self.ensure_row(&entry.path, branch);
            row.cells[gdest_index] = Some(Cell {
                mode: Some(entry.mode),
                blob_sha1: Some(entry.sha1),
                ..Default::default()
            });
        }

        // Depot enumeration per depot-backed column.
        let depot_columns = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, column)| {
                matches!(
                    column.kind,
                    ColumnKind::P4JitFp | ColumnKind::P4Imply | ColumnKind::GParN { .. }
                        | ColumnKind::GParFpN { .. }
                )
            })
            .map(|(index, column)| (index, column.clone()))
            .collect_vec();
        for (column_index, column) in depot_columns {
            self.discover_depot_files(ctx, branch, column_index, &column)?;
        }

        // Git tree walks for parent columns.
        let parent_columns = self
            .columns
            .iter()
            .enumerate()
            .filter_map(|(index, column)| match column.kind {
                ColumnKind::GParN { .. } => column.sha1.map(|sha1| (index, sha1)),
                _ => None,
            })
            .collect_vec();
        for (column_index, parent_sha1) in parent_columns {
            for entry in git_repo.ls_tree(parent_sha1)? {
                let row = self.ensure_row(&entry.path, branch);
                let cell = row.cells[column_index].get_or_insert_with(Cell::default);
                cell.mode = Some(entry.mode);
                cell.blob_sha1 = Some(entry.sha1);
            }
        }

        // The Git delta: implied parent vs destination.
        let implied_parent = commit.parents.first().copied();
        for delta in git_repo.diff_commits(implied_parent, commit.sha1)? {
            let row = self.ensure_row(&delta.path, branch);
            row.git_delta = Some(delta.kind);
        }
        Ok(())
    }

    /// Enumerate the files of one depot-backed column at its changelist.
    fn discover_depot_files(
        &mut self,
        ctx: &Context,
        branch: &Branch,
        column_index: usize,
        column: &Column,
    ) -> eyre::Result<()> {
        let conn = ctx.conn();
        let change_num = match column.change_num {
            Some(change_num) => change_num,
            None => return Ok(()),
        };
        let (view_branch, via_basis) = match column.kind {
            ColumnKind::P4JitFp => (branch.clone(), true),
            ColumnKind::GParFpN { nth } => {
                // The basis of the nth parent's lightweight branch.
                let parent_branch_id = self
                    .columns
                    .iter()
                    .find(|candidate| candidate.kind == ColumnKind::GParN { nth })
                    .and_then(|candidate| candidate.branch_id.clone())
                    .ok_or_else(|| eyre!("basis column with no paired parent"))?;
                let dict = ctx.branch_dict.borrow();
                (
                    dict.get(&parent_branch_id)
                        .cloned()
                        .ok_or_else(|| eyre!("column names unknown branch {parent_branch_id}"))?,
                    true,
                )
            }
            _ => {
                let branch_id = column
                    .branch_id
                    .as_ref()
                    .ok_or_else(|| eyre!("depot column with no branch"))?;
                let dict = ctx.branch_dict.borrow();
                (
                    dict.get(branch_id)
                        .cloned()
                        .ok_or_else(|| eyre!("column names unknown branch {branch_id}"))?,
                    false,
                )
            }
        };
        // Basis columns read through the fully-populated basis branch's
        // own view; the rhs shape is shared with the branch it backs, so
        // repo-relative paths line up with the destination rows.
        let view_branch = if via_basis {
            match basis_branch(ctx, &view_branch) {
                Some(basis) => basis,
                None => return Ok(()),
            }
        } else {
            view_branch
        };

        for pattern in view_branch.included_lhs_patterns() {
            let arg = format!("{pattern}@{change_num}");
            for file_row in conn.run_tagged("files", &["-e", &arg])? {
                let depot_path = match file_row.get("depotFile") {
                    Some(depot_path) => depot_path.to_string(),
                    None => continue,
                };
                let gwt_path = match view_branch.depot_to_repo_path(&depot_path) {
                    Some(gwt_path) => gwt_path,
                    None => continue,
                };
                let rev = file_row.get_int("rev")?;
                let action = file_row.get("action").map(str::to_string);
                let filetype = file_row.get("type").map(str::to_string);
                let row = self.ensure_row(&gwt_path, branch);
                let cell = row.cells[column_index].get_or_insert_with(Cell::default);
                cell.depot_path = Some(depot_path);
                cell.depot_rev = rev;
                cell.depot_action = action;
                cell.depot_filetype = filetype;
            }
        }
        Ok(())
    }

    /// The fully-populated branch a lightweight branch ultimately bottoms
    /// out on: walk the storage region's parent chain until an id that
    /// names a non-lightweight branch in the dict.
    pub fn basis_branch_of(ctx: &Context, lightweight: &Branch) -> Option<Branch> {
        basis_branch(ctx, lightweight)
    }

    /// Add the post-ghost column after a ghost changelist submits: the
    /// destination branch re-read at the ghost's changelist.
    pub fn add_ghost_column(&mut self, ghost_change_num: u64) {
        self.columns.push(Column {
            kind: ColumnKind::Ghost,
            branch_id: self.columns[0].branch_id.clone(),
            change_num: Some(ghost_change_num),
            sha1: None,
        });
        for row in self.rows.values_mut() {
            row.cells.push(None);
        }
    }

    /// Re-run destination-branch discovery against the post-ghost state.
    pub fn rediscover_after_ghost(
        &mut self,
        ctx: &Context,
        branch: &Branch,
        ghost_change_num: u64,
    ) -> eyre::Result<()> {
        self.add_ghost_column(ghost_change_num);
        let ghost_index = self.columns.len() - 1;
        let column = self.columns[ghost_index].clone();
        self.discover_depot_files(ctx, branch, ghost_index, &column)?;
        Ok(())
    }

    /// Whether a row's destination path sits under a symlink ancestor in
    /// the destination tree.
    pub fn has_symlink_ancestor(&self, gwt_path: &str) -> bool {
        let gdest_index = self.gdest_index();
        let mut prefix = String::new();
        for component in gwt_path.split('/') {
            if !prefix.is_empty() {
                if let Some(row) = self.rows.get(&prefix) {
                    if let Some(cell) = row.cell(gdest_index) {
                        if cell.mode == Some(GitFileMode::Symlink) {
                            return true;
                        }
                    }
                }
                prefix.push('/');
            }
            prefix.push_str(component);
        }
        false
    }

    /// Record the mirrored changelist for each parent commit, resolving a
    /// parent column's change number from the object mirror when the
    /// assigner could not supply it.
    pub fn resolve_parent_changes(
        &mut self,
        conn: &dyn Connection,
        mirror: &ObjectMirror,
    ) -> eyre::Result<()> {
        for column in &mut self.columns {
            if let ColumnKind::GParN { .. } = column.kind {
                if column.change_num.is_none() {
                    if let (Some(sha1), Some(branch_id)) = (column.sha1, &column.branch_id) {
                        column.change_num =
                            mirror.change_num_for_commit(conn, sha1, branch_id)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn basis_branch(ctx: &Context, lightweight: &Branch) -> Option<Branch> {
    let dict = ctx.branch_dict.borrow();
    let index = ctx.depot_branch_index.borrow();
    let mut queue: std::collections::VecDeque<String> = lightweight
        .depot_branch_id
        .iter()
        .cloned()
        .collect();
    let mut seen = std::collections::HashSet::new();
    while let Some(region_id) = queue.pop_front() {
        if !seen.insert(region_id.clone()) {
            continue;
        }
        let info = match index.get(&region_id) {
            Some(info) => info,
            None => {
                // Not a storage region: the id names a branch directly.
                if let Some(branch) = dict.get(&region_id) {
                    if !branch.is_lightweight {
                        return Some(branch.clone());
                    }
                }
                continue;
            }
        };
        for parent_id in &info.parent_ids {
            if let Some(branch) = dict.get(parent_id) {
                if !branch.is_lightweight {
                    return Some(branch.clone());
                }
            }
            queue.push_back(parent_id.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(kind: ColumnKind) -> Column {
        Column {
            kind,
            branch_id: None,
            change_num: None,
            sha1: None,
        }
    }

    fn empty_matrix(kinds: Vec<ColumnKind>) -> Matrix {
        Matrix {
            columns: kinds.into_iter().map(column).collect(),
            rows: BTreeMap::new(),
        }
    }

    #[test]
    fn test_column_indexes() {
        let matrix = empty_matrix(vec![
            ColumnKind::GDest,
            ColumnKind::P4JitFp,
            ColumnKind::GParN { nth: 0 },
            ColumnKind::GParFpN { nth: 0 },
            ColumnKind::GParN { nth: 1 },
        ]);
        assert_eq!(matrix.gdest_index(), 0);
        assert_eq!(matrix.jitfp_index(), Some(1));
        assert_eq!(matrix.imply_index(), None);
        assert_eq!(matrix.parent_indexes(), vec![2, 4]);
        assert_eq!(matrix.parent_basis_index(2), Some(3));
        assert_eq!(matrix.parent_basis_index(4), None);
    }

    #[test]
    fn test_symlink_ancestor() {
        let mut matrix = empty_matrix(vec![ColumnKind::GDest]);
        matrix.rows.insert(
            "link".to_string(),
            Row {
                gwt_path: "link".to_string(),
                depot_path: "//depot/main/link".to_string(),
                cells: vec![Some(Cell {
                    mode: Some(GitFileMode::Symlink),
                    blob_sha1: Some("ab".repeat(20).parse().unwrap()),
                    ..Default::default()
                })],
                git_delta: Some(DeltaKind::Add),
            },
        );
        matrix.rows.insert(
            "link/file.txt".to_string(),
            Row {
                gwt_path: "link/file.txt".to_string(),
                depot_path: "//depot/main/link/file.txt".to_string(),
                cells: vec![None],
                git_delta: Some(DeltaKind::Add),
            },
        );
        assert!(matrix.has_symlink_ancestor("link/file.txt"));
        assert!(!matrix.has_symlink_ancestor("link"));
        assert!(!matrix.has_symlink_ancestor("other/file.txt"));
    }

    #[test]
    fn test_cell_exists() {
        let live = Cell {
            depot_path: Some("//depot/main/a".to_string()),
            depot_action: Some("edit".to_string()),
            ..Default::default()
        };
        assert!(live.exists());
        let deleted = Cell {
            depot_path: Some("//depot/main/a".to_string()),
            depot_action: Some("delete".to_string()),
            ..Default::default()
        };
        assert!(!deleted.exists());
        assert!(!Cell::default().exists());
    }

    #[test]
    fn test_add_ghost_column_extends_rows() {
        let mut matrix = empty_matrix(vec![ColumnKind::GDest]);
        matrix.rows.insert(
            "a".to_string(),
            Row {
                gwt_path: "a".to_string(),
                depot_path: "//depot/main/a".to_string(),
                cells: vec![None],
                git_delta: None,
            },
        );
        matrix.add_ghost_column(55);
        assert_eq!(matrix.columns.len(), 2);
        assert!(matrix.rows["a"].cells.len() == 2);
        assert_eq!(matrix.columns[1].change_num, Some(55));
    }
}
