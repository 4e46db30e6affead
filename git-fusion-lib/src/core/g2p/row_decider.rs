//! Per-row decisions: given one row's discovery cells and its Git delta,
//! choose integration sources, a fallback, and a final request verb.

use serde::Serialize;

use crate::git::DeltaKind;

use super::matrix::{Matrix, Row};

/// The file operation ultimately requested of the depot for one row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RequestVerb {
    /// Open for add, content from the Git blob.
    Add,

    /// Open for edit, content from the Git blob.
    Edit,

    /// Open for delete.
    Delete,
}

/// One decided integration from a source column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IntegDecision {
    /// Index of the source column in the matrix.
    pub source_column: usize,

    /// Flags for the integ request.
    pub integ_flags: String,

    /// Flags for the follow-up resolve.
    pub resolve_flags: String,

    /// What to do instead if the server refuses the integration. Never
    /// `Delete`: a refused integration must not silently destroy a file.
    pub fallback: Option<RequestVerb>,
}

/// The outcome of deciding one row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Decided {
    /// Integrations to run, in order.
    pub integs: Vec<IntegDecision>,

    /// The content-bearing (or deleting) request.
    pub verb: Option<RequestVerb>,

    /// Whether the row is satisfied by a just-in-time branch from the
    /// fully-populated basis.
    pub jit_branch: bool,
}

impl Decided {
    /// Whether the decision does anything at all.
    pub fn is_noop(&self) -> bool {
        self.integs.is_empty() && self.verb.is_none()
    }
}

/// One action of a ghost (preparatory) changelist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GhostAction {
    /// Repo-relative path.
    pub gwt_path: String,

    /// What the ghost does to the path.
    pub kind: GhostActionKind,
}

/// The kinds of ghost rearrangement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum GhostActionKind {
    /// Branch the file in from the fully-populated basis.
    BranchFromBasis {
        /// The file's depot path inside the basis.
        basis_depot_path: String,
    },

    /// Copy the file in from a parent branch's state.
    PopulateFrom {
        /// Index of the source column.
        source_column: usize,
    },

    /// Delete a file the parent commit's tree does not have.
    Delete,
}

/// A ghost submission plan. Phase one rearranges the branch to mimic the
/// parent commit's tree; phase two deletes files whose removal belongs to
/// the preparatory history rather than the real changelist (a delete of a
/// file the branch never stored cannot be opened directly, so it is
/// branched in and then deleted).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GhostPlan {
    /// Rearrangement actions: populate and delete.
    pub phase_one: Vec<GhostAction>,

    /// Deletes of files phase one branched in solely to be deleted.
    pub phase_two: Vec<GhostAction>,
}

impl GhostPlan {
    /// Whether no ghost changelist is needed.
    pub fn is_empty(&self) -> bool {
        self.phase_one.is_empty() && self.phase_two.is_empty()
    }
}

/// Whether the row's file currently exists on the destination branch, at
/// the latest known state (the post-ghost column once present, otherwise
/// the implied-parent changelist).
fn on_dest_branch(matrix: &Matrix, row: &Row) -> bool {
    let ghost_index = matrix
        .columns
        .iter()
        .position(|column| column.kind == super::matrix::ColumnKind::Ghost);
    if let Some(ghost_index) = ghost_index {
        return row.cell(ghost_index).map(|c| c.exists()).unwrap_or(false);
    }
    if let Some(imply_index) = matrix.imply_index() {
        return row.cell(imply_index).map(|c| c.exists()).unwrap_or(false);
    }
    // No imply column: a Git parent sits on this branch, so the branch
    // holds exactly what that parent's changelist wrote.
    matrix
        .parent_indexes()
        .first()
        .and_then(|&parent_index| row.cell(parent_index))
        .map(|cell| {
            cell.depot_path.is_some() && cell.exists()
        })
        .unwrap_or(false)
}

/// Decide one row of the matrix.
pub fn decide(matrix: &Matrix, row: &Row) -> Decided {
    // Never create anything under a symlink ancestor; preflight already
    // rejected pushes that try.
    if matrix.has_symlink_ancestor(&row.gwt_path) {
        return Decided::default();
    }

    let exists_on_branch = on_dest_branch(matrix, row);
    match row.git_delta {
        None => Decided::default(),
        Some(DeltaKind::Delete) => {
            if exists_on_branch {
                Decided {
                    verb: Some(RequestVerb::Delete),
                    ..Default::default()
                }
            } else {
                // The branch never stored the file; the ghost plan already
                // handled any required branch-then-delete sequence.
                Decided::default()
            }
        }
        Some(DeltaKind::Add) | Some(DeltaKind::Modify) => {
            decide_content(matrix, row, exists_on_branch)
        }
    }
}

fn decide_content(matrix: &Matrix, row: &Row, exists_on_branch: bool) -> Decided {
    let fallback_verb = if exists_on_branch {
        RequestVerb::Edit
    } else {
        RequestVerb::Add
    };

    let mut integs = integ_candidates(matrix, row, fallback_verb);
    let mut jit_branch = false;

    // Prefer real inter-branch integrations over just-in-time branch
    // actions; JIT only fills in when nothing else supplies the file.
    if integs.is_empty() && !exists_on_branch {
        if let Some(jitfp_index) = matrix.jitfp_index() {
            if row.cell(jitfp_index).map(|c| c.exists()).unwrap_or(false) {
                jit_branch = true;
                integs.push(IntegDecision {
                    source_column: jitfp_index,
                    integ_flags: "-b".to_string(),
                    resolve_flags: "-at".to_string(),
                    fallback: Some(RequestVerb::Add),
                });
            }
        }
    }

    Decided {
        integs,
        verb: Some(fallback_verb),
        jit_branch,
    }
}

/// Integration sources: parent columns on other branches whose depot
/// state holds the file. Duplicate integrations from multiple revisions
/// of the same source file are suppressed, keeping only the highest
/// revision.
fn integ_candidates(matrix: &Matrix, row: &Row, fallback_verb: RequestVerb) -> Vec<IntegDecision> {
    let dest_branch_id = matrix.columns[matrix.gdest_index()].branch_id.clone();
    let mut best_by_source: Vec<(String, u64, usize)> = Vec::new();
    for parent_index in matrix.parent_indexes() {
        let column = &matrix.columns[parent_index];
        if column.branch_id == dest_branch_id {
            continue;
        }
        let cell = match row.cell(parent_index) {
            Some(cell) if cell.exists() => cell,
            _ => continue,
        };
        let source_path = match &cell.depot_path {
            Some(source_path) => source_path.clone(),
            None => continue,
        };
        let rev = cell.depot_rev.unwrap_or(1);
        match best_by_source
            .iter_mut()
            .find(|(existing_path, _, _)| existing_path == &source_path)
        {
            Some(existing) => {
                if rev > existing.1 {
                    existing.1 = rev;
                    existing.2 = parent_index;
                }
            }
            None => best_by_source.push((source_path, rev, parent_index)),
        }
    }
    best_by_source
        .into_iter()
        .map(|(_, _, source_column)| IntegDecision {
            source_column,
            integ_flags: "-i".to_string(),
            resolve_flags: "-af".to_string(),
            fallback: Some(fallback_verb),
        })
        .collect()
}

/// Decide the ghost plan for a whole matrix: what must be submitted first
/// so the branch's depot state mimics the parent commit's tree.
pub fn ghost_decide(matrix: &Matrix) -> GhostPlan {
    let mut plan = GhostPlan::default();
    let parent_index = match matrix.parent_indexes().first().copied() {
        Some(parent_index) => parent_index,
        None => return plan,
    };
    // A parent already on this branch means the branch state is exactly
    // the parent state; nothing to rearrange.
    let dest_branch_id = &matrix.columns[matrix.gdest_index()].branch_id;
    if matrix.columns[parent_index].branch_id == *dest_branch_id
        && matrix.imply_index().is_none()
    {
        return plan;
    }

    for row in matrix.rows.values() {
        let parent_has = row
            .cell(parent_index)
            .map(|cell| cell.blob_sha1.is_some())
            .unwrap_or(false);
        let branch_has = matrix
            .imply_index()
            .and_then(|imply_index| row.cell(imply_index))
            .map(|cell| cell.exists())
            .unwrap_or(false);

        if parent_has && !branch_has {
            let kind = if matrix
                .jitfp_index()
                .and_then(|jitfp_index| row.cell(jitfp_index))
                .map(|cell| cell.exists())
                .unwrap_or(false)
            {
                let basis_depot_path = matrix
                    .jitfp_index()
                    .and_then(|jitfp_index| row.cell(jitfp_index))
                    .and_then(|cell| cell.depot_path.clone())
                    .unwrap_or_default();
                GhostActionKind::BranchFromBasis { basis_depot_path }
            } else if row
                .cell(parent_index)
                .map(|cell| cell.depot_path.is_some())
                .unwrap_or(false)
            {
                GhostActionKind::PopulateFrom {
                    source_column: parent_index,
                }
            } else {
                continue;
            };
            plan.phase_one.push(GhostAction {
                gwt_path: row.gwt_path.clone(),
                kind,
            });
            // A file branched in solely so the real commit can delete it
            // gets its delete in a second ghost changelist instead.
            if row.git_delta == Some(DeltaKind::Delete) {
                plan.phase_two.push(GhostAction {
                    gwt_path: row.gwt_path.clone(),
                    kind: GhostActionKind::Delete,
                });
            }
        } else if !parent_has && branch_has {
            plan.phase_one.push(GhostAction {
                gwt_path: row.gwt_path.clone(),
                kind: GhostActionKind::Delete,
            });
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::git::GitFileMode;

    use super::super::matrix::{Cell, Column, ColumnKind};
    use super::*;

    fn sha(byte: &str) -> crate::git::Sha1 {
        byte.repeat(20).parse().unwrap()
    }

    fn column(kind: ColumnKind, branch_id: Option<&str>) -> Column {
        Column {
            kind,
            branch_id: branch_id.map(str::to_string),
            change_num: Some(10),
            sha1: None,
        }
    }

    fn git_cell(hex: &str) -> Option<Cell> {
        Some(Cell {
            mode: Some(GitFileMode::Blob),
            blob_sha1: Some(sha(hex)),
            ..Default::default()
        })
    }

    fn depot_cell(depot_path: &str, rev: u64) -> Option<Cell> {
        Some(Cell {
            depot_path: Some(depot_path.to_string()),
            depot_rev: Some(rev),
            depot_action: Some("edit".to_string()),
            depot_filetype: Some("text".to_string()),
            ..Default::default()
        })
    }

    fn row(gwt_path: &str, cells: Vec<Option<Cell>>, git_delta: Option<DeltaKind>) -> Row {
        Row {
            gwt_path: gwt_path.to_string(),
            depot_path: format!("//depot/main/{gwt_path}"),
            cells,
            git_delta,
        }
    }

    fn matrix(columns: Vec<Column>, rows: Vec<Row>) -> Matrix {
        Matrix {
            columns,
            rows: rows
                .into_iter()
                .map(|row| (row.gwt_path.clone(), row))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_plain_add_on_existing_branch() {
        // GDEST + P4IMPLY; new file, nothing to integrate.
        let m = matrix(
            vec![
                column(ColumnKind::GDest, Some("master")),
                column(ColumnKind::P4Imply, Some("master")),
            ],
            vec![row("new.txt", vec![git_cell("aa"), None], Some(DeltaKind::Add))],
        );
        let decided = decide(&m, &m.rows["new.txt"]);
        assert_eq!(decided.verb, Some(RequestVerb::Add));
        assert!(decided.integs.is_empty());
        assert!(!decided.jit_branch);
    }

    #[test]
    fn test_edit_when_file_on_branch() {
        let m = matrix(
            vec![
                column(ColumnKind::GDest, Some("master")),
                column(ColumnKind::P4Imply, Some("master")),
            ],
            vec![row(
                "f.txt",
                vec![git_cell("aa"), depot_cell("//depot/main/f.txt", 2)],
                Some(DeltaKind::Modify),
            )],
        );
        let decided = decide(&m, &m.rows["f.txt"]);
        assert_eq!(decided.verb, Some(RequestVerb::Edit));
    }

    #[test]
    fn test_delete_missing_file_is_noop() {
        let m = matrix(
            vec![
                column(ColumnKind::GDest, Some("master")),
                column(ColumnKind::P4Imply, Some("master")),
            ],
            vec![row("gone.txt", vec![None, None], Some(DeltaKind::Delete))],
        );
        let decided = decide(&m, &m.rows["gone.txt"]);
        assert!(decided.is_noop());
    }

    #[test]
    fn test_integ_preferred_over_jit() {
        // Parent on another branch has the file, and the basis also has
        // it; the real integration wins.
        let m = matrix(
            vec![
                column(ColumnKind::GDest, Some("feature")),
                column(ColumnKind::P4JitFp, None),
                column(ColumnKind::P4Imply, Some("feature")),
                column(ColumnKind::GParN { nth: 0 }, Some("master")),
            ],
            vec![row(
                "f.txt",
                vec![
                    git_cell("aa"),
                    depot_cell("//depot/main/f.txt", 3),
                    None,
                    {
                        let mut cell = depot_cell("//depot/main/f.txt", 3).unwrap();
                        cell.blob_sha1 = Some(sha("aa"));
                        cell.mode = Some(GitFileMode::Blob);
                        Some(cell)
                    },
                ],
                Some(DeltaKind::Add),
            )],
        );
        let decided = decide(&m, &m.rows["f.txt"]);
        assert_eq!(decided.integs.len(), 1);
        assert_eq!(decided.integs[0].source_column, 3);
        assert_eq!(decided.integs[0].fallback, Some(RequestVerb::Add));
        assert!(!decided.jit_branch);
    }

    #[test]
    fn test_jit_branch_from_basis() {
        let m = matrix(
            vec![
                column(ColumnKind::GDest, Some("feature")),
                column(ColumnKind::P4JitFp, None),
                column(ColumnKind::P4Imply, Some("feature")),
            ],
            vec![row(
                "f.txt",
                vec![
                    git_cell("aa"),
                    depot_cell("//depot/main/f.txt", 3),
                    None,
                ],
                Some(DeltaKind::Modify),
            )],
        );
        let decided = decide(&m, &m.rows["f.txt"]);
        assert!(decided.jit_branch);
        assert_eq!(decided.integs[0].integ_flags, "-b");
        // Not on branch, so the content request is an add.
        assert_eq!(decided.verb, Some(RequestVerb::Add));
    }

    #[test]
    fn test_duplicate_integ_suppressed_keeps_highest_rev() {
        let m = matrix(
            vec![
                column(ColumnKind::GDest, Some("dest")),
                column(ColumnKind::GParN { nth: 0 }, Some("src-a")),
                column(ColumnKind::GParN { nth: 1 }, Some("src-b")),
            ],
            vec![row(
                "f.txt",
                vec![
                    git_cell("aa"),
                    depot_cell("//depot/shared/f.txt", 2),
                    depot_cell("//depot/shared/f.txt", 5),
                ],
                Some(DeltaKind::Add),
            )],
        );
        let decided = decide(&m, &m.rows["f.txt"]);
        assert_eq!(decided.integs.len(), 1);
        assert_eq!(decided.integs[0].source_column, 2);
    }

    #[test]
    fn test_no_delete_fallback_anywhere() {
        let m = matrix(
            vec![
                column(ColumnKind::GDest, Some("dest")),
                column(ColumnKind::GParN { nth: 0 }, Some("src")),
            ],
            vec![row(
                "f.txt",
                vec![git_cell("aa"), depot_cell("//depot/src/f.txt", 1)],
                Some(DeltaKind::Add),
            )],
        );
        let decided = decide(&m, &m.rows["f.txt"]);
        for integ in &decided.integs {
            assert_ne!(integ.fallback, Some(RequestVerb::Delete));
        }
    }

    #[test]
    fn test_ghost_add_then_delete_for_absent_delete() {
        // Lightweight branch: commit deletes `a` (absent from the branch,
        // present in the basis) and the ghost plan supplies add + delete.
        let mut a_parent_cell = git_cell("aa").unwrap();
        a_parent_cell.depot_path = None;
        let m = matrix(
            vec![
                column(ColumnKind::GDest, Some("task")),
                column(ColumnKind::P4JitFp, None),
                column(ColumnKind::P4Imply, Some("task")),
                column(ColumnKind::GParN { nth: 0 }, Some("master")),
            ],
            vec![
                row(
                    "a",
                    vec![
                        None,
                        depot_cell("//depot/main/a", 1),
                        None,
                        Some(a_parent_cell),
                    ],
                    Some(DeltaKind::Delete),
                ),
                row(
                    "b",
                    vec![git_cell("bb"), None, None, None],
                    Some(DeltaKind::Add),
                ),
            ],
        );
        let plan = ghost_decide(&m);
        assert_eq!(plan.phase_one.len(), 1);
        assert!(matches!(
            plan.phase_one[0].kind,
            GhostActionKind::BranchFromBasis { .. }
        ));
        assert_eq!(plan.phase_two.len(), 1);
        assert_eq!(plan.phase_two[0].kind, GhostActionKind::Delete);
        assert_eq!(plan.phase_two[0].gwt_path, "a");
    }

    #[test]
    fn test_ghost_delete_of_extra_branch_file() {
        // The branch holds a file the parent tree lacks: ghost deletes it.
        let m = matrix(
            vec![
                column(ColumnKind::GDest, Some("task")),
                column(ColumnKind::P4Imply, Some("task")),
                column(ColumnKind::GParN { nth: 0 }, Some("master")),
            ],
            vec![row(
                "stale.txt",
                vec![None, depot_cell("//depot/task/stale.txt", 1), None],
                None,
            )],
        );
        let plan = ghost_decide(&m);
        assert_eq!(plan.phase_one.len(), 1);
        assert_eq!(plan.phase_one[0].kind, GhostActionKind::Delete);
    }

    #[test]
    fn test_no_ghost_when_parent_on_branch() {
        let m = matrix(
            vec![
                column(ColumnKind::GDest, Some("master")),
                column(ColumnKind::GParN { nth: 0 }, Some("master")),
            ],
            vec![row(
                "f.txt",
                vec![git_cell("aa"), git_cell("aa")],
                Some(DeltaKind::Modify),
            )],
        );
        assert!(ghost_decide(&m).is_empty());
    }
}
