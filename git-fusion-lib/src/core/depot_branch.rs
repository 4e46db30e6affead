//! Depot-branch-info records: the storage regions that hold lightweight
//! branches' unique files, and the parent graph between them.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use thiserror::Error;
use tracing::instrument;

use crate::depot::{Connection, DepotResult, PrintSink};

#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("branch-info record missing key {key:?}")]
    MissingKey { key: &'static str },

    #[error("branch-info record has {parents} parents but {changes} parent changelists")]
    ParentArity { parents: usize, changes: usize },

    #[error("depot branch parent graph has a cycle through {depot_branch_id:?}")]
    ParentCycle { depot_branch_id: String },
}

/// Result type for depot-branch-info operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The "branched from" point in one parent: a real changelist number, or a
/// provisional mark that exists only while a push is in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParentChange {
    /// A submitted changelist number.
    Num(u64),

    /// A fast-import-style mark, replaced by a real number before the push
    /// completes.
    Provisional(String),
}

impl std::fmt::Display for ParentChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParentChange::Num(num) => write!(f, "{num}"),
            ParentChange::Provisional(mark) => write!(f, ":{mark}"),
        }
    }
}

impl ParentChange {
    fn parse(text: &str) -> Self {
        match text.strip_prefix(':') {
            Some(mark) => ParentChange::Provisional(mark.to_string()),
            None => match text.parse() {
                Ok(num) => ParentChange::Num(num),
                Err(_) => ParentChange::Provisional(text.to_string()),
            },
        }
    }

    /// The real changelist number, or `None` while provisional.
    pub fn change_num(&self) -> Option<u64> {
        match self {
            ParentChange::Num(num) => Some(*num),
            ParentChange::Provisional(_) => None,
        }
    }
}

/// A record of one storage region dedicated to a lightweight branch's
/// unique files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepotBranchInfo {
    /// Stable identifier, unique across the depot.
    pub depot_branch_id: String,

    /// Root depot path of the region, without a trailing `/...`.
    pub root_depot_path: String,

    /// Parent storage regions this branch diverged from.
    pub parent_ids: Vec<String>,

    /// The changelist at which this branch diverged from each parent.
    /// Always the same length as `parent_ids`.
    pub parent_changes: Vec<ParentChange>,
}

impl DepotBranchInfo {
    /// Construct a record with no parents yet.
    pub fn new(depot_branch_id: &str, root_depot_path: &str) -> Self {
        DepotBranchInfo {
            depot_branch_id: depot_branch_id.to_string(),
            root_depot_path: root_depot_path.trim_end_matches('/').to_string(),
            parent_ids: Vec::new(),
            parent_changes: Vec::new(),
        }
    }

    /// Append one parent and its branched-from point.
    pub fn push_parent(&mut self, parent_id: &str, change: ParentChange) {
        self.parent_ids.push(parent_id.to_string());
        self.parent_changes.push(change);
    }

    /// Whether any parent change is still a provisional mark.
    pub fn has_provisional_parent(&self) -> bool {
        self.parent_changes
            .iter()
            .any(|change| change.change_num().is_none())
    }

    /// Replace a provisional mark with its real changelist number.
    pub fn resolve_provisional(&mut self, mark: &str, change_num: u64) {
        for change in &mut self.parent_changes {
            if let ParentChange::Provisional(have) = change {
                if have == mark {
                    *change = ParentChange::Num(change_num);
                }
            }
        }
    }

    /// Whether `depot_path` lies inside this region.
    pub fn contains_depot_path(&self, depot_path: &str) -> bool {
        depot_path
            .strip_prefix(&self.root_depot_path)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    }

    /// Render the record file content.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("depot-branch-id: {}\n", self.depot_branch_id));
        out.push_str(&format!("root-depot-path: {}\n", self.root_depot_path));
        for (parent_id, change) in self.parent_ids.iter().zip(&self.parent_changes) {
            out.push_str(&format!("parent-branch-id: {parent_id}\n"));
            out.push_str(&format!("parent-change-num: {change}\n"));
        }
        out
    }

    /// Parse a record file.
    pub fn parse(text: &str) -> Result<Self> {
        let mut depot_branch_id = None;
        let mut root_depot_path = None;
        let mut parent_ids = Vec::new();
        let mut parent_changes = Vec::new();
        for line in text.lines() {
            let (key, value) = match line.split_once(':') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => continue,
            };
            match key {
                "depot-branch-id" => depot_branch_id = Some(value.to_string()),
                "root-depot-path" => root_depot_path = Some(value.to_string()),
                "parent-branch-id" => parent_ids.push(value.to_string()),
                "parent-change-num" => parent_changes.push(ParentChange::parse(value)),
                _ => {}
            }
        }
        let info = DepotBranchInfo {
            depot_branch_id: depot_branch_id.ok_or(Error::MissingKey {
                key: "depot-branch-id",
            })?,
            root_depot_path: root_depot_path.ok_or(Error::MissingKey {
                key: "root-depot-path",
            })?,
            parent_ids,
            parent_changes,
        };
        if info.parent_ids.len() != info.parent_changes.len() {
            return Err(Error::ParentArity {
                parents: info.parent_ids.len(),
                changes: info.parent_changes.len(),
            });
        }
        Ok(info)
    }

    /// Depot path of this record's file.
    pub fn record_depot_path(&self, depot: &str) -> String {
        branch_info_depot_path(depot, &self.depot_branch_id)
    }
}

/// Depot path of the record file for a given depot-branch id.
pub fn branch_info_depot_path(depot: &str, depot_branch_id: &str) -> String {
    format!("//{depot}/branches/branch-info/{depot_branch_id}")
}

/// Root depot path allocated to a new lightweight branch region.
pub fn new_region_root(depot: &str, depot_branch_id: &str) -> String {
    format!("//{depot}/branches/{depot_branch_id}")
}

/// All depot-branch-info records known to one repo, with parent-graph
/// queries.
#[derive(Clone, Debug, Default)]
pub struct DepotBranchIndex {
    by_id: BTreeMap<String, DepotBranchInfo>,
}

impl DepotBranchIndex {
    /// Construct an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every record file under the branch-info prefix.
    #[instrument(skip(conn))]
    pub fn load(conn: &dyn Connection, depot: &str) -> DepotResult<Self> {
        struct Collect {
            texts: Vec<String>,
        }
        impl PrintSink for Collect {
            fn file(&mut self, _depot_path: &str, _rev: u64, content: &[u8]) -> DepotResult<()> {
                self.texts.push(String::from_utf8_lossy(content).into_owned());
                Ok(())
            }
        }
        let mut sink = Collect { texts: Vec::new() };
        conn.print(
            &[format!("//{depot}/branches/branch-info/...")],
            &mut sink,
        )?;
        let mut index = Self::new();
        for text in sink.texts {
            // A malformed record is surfaced to the operator via logs; the
            // remaining records still load.
            match DepotBranchInfo::parse(&text) {
                Ok(info) => {
                    index.add(info);
                }
                Err(err) => {
                    tracing::warn!(?err, "skipping malformed branch-info record");
                }
            }
        }
        Ok(index)
    }

    /// Add (or replace) a record.
    pub fn add(&mut self, info: DepotBranchInfo) {
        self.by_id.insert(info.depot_branch_id.clone(), info);
    }

    /// Look up a record by id.
    pub fn get(&self, depot_branch_id: &str) -> Option<&DepotBranchInfo> {
        self.by_id.get(depot_branch_id)
    }

    /// Mutable lookup, for resolving provisional parent marks.
    pub fn get_mut(&mut self, depot_branch_id: &str) -> Option<&mut DepotBranchInfo> {
        self.by_id.get_mut(depot_branch_id)
    }

    /// Iterate over all records.
    pub fn iter(&self) -> impl Iterator<Item = &DepotBranchInfo> {
        self.by_id.values()
    }

    /// Find the record whose root is a prefix of `depot_path`.
    pub fn find_by_depot_path(&self, depot_path: &str) -> Option<&DepotBranchInfo> {
        self.by_id
            .values()
            .find(|info| info.contains_depot_path(depot_path))
    }

    /// The set of depot-branches housing any of the given depot paths.
    pub fn depot_branches_for_paths<'a>(
        &self,
        depot_paths: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        for path in depot_paths {
            if let Some(info) = self.find_by_depot_path(path) {
                result.insert(info.depot_branch_id.clone());
            }
        }
        result
    }

    /// Walk `child`'s parent list, breadth-first, to find the first
    /// changelist at which `ancestor_id` appears.
    ///
    /// The parent graph is required to be a DAG; a cycle is an error rather
    /// than a hang.
    pub fn ancestor_change_num(&self, child_id: &str, ancestor_id: &str) -> Result<Option<u64>> {
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut seen: HashSet<&str> = HashSet::new();
        queue.push_back(child_id);
        seen.insert(child_id);
        while let Some(current_id) = queue.pop_front() {
            let current = match self.by_id.get(current_id) {
                Some(current) => current,
                None => continue,
            };
            for (parent_id, change) in current.parent_ids.iter().zip(&current.parent_changes) {
                if parent_id == ancestor_id {
                    return Ok(change.change_num());
                }
                if !seen.insert(parent_id) {
                    if self.reaches(parent_id, current_id) {
                        return Err(Error::ParentCycle {
                            depot_branch_id: parent_id.clone(),
                        });
                    }
                    continue;
                }
                queue.push_back(parent_id);
            }
        }
        Ok(None)
    }

    fn reaches(&self, from_id: &str, to_id: &str) -> bool {
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut seen: HashSet<&str> = HashSet::new();
        queue.push_back(from_id);
        while let Some(current_id) = queue.pop_front() {
            if current_id == to_id {
                return true;
            }
            if !seen.insert(current_id) {
                continue;
            }
            if let Some(current) = self.by_id.get(current_id) {
                for parent_id in &current.parent_ids {
                    queue.push_back(parent_id);
                }
            }
        }
        false
    }

    /// The changelist at which `child_id` first diverged from the
    /// fully-populated basis: the branched-from point of its first parent
    /// chain entry that has no parents of its own (i.e. roots directly on
    /// the basis), preferring an ancestor of the branch's own root point.
    pub fn basis_change_num(&self, child_id: &str) -> Result<Option<u64>> {
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut seen: HashSet<&str> = HashSet::new();
        queue.push_back(child_id);
        seen.insert(child_id);
        while let Some(current_id) = queue.pop_front() {
            let current = match self.by_id.get(current_id) {
                Some(current) => current,
                None => continue,
            };
            if current.parent_ids.is_empty() {
                continue;
            }
            for (parent_id, change) in current.parent_ids.iter().zip(&current.parent_changes) {
                if self.by_id.get(parent_id).is_none() {
                    // Parent not housed in any lightweight region: it is
                    // the fully-populated basis itself.
                    return Ok(change.change_num());
                }
                if seen.insert(parent_id) {
                    queue.push_back(parent_id);
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, parents: &[(&str, u64)]) -> DepotBranchInfo {
        let mut result = DepotBranchInfo::new(id, &format!("//.git-fusion/branches/{id}"));
        for (parent_id, change_num) in parents {
            result.push_parent(parent_id, ParentChange::Num(*change_num));
        }
        result
    }

    #[test]
    fn test_record_round_trip() {
        let mut record = info("anon-0001", &[("anon-0000", 12)]);
        record.push_parent("other", ParentChange::Provisional("m3".to_string()));
        let parsed = DepotBranchInfo::parse(&record.render()).unwrap();
        assert_eq!(parsed, record);
        assert!(parsed.has_provisional_parent());
    }

    #[test]
    fn test_resolve_provisional() {
        let mut record = info("anon-0001", &[]);
        record.push_parent("p", ParentChange::Provisional("m3".to_string()));
        record.resolve_provisional("m3", 44);
        assert!(!record.has_provisional_parent());
        assert_eq!(record.parent_changes, vec![ParentChange::Num(44)]);
    }

    #[test]
    fn test_contains_depot_path() {
        let record = info("anon-0001", &[]);
        assert!(record.contains_depot_path("//.git-fusion/branches/anon-0001/a/b.txt"));
        assert!(!record.contains_depot_path("//.git-fusion/branches/anon-00012/a.txt"));
    }

    #[test]
    fn test_ancestor_change_num() {
        let mut index = DepotBranchIndex::new();
        index.add(info("child", &[("mid", 30)]));
        index.add(info("mid", &[("root", 20)]));
        index.add(info("root", &[]));
        assert_eq!(
            index.ancestor_change_num("child", "mid").unwrap(),
            Some(30)
        );
        assert_eq!(
            index.ancestor_change_num("child", "root").unwrap(),
            Some(20)
        );
        assert_eq!(index.ancestor_change_num("child", "absent").unwrap(), None);
    }

    #[test]
    fn test_basis_change_num_prefers_basis_parent() {
        let mut index = DepotBranchIndex::new();
        // "fp" is not in the index: it is the fully-populated basis.
        index.add(info("child", &[("mid", 30)]));
        index.add(info("mid", &[("fp", 20)]));
        assert_eq!(index.basis_change_num("child").unwrap(), Some(20));
        assert_eq!(index.basis_change_num("mid").unwrap(), Some(20));
    }

    #[test]
    fn test_cycle_detection() {
        let mut index = DepotBranchIndex::new();
        index.add(info("a", &[("b", 1)]));
        index.add(info("b", &[("a", 2)]));
        assert!(index.ancestor_change_num("a", "missing").is_err());
    }

    #[test]
    fn test_find_by_depot_path() {
        let mut index = DepotBranchIndex::new();
        index.add(info("anon-0001", &[]));
        index.add(info("anon-0002", &[]));
        let found = index
            .find_by_depot_path("//.git-fusion/branches/anon-0002/x.txt")
            .unwrap();
        assert_eq!(found.depot_branch_id, "anon-0002");
        let set = index.depot_branches_for_paths(vec![
            "//.git-fusion/branches/anon-0001/a",
            "//.git-fusion/branches/anon-0002/b",
            "//depot/main/unrelated",
        ]);
        assert_eq!(set.len(), 2);
    }
}
