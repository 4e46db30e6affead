//! The repo configuration file format.
//!
//! A section-and-key text file stored in the depot at a fixed path derived
//! from the repo name. The `[@repo]` section holds per-repo settings,
//! `[@features]` holds feature toggles, and every other section defines a
//! branch. A second file under a parallel path (`p4gf_config2`) holds
//! lightweight-branch sections and stream original-view data; its sections
//! merge into the same structure.

use indexmap::IndexMap;
use thiserror::Error;

#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("config line {line_num}: expected `key = value`, got {line:?}")]
    MalformedLine { line_num: usize, line: String },

    #[error("config line {line_num}: continuation with no preceding key")]
    DanglingContinuation { line_num: usize },

    #[error("config line {line_num}: unterminated section header {line:?}")]
    MalformedSection { line_num: usize, line: String },

    #[error("branch section {section:?} must define either `view` or `stream`")]
    BranchWithoutView { section: String },

    #[error("key {key:?} has invalid boolean value {value:?}")]
    BadBool { key: String, value: String },
}

/// Result type for config parsing.
pub type Result<T> = std::result::Result<T, Error>;

/// Section name for per-repo settings.
pub const REPO_SECTION: &str = "@repo";

/// Section name for feature toggles.
pub const FEATURES_SECTION: &str = "@features";

/// Who ends up owning Fusion-submitted changelists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChangeOwner {
    /// The Git author (the default).
    #[default]
    Author,

    /// The authenticated pusher.
    Pusher,
}

/// Per-repo settings from the `[@repo]` section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoSettings {
    /// Whether pushes may create new branches.
    pub enable_branch_creation: bool,

    /// Whether merge commits are accepted.
    pub enable_merge_commits: bool,

    /// Whether submodules/gitlinks are accepted.
    pub enable_submodules: bool,

    /// Who owns submitted changelists.
    pub change_owner: ChangeOwner,

    /// Check only the pusher's permissions, not the author's.
    pub ignore_author_perms: bool,

    /// Character set used for depot file content conversion.
    pub charset: Option<String>,

    /// Permit branch views whose right-hand sides differ from the
    /// more-equal branch's.
    pub enable_mismatched_rhs: bool,

    /// SSH URL template advertised to users.
    pub ssh_url: Option<String>,

    /// HTTP URL template advertised to users.
    pub http_url: Option<String>,
}

impl Default for RepoSettings {
    fn default() -> Self {
        RepoSettings {
            enable_branch_creation: true,
            enable_merge_commits: true,
            enable_submodules: true,
            change_owner: ChangeOwner::Author,
            ignore_author_perms: false,
            charset: None,
            enable_mismatched_rhs: false,
            ssh_url: None,
            http_url: None,
        }
    }
}

/// One branch-defining section.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BranchSection {
    /// Git ref short name; `None` for anonymous branches.
    pub git_branch_name: Option<String>,

    /// View mapping lines, when the branch is defined by an explicit view.
    pub view: Option<Vec<String>>,

    /// Stream name, when the branch is bound to a stream.
    pub stream: Option<String>,

    /// Snapshot of the stream's view when the branch was created.
    pub original_view: Option<Vec<String>>,

    /// Storage region identifier for lightweight branches.
    pub depot_branch_id: Option<String>,

    /// Latched when Git deletes the branch.
    pub deleted: bool,
}

/// The parsed repo configuration: `p4gf_config` merged with `p4gf_config2`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepoConfig {
    /// Per-repo settings.
    pub repo: RepoSettings,

    /// Feature toggles by name.
    pub features: IndexMap<String, bool>,

    /// Branch sections, in file order. File order matters: the first
    /// branch section is the repo's default ("more equal") branch.
    pub branches: IndexMap<String, BranchSection>,
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(Error::BadBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Raw section/key parse, before interpretation. Multi-line values are
/// written as indented continuation lines under their key.
fn parse_sections(text: &str) -> Result<IndexMap<String, IndexMap<String, String>>> {
    let mut sections: IndexMap<String, IndexMap<String, String>> = IndexMap::new();
    let mut current_section: Option<String> = None;
    let mut current_key: Option<String> = None;

    for (line_num, raw_line) in text.lines().enumerate() {
        let line_num = line_num + 1;
        let trimmed = raw_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            current_key = None;
            continue;
        }
        if trimmed.starts_with('[') {
            let name = trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .ok_or_else(|| Error::MalformedSection {
                    line_num,
                    line: raw_line.to_string(),
                })?;
            sections.entry(name.to_string()).or_default();
            current_section = Some(name.to_string());
            current_key = None;
            continue;
        }
        let is_continuation = raw_line.starts_with(' ') || raw_line.starts_with('\t');
        if is_continuation {
            let section = current_section
                .as_ref()
                .ok_or(Error::DanglingContinuation { line_num })?;
            let key = current_key
                .as_ref()
                .ok_or(Error::DanglingContinuation { line_num })?;
            let entry = sections
                .get_mut(section)
                .and_then(|keys| keys.get_mut(key))
                .ok_or(Error::DanglingContinuation { line_num })?;
            entry.push('\n');
            entry.push_str(trimmed);
            continue;
        }
        let (key, value) = trimmed.split_once('=').ok_or_else(|| Error::MalformedLine {
            line_num,
            line: raw_line.to_string(),
        })?;
        let section = current_section.clone().ok_or_else(|| Error::MalformedLine {
            line_num,
            line: raw_line.to_string(),
        })?;
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        sections
            .entry(section)
            .or_default()
            .insert(key.clone(), value);
        current_key = Some(key);
    }
    Ok(sections)
}

fn value_to_lines(value: &str) -> Vec<String> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl RepoConfig {
    /// Parse the primary config file.
    pub fn parse(text: &str) -> Result<Self> {
        let sections = parse_sections(text)?;
        let mut config = RepoConfig::default();
        for (section, keys) in sections {
            match section.as_str() {
                REPO_SECTION => {
                    for (key, value) in &keys {
                        config.apply_repo_key(key, value)?;
                    }
                }
                FEATURES_SECTION => {
                    for (key, value) in &keys {
                        config.features.insert(key.clone(), parse_bool(key, value)?);
                    }
                }
                _ => {
                    let branch = Self::branch_from_keys(&section, &keys)?;
                    config.branches.insert(section, branch);
                }
            }
        }
        Ok(config)
    }

    /// Merge the second config file (`p4gf_config2`): its branch sections
    /// are added (or extend existing sections with `original-view` and
    /// `depot-branch-id` data).
    pub fn merge_config2(&mut self, text: &str) -> Result<()> {
        let sections = parse_sections(text)?;
        for (section, keys) in sections {
            if section == REPO_SECTION || section == FEATURES_SECTION {
                continue;
            }
            match self.branches.get_mut(&section) {
                Some(existing) => {
                    if let Some(original_view) = keys.get("original-view") {
                        existing.original_view = Some(value_to_lines(original_view));
                    }
                    if let Some(depot_branch_id) = keys.get("depot-branch-id") {
                        existing.depot_branch_id = Some(depot_branch_id.clone());
                    }
                }
                None => {
                    let branch = Self::branch_from_keys(&section, &keys)?;
                    self.branches.insert(section, branch);
                }
            }
        }
        Ok(())
    }

    fn apply_repo_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "enable-branch-creation" => {
                self.repo.enable_branch_creation = parse_bool(key, value)?
            }
            "enable-merge-commits" => self.repo.enable_merge_commits = parse_bool(key, value)?,
            "enable-submodules" => self.repo.enable_submodules = parse_bool(key, value)?,
            "ignore-author-perms" => self.repo.ignore_author_perms = parse_bool(key, value)?,
            "enable-mismatched-rhs" => {
                self.repo.enable_mismatched_rhs = parse_bool(key, value)?
            }
            "change-owner" => {
                self.repo.change_owner = match value {
                    "pusher" => ChangeOwner::Pusher,
                    _ => ChangeOwner::Author,
                }
            }
            "charset" => self.repo.charset = Some(value.to_string()),
            "ssh-url" => self.repo.ssh_url = Some(value.to_string()),
            "http-url" => self.repo.http_url = Some(value.to_string()),
            // Unknown keys are carried by older/newer servers; ignore.
            _ => {}
        }
        Ok(())
    }

    fn branch_from_keys(
        section: &str,
        keys: &IndexMap<String, String>,
    ) -> Result<BranchSection> {
        let branch = BranchSection {
            git_branch_name: keys.get("git-branch-name").cloned(),
            view: keys.get("view").map(|value| value_to_lines(value)),
            stream: keys.get("stream").cloned(),
            original_view: keys.get("original-view").map(|value| value_to_lines(value)),
            depot_branch_id: keys.get("depot-branch-id").cloned(),
            deleted: keys
                .get("deleted")
                .map(|value| parse_bool("deleted", value))
                .transpose()?
                .unwrap_or(false),
        };
        if branch.view.is_none() && branch.stream.is_none() {
            return Err(Error::BranchWithoutView {
                section: section.to_string(),
            });
        }
        Ok(branch)
    }

    /// Render the primary config file.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("[{REPO_SECTION}]\n"));
        let repo = &self.repo;
        let bool_str = |b: bool| if b { "yes" } else { "no" };
        out.push_str(&format!(
            "enable-branch-creation = {}\n",
            bool_str(repo.enable_branch_creation)
        ));
        out.push_str(&format!(
            "enable-merge-commits = {}\n",
            bool_str(repo.enable_merge_commits)
        ));
        out.push_str(&format!(
            "enable-submodules = {}\n",
            bool_str(repo.enable_submodules)
        ));
        out.push_str(&format!(
            "change-owner = {}\n",
            match repo.change_owner {
                ChangeOwner::Author => "author",
                ChangeOwner::Pusher => "pusher",
            }
        ));
        if repo.ignore_author_perms {
            out.push_str("ignore-author-perms = yes\n");
        }
        if repo.enable_mismatched_rhs {
            out.push_str("enable-mismatched-rhs = yes\n");
        }
        if let Some(charset) = &repo.charset {
            out.push_str(&format!("charset = {charset}\n"));
        }
        if let Some(ssh_url) = &repo.ssh_url {
            out.push_str(&format!("ssh-url = {ssh_url}\n"));
        }
        if let Some(http_url) = &repo.http_url {
            out.push_str(&format!("http-url = {http_url}\n"));
        }
        if !self.features.is_empty() {
            out.push_str(&format!("\n[{FEATURES_SECTION}]\n"));
            for (feature, enabled) in &self.features {
                out.push_str(&format!("{feature} = {}\n", bool_str(*enabled)));
            }
        }
        for (section, branch) in &self.branches {
            out.push_str(&format!("\n[{section}]\n"));
            if let Some(git_branch_name) = &branch.git_branch_name {
                out.push_str(&format!("git-branch-name = {git_branch_name}\n"));
            }
            if let Some(view) = &branch.view {
                out.push_str("view = ");
                for (i, line) in view.iter().enumerate() {
                    if i == 0 {
                        out.push_str(line);
                    } else {
                        out.push_str(&format!("\n\t{line}"));
                    }
                }
                out.push('\n');
            }
            if let Some(stream) = &branch.stream {
                out.push_str(&format!("stream = {stream}\n"));
            }
            if let Some(original_view) = &branch.original_view {
                out.push_str("original-view = ");
                for (i, line) in original_view.iter().enumerate() {
                    if i == 0 {
                        out.push_str(line);
                    } else {
                        out.push_str(&format!("\n\t{line}"));
                    }
                }
                out.push('\n');
            }
            if let Some(depot_branch_id) = &branch.depot_branch_id {
                out.push_str(&format!("depot-branch-id = {depot_branch_id}\n"));
            }
            if branch.deleted {
                out.push_str("deleted = yes\n");
            }
        }
        out
    }
}

/// Validate a pushed replacement of the repo config against the current
/// one. A change that would break existing history is rejected: removing a
/// branch section outright (deletion must latch the `deleted` key), or
/// rewriting an existing branch's view lines.
pub fn validate_update(
    current: &RepoConfig,
    proposed: &RepoConfig,
) -> super::error::Result<()> {
    use super::error::CoreError;

    for (branch_id, current_section) in &current.branches {
        let proposed_section = match proposed.branches.get(branch_id) {
            Some(proposed_section) => proposed_section,
            None => {
                return Err(CoreError::ConfigInvalid {
                    reason: format!(
                        "branch section [{branch_id}] was removed; \
                         set `deleted = yes` instead"
                    ),
                })
            }
        };
        if current_section.deleted {
            continue;
        }
        if proposed_section.view != current_section.view
            || proposed_section.stream != current_section.stream
        {
            return Err(CoreError::ConfigInvalid {
                reason: format!(
                    "branch section [{branch_id}] changes its view; \
                     existing changelists would no longer be addressable"
                ),
            });
        }
    }
    Ok(())
}

/// Depot path of the primary config file for a repo.
pub fn config_depot_path(depot: &str, repo: &str) -> String {
    format!("//{depot}/repos/{repo}/p4gf_config")
}

/// Depot path of the secondary (lightweight-branch) config file.
pub fn config2_depot_path(depot: &str, repo: &str) -> String {
    format!("//{depot}/repos/{repo}/p4gf_config2")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[@repo]
enable-branch-creation = yes
enable-merge-commits = no
change-owner = pusher

[@features]
imports = yes

[master-branch]
git-branch-name = master
view = //depot/main/... ...
\t-//depot/main/secret/... secret/...

[task-branch]
git-branch-name = task/one
stream = //streams/task1
";

    #[test]
    fn test_parse() {
        let config = RepoConfig::parse(SAMPLE).unwrap();
        assert!(config.repo.enable_branch_creation);
        assert!(!config.repo.enable_merge_commits);
        assert_eq!(config.repo.change_owner, ChangeOwner::Pusher);
        assert_eq!(config.features.get("imports"), Some(&true));

        let master = &config.branches["master-branch"];
        assert_eq!(master.git_branch_name.as_deref(), Some("master"));
        assert_eq!(
            master.view.as_deref().unwrap(),
            &[
                "//depot/main/... ...".to_string(),
                "-//depot/main/secret/... secret/...".to_string(),
            ]
        );

        let task = &config.branches["task-branch"];
        assert_eq!(task.stream.as_deref(), Some("//streams/task1"));

        // First section in file order is the more-equal branch.
        assert_eq!(config.branches.get_index(0).unwrap().0, "master-branch");
    }

    #[test]
    fn test_round_trip() {
        let config = RepoConfig::parse(SAMPLE).unwrap();
        let reparsed = RepoConfig::parse(&config.render()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_merge_config2() {
        let mut config = RepoConfig::parse(SAMPLE).unwrap();
        config
            .merge_config2(
                "\
[anon-0001]
view = //depot-branches/anon-0001/... ...
depot-branch-id = anon-0001

[master-branch]
depot-branch-id = master-dbi
",
            )
            .unwrap();
        assert_eq!(
            config.branches["anon-0001"].depot_branch_id.as_deref(),
            Some("anon-0001")
        );
        assert_eq!(
            config.branches["master-branch"].depot_branch_id.as_deref(),
            Some("master-dbi")
        );
    }

    #[test]
    fn test_branch_requires_view_or_stream() {
        let err = RepoConfig::parse("[broken]\ngit-branch-name = b\n").unwrap_err();
        assert_eq!(
            err,
            Error::BranchWithoutView {
                section: "broken".to_string()
            }
        );
    }

    #[test]
    fn test_validate_update() {
        let current = RepoConfig::parse(SAMPLE).unwrap();

        // Adding a branch is fine.
        let mut added = current.clone();
        added.branches.insert(
            "new-branch".to_string(),
            BranchSection {
                git_branch_name: Some("new".to_string()),
                view: Some(vec!["//depot/new/... ...".to_string()]),
                ..Default::default()
            },
        );
        validate_update(&current, &added).unwrap();

        // Removing a section is rejected.
        let mut removed = current.clone();
        removed.branches.shift_remove("task-branch");
        assert!(validate_update(&current, &removed).is_err());

        // Rewriting an existing view is rejected.
        let mut rewritten = current.clone();
        rewritten.branches["master-branch"].view =
            Some(vec!["//depot/elsewhere/... ...".to_string()]);
        assert!(validate_update(&current, &rewritten).is_err());
    }

    #[test]
    fn test_config_paths() {
        assert_eq!(
            config_depot_path(".git-fusion", "repoA"),
            "//.git-fusion/repos/repoA/p4gf_config"
        );
        assert_eq!(
            config2_depot_path(".git-fusion", "repoA"),
            "//.git-fusion/repos/repoA/p4gf_config2"
        );
    }
}
