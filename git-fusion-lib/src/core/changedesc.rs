//! Codec for the machine-readable block appended to every Fusion-written
//! changelist description.
//!
//! The human-readable prefix is the Git commit message; the block after the
//! marker line records the commit↔changelist association and enough
//! parentage to rebuild commits without rescanning Git history.

use std::fmt::Write;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

use crate::git::Sha1;

/// Marker line separating the commit message from the metadata block.
pub const BLOCK_MARKER: &str = "Imported from Git";

/// Push-state values recorded in the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushState {
    /// The changelist is the last of its push.
    Complete,

    /// More changelists from the same push follow.
    Incomplete,
}

impl std::fmt::Display for PushState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushState::Complete => write!(f, "complete"),
            PushState::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// Ghost-specific keys, present only on preparatory changelists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GhostInfo {
    /// Sha of the commit whose parent state this ghost reproduces.
    pub of_sha1: Option<Sha1>,

    /// Changelist holding that state on the source branch.
    pub of_change_num: Option<u64>,

    /// Sha of the real commit that follows this ghost.
    pub precedes_sha1: Option<Sha1>,
}

impl GhostInfo {
    /// Whether any ghost key is set.
    pub fn is_ghost(&self) -> bool {
        self.of_sha1.is_some() || self.precedes_sha1.is_some()
    }
}

/// The parsed (or to-be-rendered) description of one Fusion-written
/// changelist.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeDesc {
    /// The human-readable prefix: the Git commit message.
    pub message: String,

    /// The mirrored commit's ID.
    pub sha1: Option<Sha1>,

    /// Parent commit IDs, first parent first.
    pub parents: Vec<Sha1>,

    /// `name <email> epoch` of the Git author.
    pub author: Option<String>,

    /// `name <email> epoch` of the Git committer.
    pub committer: Option<String>,

    /// Service account of the pushing instance.
    pub pusher: Option<String>,

    /// Whether this changelist completes its push.
    pub push_state: Option<PushState>,

    /// Storage region of the branch this changelist landed on.
    pub depot_branch_id: Option<String>,

    /// `<depot-branch-id>@<change>` of the parent branch, when the first
    /// changelist of a branch diverges from another branch.
    pub parent_branch: Option<(String, u64)>,

    /// Submodule (gitlink) entries: `(commit sha, repo-relative path)`.
    pub gitlinks: Vec<(Sha1, String)>,

    /// Ghost keys.
    pub ghost: GhostInfo,
}

impl ChangeDesc {
    /// Render the description: message, blank line, marker, then one
    /// space-indented `key: value` line per present key.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let message = self.message.trim_end();
        if !message.is_empty() {
            out.push_str(message);
            out.push_str("\n\n");
        }
        out.push_str(BLOCK_MARKER);
        out.push('\n');
        if let Some(author) = &self.author {
            writeln!(out, " author: {author}").expect("writing description");
        }
        if let Some(committer) = &self.committer {
            writeln!(out, " committer: {committer}").expect("writing description");
        }
        if let Some(pusher) = &self.pusher {
            writeln!(out, " pusher: {pusher}").expect("writing description");
        }
        if let Some(sha1) = &self.sha1 {
            writeln!(out, " sha1: {sha1}").expect("writing description");
        }
        if let Some(push_state) = &self.push_state {
            writeln!(out, " push-state: {push_state}").expect("writing description");
        }
        if !self.parents.is_empty() {
            let parents = self
                .parents
                .iter()
                .map(Sha1::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(out, " parents: {parents}").expect("writing description");
        }
        if let Some(depot_branch_id) = &self.depot_branch_id {
            writeln!(out, " depot-branch-id: {depot_branch_id}").expect("writing description");
        }
        if let Some((parent_id, change_num)) = &self.parent_branch {
            writeln!(out, " parent-branch: {parent_id}@{change_num}")
                .expect("writing description");
        }
        for (sha1, path) in &self.gitlinks {
            writeln!(out, " gitlink: {sha1} {path}").expect("writing description");
        }
        if let Some(of_sha1) = &self.ghost.of_sha1 {
            writeln!(out, " ghost-of-sha1: {of_sha1}").expect("writing description");
        }
        if let Some(of_change_num) = &self.ghost.of_change_num {
            writeln!(out, " ghost-of-change-num: {of_change_num}")
                .expect("writing description");
        }
        if let Some(precedes_sha1) = &self.ghost.precedes_sha1 {
            writeln!(out, " ghost-precedes-sha1: {precedes_sha1}")
                .expect("writing description");
        }
        out
    }

    /// Parse a changelist description. Descriptions with no marker line
    /// (non-Fusion changelists) yield a `ChangeDesc` with only `message`
    /// set.
    pub fn parse(description: &str) -> Self {
        lazy_static! {
            static ref KEY_VALUE_RE: Regex =
                Regex::new(r"^\s([a-z0-9-]+): (.*)$").expect("compiling key-value regex");
        }

        let marker_pos = description
            .lines()
            .position(|line| line.trim() == BLOCK_MARKER);
        let marker_pos = match marker_pos {
            Some(pos) => pos,
            None => {
                return ChangeDesc {
                    message: description.trim_end().to_string(),
                    ..Default::default()
                }
            }
        };

        let lines: Vec<&str> = description.lines().collect();
        let message = lines[..marker_pos].join("\n").trim_end().to_string();
        let mut desc = ChangeDesc {
            message,
            ..Default::default()
        };
        for line in &lines[marker_pos + 1..] {
            let captures = match KEY_VALUE_RE.captures(line) {
                Some(captures) => captures,
                None => continue,
            };
            let key = captures.get(1).expect("key capture").as_str();
            let value = captures.get(2).expect("value capture").as_str().trim();
            match key {
                "author" => desc.author = Some(value.to_string()),
                "committer" => desc.committer = Some(value.to_string()),
                "pusher" => desc.pusher = Some(value.to_string()),
                "sha1" => desc.sha1 = Sha1::from_str(value).ok(),
                "push-state" => {
                    desc.push_state = match value {
                        "complete" => Some(PushState::Complete),
                        "incomplete" => Some(PushState::Incomplete),
                        _ => None,
                    }
                }
                "parents" => {
                    desc.parents = value
                        .split_whitespace()
                        .filter_map(|sha| Sha1::from_str(sha).ok())
                        .collect();
                }
                "depot-branch-id" => desc.depot_branch_id = Some(value.to_string()),
                "parent-branch" => {
                    if let Some((id, change)) = value.rsplit_once('@') {
                        if let Ok(change_num) = change.parse() {
                            desc.parent_branch = Some((id.to_string(), change_num));
                        }
                    }
                }
                "gitlink" => {
                    if let Some((sha, path)) = value.split_once(' ') {
                        if let Ok(sha1) = Sha1::from_str(sha) {
                            desc.gitlinks.push((sha1, path.to_string()));
                        }
                    }
                }
                "ghost-of-sha1" => desc.ghost.of_sha1 = Sha1::from_str(value).ok(),
                "ghost-of-change-num" => desc.ghost.of_change_num = value.parse().ok(),
                "ghost-precedes-sha1" => desc.ghost.precedes_sha1 = Sha1::from_str(value).ok(),
                _ => {}
            }
        }
        desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(byte: &str) -> Sha1 {
        byte.repeat(20).parse().unwrap()
    }

    #[test]
    fn test_render_parse_round_trip() {
        let desc = ChangeDesc {
            message: "Fix the frobnicator\n\nLonger body.".to_string(),
            sha1: Some(sha("ab")),
            parents: vec![sha("cd"), sha("ef")],
            author: Some("Alice <alice@example.com> 1400000000".to_string()),
            committer: Some("Bob <bob@example.com> 1400000001".to_string()),
            pusher: Some("git-fusion-user".to_string()),
            push_state: Some(PushState::Complete),
            depot_branch_id: Some("0123abcd-branchid".to_string()),
            parent_branch: Some(("parent-dbid".to_string(), 77)),
            gitlinks: vec![(sha("12"), "sub/module".to_string())],
            ghost: GhostInfo::default(),
        };
        let rendered = desc.render();
        let parsed = ChangeDesc::parse(&rendered);
        assert_eq!(parsed, desc);
    }

    #[test]
    fn test_ghost_round_trip() {
        let desc = ChangeDesc {
            message: String::new(),
            ghost: GhostInfo {
                of_sha1: Some(sha("aa")),
                of_change_num: Some(12),
                precedes_sha1: Some(sha("bb")),
            },
            ..Default::default()
        };
        let parsed = ChangeDesc::parse(&desc.render());
        assert!(parsed.ghost.is_ghost());
        assert_eq!(parsed.ghost.of_change_num, Some(12));
    }

    #[test]
    fn test_parse_non_fusion_description() {
        let parsed = ChangeDesc::parse("Ordinary depot change.\nSecond line.");
        assert_eq!(parsed.message, "Ordinary depot change.\nSecond line.");
        assert_eq!(parsed.sha1, None);
        assert!(!parsed.ghost.is_ghost());
    }

    #[test]
    fn test_message_containing_colon_lines() {
        // A commit message line like " note: thing" must not be eaten by
        // the parser, because it appears before the marker.
        let desc = ChangeDesc {
            message: " note: thing".to_string(),
            sha1: Some(sha("ab")),
            ..Default::default()
        };
        let parsed = ChangeDesc::parse(&desc.render());
        assert_eq!(parsed.message, " note: thing");
    }
}
