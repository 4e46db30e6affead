//! Path and mapping algebra for two-column depot↔client view lines.
//!
//! A view is an ordered list of mapping lines. Later lines override earlier
//! ones; exclusion lines (`-`) carve paths out of the mapping; overlay lines
//! (`+`) contribute without shadowing what came before them. Translation is
//! case-sensitive regardless of host OS.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("view line has unpaired double quote: {line:?}")]
    UnpairedQuote { line: String },

    #[error("view line does not have two columns: {line:?}")]
    ColumnCount { line: String },

    #[error("exclusion line cannot carry an overlay marker: {line:?}")]
    ExcludeOverlay { line: String },

    #[error("view line sides have mismatched wildcards: {line:?}")]
    WildcardMismatch { line: String },
}

/// Result type for view-map operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The modifier carried by one view line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapFlag {
    /// An ordinary inclusion line.
    Include,

    /// `-`: paths matching the lhs are removed from the mapping.
    Exclude,

    /// `+`: paths are added without shadowing earlier lines.
    Overlay,
}

/// Direction of a [`ViewMap::translate`] lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Left column (depot side) to right column.
    LhsToRhs,

    /// Right column to left column.
    RhsToLhs,
}

/// One two-column mapping line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewLine {
    /// The line's modifier.
    pub flag: MapFlag,

    /// Left column, without quoting or modifier.
    pub lhs: String,

    /// Right column, without quoting.
    pub rhs: String,
}

impl ViewLine {
    /// Construct an inclusion line.
    pub fn new(lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        ViewLine {
            flag: MapFlag::Include,
            lhs: lhs.into(),
            rhs: rhs.into(),
        }
    }
}

impl FromStr for ViewLine {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let columns = split_columns(trimmed)?;
        let (mut lhs, rhs) = match columns.as_slice() {
            [lhs, rhs] => (lhs.clone(), rhs.clone()),
            _ => {
                return Err(Error::ColumnCount {
                    line: line.to_string(),
                })
            }
        };
        let flag = if let Some(rest) = lhs.strip_prefix('-') {
            lhs = rest.to_string();
            MapFlag::Exclude
        } else if let Some(rest) = lhs.strip_prefix('+') {
            lhs = rest.to_string();
            MapFlag::Overlay
        } else {
            MapFlag::Include
        };
        if count_wildcards(&lhs) != count_wildcards(&rhs) {
            return Err(Error::WildcardMismatch {
                line: line.to_string(),
            });
        }
        Ok(ViewLine { flag, lhs, rhs })
    }
}

impl fmt::Display for ViewLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.flag {
            MapFlag::Include => "",
            MapFlag::Exclude => "-",
            MapFlag::Overlay => "+",
        };
        write!(
            f,
            "{}{} {}",
            marker,
            enquote(&self.lhs),
            enquote(&self.rhs)
        )
    }
}

/// Split a view line into columns, honoring paired double quotes around
/// paths containing spaces.
fn split_columns(line: &str) -> Result<Vec<String>> {
    let mut columns = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut saw_any = false;
    for c in line.chars() {
        match c {
            '"' => {
                in_quote = !in_quote;
                saw_any = true;
            }
            ' ' | '\t' if !in_quote => {
                if saw_any {
                    columns.push(std::mem::take(&mut current));
                    saw_any = false;
                }
            }
            other => {
                current.push(other);
                saw_any = true;
            }
        }
    }
    if in_quote {
        return Err(Error::UnpairedQuote {
            line: line.to_string(),
        });
    }
    if saw_any {
        columns.push(current);
    }
    Ok(columns)
}

/// Wrap a path in double quotes if it contains a space.
pub fn enquote(path: &str) -> String {
    if path.contains(' ') {
        format!("\"{path}\"")
    } else {
        path.to_string()
    }
}

/// Strip one layer of paired double quotes, if present.
pub fn dequote(path: &str) -> String {
    match path.strip_prefix('"').and_then(|p| p.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => path.to_string(),
    }
}

/// Escape the four reserved depot path characters (`%`, `#`, `@`, `*`)
/// using percent-encoding. `%` must be escaped first.
pub fn escape_path(path: &str) -> String {
    path.replace('%', "%25")
        .replace('#', "%23")
        .replace('@', "%40")
        .replace('*', "%2A")
}

/// Reverse [`escape_path`]. `%25` must be unescaped last.
pub fn unescape_path(path: &str) -> String {
    path.replace("%23", "#")
        .replace("%40", "@")
        .replace("%2A", "*")
        .replace("%25", "%")
}

fn count_wildcards(pattern: &str) -> usize {
    pattern.matches("...").count() + strip_dots(pattern).matches('*').count()
}

fn strip_dots(pattern: &str) -> String {
    pattern.replace("...", "")
}

/// Whether a concrete path matches a single wildcard pattern. Used for
/// view membership tests and interest-list intersection.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    match_pattern(pattern, path).is_some()
}

/// Match `path` against a single mapping pattern, returning captured
/// wildcard text in order of appearance. `...` matches any run of
/// characters including `/`; `*` matches within one path component.
fn match_pattern(pattern: &str, path: &str) -> Option<Vec<String>> {
    fn matches(pattern: &str, path: &str, captures: &mut Vec<String>) -> bool {
        if let Some(rest_pattern) = pattern.strip_prefix("...") {
            // Greedy from the right so trailing literal components anchor.
            for split in (0..=path.len()).rev() {
                if !path.is_char_boundary(split) {
                    continue;
                }
                let depth = captures.len();
                captures.push(path[..split].to_string());
                if matches(rest_pattern, &path[split..], captures) {
                    return true;
                }
                captures.truncate(depth);
            }
            false
        } else if let Some(rest_pattern) = pattern.strip_prefix('*') {
            for split in (0..=path.len()).rev() {
                if !path.is_char_boundary(split) || path[..split].contains('/') {
                    continue;
                }
                let depth = captures.len();
                captures.push(path[..split].to_string());
                if matches(rest_pattern, &path[split..], captures) {
                    return true;
                }
                captures.truncate(depth);
            }
            false
        } else {
            match (pattern.chars().next(), path.chars().next()) {
                (None, None) => true,
                (Some(pc), Some(xc)) if pc == xc => {
                    matches(&pattern[pc.len_utf8()..], &path[xc.len_utf8()..], captures)
                }
                _ => false,
            }
        }
    }

    let mut captures = Vec::new();
    if matches(pattern, path, &mut captures) {
        Some(captures)
    } else {
        None
    }
}

/// Substitute wildcard captures back into the other column's pattern.
fn substitute(pattern: &str, captures: &[String]) -> String {
    let mut result = String::new();
    let mut rest = pattern;
    let mut next_capture = 0;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("...") {
            result.push_str(&captures[next_capture]);
            next_capture += 1;
            rest = after;
        } else if let Some(after) = rest.strip_prefix('*') {
            result.push_str(&captures[next_capture]);
            next_capture += 1;
            rest = after;
        } else {
            let c = rest.chars().next().expect("nonempty rest");
            result.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    result
}

/// A compiled, ordered bidirectional path mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewMap {
    lines: Vec<ViewLine>,
}

impl ViewMap {
    /// Compile an ordered list of mapping lines.
    pub fn compile(lines: Vec<ViewLine>) -> Result<Self> {
        for line in &lines {
            if line.flag == MapFlag::Exclude && line.lhs.starts_with('+') {
                return Err(Error::ExcludeOverlay {
                    line: line.to_string(),
                });
            }
        }
        Ok(ViewMap { lines })
    }

    /// Parse and compile newline-separated view text.
    pub fn from_string(text: &str) -> Result<Self> {
        let lines = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ViewLine::from_str)
            .collect::<Result<Vec<_>>>()?;
        Self::compile(lines)
    }

    /// The mapping lines, in order.
    pub fn as_lines(&self) -> &[ViewLine] {
        &self.lines
    }

    /// The left-column patterns, in order (modifiers stripped).
    pub fn lhs(&self) -> Vec<String> {
        self.lines.iter().map(|line| line.lhs.clone()).collect()
    }

    /// The right-column patterns, in order.
    pub fn rhs(&self) -> Vec<String> {
        self.lines.iter().map(|line| line.rhs.clone()).collect()
    }

    /// Whether the map has no lines.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Append a mapping line.
    pub fn insert(&mut self, line: ViewLine) {
        self.lines.push(line);
    }

    /// Translate a concrete path through the map. Returns `None` when the
    /// path is unmapped or excluded. Later lines win, except that overlay
    /// lines never shadow an earlier match.
    pub fn translate(&self, path: &str, direction: Direction) -> Option<String> {
        let mut decided: Option<String> = None;
        for line in &self.lines {
            let (from, to) = match direction {
                Direction::LhsToRhs => (&line.lhs, &line.rhs),
                Direction::RhsToLhs => (&line.rhs, &line.lhs),
            };
            let captures = match match_pattern(from, path) {
                Some(captures) => captures,
                None => continue,
            };
            match line.flag {
                MapFlag::Exclude => decided = None,
                MapFlag::Include => decided = Some(substitute(to, &captures)),
                MapFlag::Overlay => {
                    if decided.is_none() {
                        decided = Some(substitute(to, &captures));
                    }
                }
            }
        }
        decided
    }

    /// Whether a concrete path is visible through the map's left column.
    pub fn contains_lhs(&self, depot_path: &str) -> bool {
        self.translate(depot_path, Direction::LhsToRhs).is_some()
    }

    /// Produce a map with columns swapped.
    pub fn reverse(&self) -> ViewMap {
        ViewMap {
            lines: self
                .lines
                .iter()
                .map(|line| ViewLine {
                    flag: line.flag,
                    lhs: line.rhs.clone(),
                    rhs: line.lhs.clone(),
                })
                .collect(),
        }
    }

    /// Join two maps: the result maps this map's lhs to `other`'s rhs
    /// through the shared middle column, keeping only lines whose rhs
    /// translates (intersection semantics).
    pub fn join(&self, other: &ViewMap) -> ViewMap {
        let mut lines = Vec::new();
        for line in &self.lines {
            if line.flag == MapFlag::Exclude {
                lines.push(line.clone());
                continue;
            }
            // Wildcard-for-wildcard joins only need the pattern rewritten
            // when the middle column matches a line of `other` verbatim.
            if let Some(joined_rhs) = other.translate_pattern(&line.rhs) {
                lines.push(ViewLine {
                    flag: line.flag,
                    lhs: line.lhs.clone(),
                    rhs: joined_rhs,
                });
            }
        }
        ViewMap { lines }
    }

    /// Translate a pattern (which may itself contain wildcards) by treating
    /// wildcards as opaque capture text.
    fn translate_pattern(&self, pattern: &str) -> Option<String> {
        // Encode wildcards as characters that cannot appear in depot paths,
        // translate, then decode.
        let encoded = pattern.replace("...", "\u{1}").replace('*', "\u{2}");
        let translated = self.translate_encoded(&encoded)?;
        Some(translated.replace('\u{1}', "...").replace('\u{2}', "*"))
    }

    fn translate_encoded(&self, path: &str) -> Option<String> {
        let lines: Vec<ViewLine> = self
            .lines
            .iter()
            .map(|line| ViewLine {
                flag: line.flag,
                lhs: line.lhs.replace("...", "\u{1}").replace('*', "\u{2}"),
                rhs: line.rhs.replace("...", "\u{1}").replace('*', "\u{2}"),
            })
            .collect();
        let mut decided = None;
        for line in &lines {
            let captures = match match_pattern_encoded(&line.lhs, path) {
                Some(captures) => captures,
                None => continue,
            };
            match line.flag {
                MapFlag::Exclude => decided = None,
                MapFlag::Include => decided = Some(substitute_encoded(&line.rhs, &captures)),
                MapFlag::Overlay => {
                    if decided.is_none() {
                        decided = Some(substitute_encoded(&line.rhs, &captures));
                    }
                }
            }
        }
        decided
    }

    /// Replace one depot-root prefix with another on every lhs. Used when
    /// copying a branch view onto a new storage region.
    pub fn reroot_lhs(&self, old_root: &str, new_root: &str) -> ViewMap {
        let old_root = old_root.trim_end_matches('/');
        let new_root = new_root.trim_end_matches('/');
        ViewMap {
            lines: self
                .lines
                .iter()
                .map(|line| {
                    let lhs = match line.lhs.strip_prefix(old_root) {
                        Some(rest) => format!("{new_root}{rest}"),
                        None => line.lhs.clone(),
                    };
                    ViewLine {
                        flag: line.flag,
                        lhs,
                        rhs: line.rhs.clone(),
                    }
                })
                .collect(),
        }
    }

    /// Render back to newline-separated text.
    pub fn to_view_text(&self) -> String {
        self.lines
            .iter()
            .map(ViewLine::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// The `\u{1}`/`\u{2}` encoded forms reuse the concrete matcher with the
// placeholder characters acting as single-character wildcard stand-ins.
fn match_pattern_encoded(pattern: &str, path: &str) -> Option<Vec<String>> {
    let pattern = pattern.replace('\u{1}', "...").replace('\u{2}', "*");
    match_pattern(&pattern, path)
}

fn substitute_encoded(pattern: &str, captures: &[String]) -> String {
    let pattern = pattern.replace('\u{1}', "...").replace('\u{2}', "*");
    substitute(&pattern, captures)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(lines: &[&str]) -> ViewMap {
        ViewMap::compile(lines.iter().map(|l| l.parse().unwrap()).collect()).unwrap()
    }

    #[test]
    fn test_parse_markers_and_quotes() {
        let line: ViewLine = "-//depot/main/secret/... secret/...".parse().unwrap();
        assert_eq!(line.flag, MapFlag::Exclude);
        assert_eq!(line.lhs, "//depot/main/secret/...");

        let line: ViewLine = "+//depot/extra/... extra/...".parse().unwrap();
        assert_eq!(line.flag, MapFlag::Overlay);

        let line: ViewLine = "\"//depot/has space/...\" \"has space/...\"".parse().unwrap();
        assert_eq!(line.lhs, "//depot/has space/...");
        assert_eq!(line.rhs, "has space/...");
        assert_eq!(
            line.to_string(),
            "\"//depot/has space/...\" \"has space/...\""
        );

        assert!("\"//depot/broken/... x/...".parse::<ViewLine>().is_err());
        assert!("//depot/one-column/...".parse::<ViewLine>().is_err());
    }

    #[test]
    fn test_translate_last_match_wins() {
        let view = map(&[
            "//depot/main/... ...",
            "//depot/main/docs/... documentation/...",
        ]);
        assert_eq!(
            view.translate("//depot/main/src/a.c", Direction::LhsToRhs),
            Some("src/a.c".to_string())
        );
        assert_eq!(
            view.translate("//depot/main/docs/guide.md", Direction::LhsToRhs),
            Some("documentation/guide.md".to_string())
        );
        assert_eq!(
            view.translate("documentation/guide.md", Direction::RhsToLhs),
            Some("//depot/main/docs/guide.md".to_string())
        );
    }

    #[test]
    fn test_exclusion_and_overlay() {
        let view = map(&[
            "//depot/main/... ...",
            "-//depot/main/secret/... secret/...",
            "+//depot/overlay/... ...",
        ]);
        assert_eq!(
            view.translate("//depot/main/secret/key.pem", Direction::LhsToRhs),
            None
        );
        // Overlay adds paths not otherwise mapped.
        assert_eq!(
            view.translate("//depot/overlay/extra.txt", Direction::LhsToRhs),
            Some("extra.txt".to_string())
        );
        // Overlay does not shadow the earlier inclusion.
        assert_eq!(
            view.translate("//depot/main/a.txt", Direction::LhsToRhs),
            Some("a.txt".to_string())
        );
    }

    #[test]
    fn test_star_wildcard() {
        let view = map(&["//depot/rel/*/bin/... releases/*/bin/..."]);
        assert_eq!(
            view.translate("//depot/rel/2.0/bin/tool", Direction::LhsToRhs),
            Some("releases/2.0/bin/tool".to_string())
        );
        // `*` does not cross slashes.
        assert_eq!(
            view.translate("//depot/rel/2.0/extra/bin/tool", Direction::LhsToRhs),
            None
        );
    }

    #[test]
    fn test_case_sensitive() {
        let view = map(&["//depot/Main/... ..."]);
        assert_eq!(view.translate("//depot/main/a", Direction::LhsToRhs), None);
        assert_eq!(
            view.translate("//depot/Main/a", Direction::LhsToRhs),
            Some("a".to_string())
        );
    }

    #[test]
    fn test_reverse_and_reroot() {
        let view = map(&["//depot/branches/task1/... //myclient/..."]);
        let reversed = view.reverse();
        assert_eq!(
            reversed.translate("//myclient/x", Direction::LhsToRhs),
            Some("//depot/branches/task1/x".to_string())
        );
        let rerooted = view.reroot_lhs("//depot/branches/task1", "//depot/branches/task2");
        assert_eq!(
            rerooted.translate("//depot/branches/task2/x", Direction::LhsToRhs),
            Some("//myclient/x".to_string())
        );
    }

    #[test]
    fn test_join() {
        let depot_to_repo = map(&["//depot/main/... ..."]);
        let repo_to_client = map(&["... //p4gf_repo/..."]);
        let joined = depot_to_repo.join(&repo_to_client);
        assert_eq!(
            joined.translate("//depot/main/a.c", Direction::LhsToRhs),
            Some("//p4gf_repo/a.c".to_string())
        );
    }

    #[test]
    fn test_round_trip_as_lines() {
        let lines = vec![
            "//depot/main/... ...".parse::<ViewLine>().unwrap(),
            "-//depot/main/secret/... secret/...".parse().unwrap(),
        ];
        let view = ViewMap::compile(lines.clone()).unwrap();
        assert_eq!(view.as_lines(), lines.as_slice());
        let reparsed = ViewMap::from_string(&view.to_view_text()).unwrap();
        assert_eq!(reparsed, view);
    }

    #[test]
    fn test_view_text_rendering() {
        let view = map(&[
            "//depot/main/... ...",
            "-//depot/main/secret/... secret/...",
            "+//depot/extra/... extra/...",
        ]);
        insta::assert_snapshot!(view.to_view_text(), @r###"
        //depot/main/... ...
        -//depot/main/secret/... secret/...
        +//depot/extra/... extra/...
        "###);
    }

    #[test]
    fn test_escape_round_trip() {
        let path = "//depot/odd/a@b#c*d%e";
        assert_eq!(unescape_path(&escape_path(path)), path);
        assert_eq!(escape_path("a%23"), "a%2523");
        assert_eq!(escape_path("war&peace"), "war&peace");
    }
}
