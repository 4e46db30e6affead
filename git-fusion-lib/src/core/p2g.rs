//! The depot→Git copier: discover new changelists in branch views, fetch
//! file content into blobs, synthesize commits on the right Git branches,
//! and move refs, all emitted through one fast-import stream.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use eyre::{eyre, Context as EyreContext};
use itertools::Itertools;
use tracing::{debug, instrument, warn};

use crate::depot::{Connection, DepotResult, PrintSink, TaggedDict};
use crate::git::{FastImportScript, FileChange, GitFileMode, Mark, ParentRef, Sha1};

use super::branch::Branch;
use super::changedesc::ChangeDesc;
use super::context::Context;
use super::mirror::ObjectMirror;
use super::view_map::escape_path;

/// How blob lookups discovered during a copy are remembered.
pub trait RevBlobStore {
    /// Record that `(depot_path, rev)` hashed to `sha1`.
    fn put(&mut self, depot_path: &str, rev: u64, sha1: Sha1) -> eyre::Result<()>;

    /// Look up a previously-recorded blob sha.
    fn get(&self, depot_path: &str, rev: u64) -> eyre::Result<Option<Sha1>>;
}

/// In-memory store, the default.
#[derive(Debug, Default)]
pub struct MemoryRevStore {
    map: HashMap<(String, u64), Sha1>,
}

impl RevBlobStore for MemoryRevStore {
    fn put(&mut self, depot_path: &str, rev: u64, sha1: Sha1) -> eyre::Result<()> {
        self.map.insert((depot_path.to_string(), rev), sha1);
        Ok(())
    }

    fn get(&self, depot_path: &str, rev: u64) -> eyre::Result<Option<Sha1>> {
        Ok(self.map.get(&(depot_path.to_string(), rev)).copied())
    }
}

/// Memory-capped store: each record is a filesystem symlink under a
/// temporary directory whose target is the blob's loose-object path, so a
/// huge history never holds its blob table in memory.
#[derive(Debug)]
pub struct SymlinkRevStore {
    dir: PathBuf,
}

impl SymlinkRevStore {
    /// Create over a scratch directory.
    pub fn new(dir: PathBuf) -> Self {
        SymlinkRevStore { dir }
    }

    fn link_path(&self, depot_path: &str, rev: u64) -> PathBuf {
        let flat = escape_path(depot_path).replace('/', "_");
        self.dir.join(format!("{flat}@{rev}"))
    }

    fn loose_object_path(sha1: Sha1) -> PathBuf {
        let (a, b, rest) = sha1.to_path_parts();
        PathBuf::from("objects").join(a).join(format!("{b}{rest}"))
    }

    fn loose_object_sha1(target: &std::path::Path) -> Option<Sha1> {
        let file = target.file_name()?.to_str()?;
        let dir = target.parent()?.file_name()?.to_str()?;
        format!("{dir}{file}").parse().ok()
    }
}

impl RevBlobStore for SymlinkRevStore {
    fn put(&mut self, depot_path: &str, rev: u64, sha1: Sha1) -> eyre::Result<()> {
        let link = self.link_path(depot_path, rev);
        if link.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir).wrap_err("Creating symlink store dir")?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(Self::loose_object_path(sha1), &link)
            .wrap_err("Writing symlink record")?;
        #[cfg(not(unix))]
        std::fs::write(&link, Self::loose_object_path(sha1).to_string_lossy().as_bytes())
            .wrap_err("Writing link record")?;
        Ok(())
    }

    fn get(&self, depot_path: &str, rev: u64) -> eyre::Result<Option<Sha1>> {
        let link = self.link_path(depot_path, rev);
        match std::fs::read_link(&link) {
            Ok(target) => Ok(Self::loose_object_sha1(&target)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).wrap_err("Reading symlink record"),
        }
    }
}

/// One changelist queued for copying, with the branch it affects.
#[derive(Clone, Debug)]
struct ChangeWorkItem {
    change_num: u64,
    branch_id: String,
    description: String,
}

/// One file row of a changelist's describe output.
#[derive(Clone, Debug)]
pub struct DescribedFile {
    /// Depot path.
    pub depot_path: String,

    /// Revision created by the changelist.
    pub rev: u64,

    /// The depot action (`add`, `edit`, `delete`, `branch`, `integrate`,
    /// `move/add`, …).
    pub action: String,

    /// The depot filetype string.
    pub filetype: String,
}

impl DescribedFile {
    /// Whether the action removes the file.
    pub fn is_delete(&self) -> bool {
        self.action.contains("delete")
    }

    /// Whether the filetype marks a symlink.
    pub fn is_symlink(&self) -> bool {
        self.filetype.contains("symlink")
    }

    /// Whether the filetype carries the executable bit.
    pub fn is_executable(&self) -> bool {
        self.filetype.contains("+x") || self.filetype.contains("x+")
    }

    /// The Git file mode for this row.
    pub fn git_mode(&self) -> GitFileMode {
        if self.is_symlink() {
            GitFileMode::Symlink
        } else if self.is_executable() {
            GitFileMode::BlobExecutable
        } else {
            GitFileMode::Blob
        }
    }
}

/// Parse the numbered file rows of a `describe` dictionary.
pub fn parse_described_files(row: &TaggedDict) -> DepotResult<Vec<DescribedFile>> {
    let mut files = Vec::new();
    for (i, depot_path) in row.get_numbered("depotFile").into_iter().enumerate() {
        let rev = row.get_int(&format!("rev{i}"))?.unwrap_or(1);
        let action = row.get(&format!("action{i}")).unwrap_or("edit").to_string();
        let filetype = row.get(&format!("type{i}")).unwrap_or("text").to_string();
        files.push(DescribedFile {
            depot_path,
            rev,
            action,
            filetype,
        });
    }
    Ok(files)
}

/// Summary of one depot→Git copy.
#[derive(Clone, Debug, Default)]
pub struct P2GSummary {
    /// Changelists copied, in changelist order.
    pub copied_changes: Vec<u64>,

    /// Final ref positions written, by full ref name.
    pub ref_updates: BTreeMap<String, Sha1>,

    /// New (commit sha, branch id, changelist) associations to record in
    /// the mirror.
    pub new_mirror_records: Vec<(Sha1, String, u64)>,
}

/// The depot→Git copier for one repo.
pub struct P2G<'ctx> {
    ctx: &'ctx Context,
    mirror: ObjectMirror,
    rev_store: Box<dyn RevBlobStore>,
}

impl<'ctx> P2G<'ctx> {
    /// Construct with the default in-memory blob table.
    pub fn new(ctx: &'ctx Context) -> Self {
        P2G {
            ctx,
            mirror: ctx.object_mirror(),
            rev_store: Box::new(MemoryRevStore::default()),
        }
    }

    /// Construct in memory-capped mode: blob records as symlinks, one
    /// changelist in flight at a time.
    pub fn new_memcapped(ctx: &'ctx Context, symlink_dir: PathBuf) -> Self {
        P2G {
            ctx,
            mirror: ctx.object_mirror(),
            rev_store: Box::new(SymlinkRevStore::new(symlink_dir)),
        }
    }

    /// Copy every changelist after each branch's last-copied point, up to
    /// `stop_at` (default: current head). Refs move only after the whole
    /// stream imports; the last-copied counter advances last, so a crash
    /// leaves Git untouched and the copy restartable.
    #[instrument(skip(self))]
    pub fn copy(&mut self, stop_at: Option<u64>) -> eyre::Result<P2GSummary> {
        let work = self.discover_changes(stop_at)?;
        if work.is_empty() {
            debug!("no new changelists to copy");
            return Ok(P2GSummary::default());
        }
        self.ctx.heartbeat_check().map_err(|err| eyre!("{err}"))?;

        let mut script = FastImportScript::new();
        let mut branch_heads: HashMap<String, ParentRef> = self.known_branch_heads()?;
        let mut mark_to_commit: Vec<(Mark, u64, String)> = Vec::new();
        let mut summary = P2GSummary::default();

        for item in work.values() {
            self.ctx.heartbeat_check().map_err(|err| eyre!("{err}"))?;
            let mark = self.emit_change(&mut script, item, &mut branch_heads)?;
            if let Some(mark) = mark {
                mark_to_commit.push((mark, item.change_num, item.branch_id.clone()));
            }
            summary.copied_changes.push(item.change_num);
        }

        let marks = if script.as_bytes().is_empty() {
            Vec::new()
        } else {
            script.run(self.ctx.git_runner()?)?
        };
        let mark_sha: HashMap<Mark, Sha1> = marks.into_iter().collect();

        // Resolve marks into final ref positions and mirror records.
        let mut final_heads: HashMap<String, Sha1> = HashMap::new();
        for (branch_id, head) in &branch_heads {
            let sha1 = match head {
                ParentRef::Sha1(sha1) => Some(*sha1),
                ParentRef::Mark(mark) => mark_sha.get(mark).copied(),
            };
            if let Some(sha1) = sha1 {
                final_heads.insert(branch_id.clone(), sha1);
            }
        }
        for (mark, change_num, branch_id) in mark_to_commit {
            let sha1 = mark_sha
                .get(&mark)
                .copied()
                .ok_or_else(|| eyre!("fast-import exported no sha for {mark}"))?;
            summary
                .new_mirror_records
                .push((sha1, branch_id, change_num));
        }

        // Populate the mirror before refs move: a restart after a crash
        // here re-reads these records and reuses the objects.
        if !summary.new_mirror_records.is_empty() {
            let mut batch = self.mirror.batch();
            for (sha1, branch_id, change_num) in &summary.new_mirror_records {
                batch.add_commit_record(*sha1, branch_id, *change_num);
            }
            batch
                .submit(self.ctx.mirror_conn(), "mirror depot-to-git copy")
                .wrap_err("Submitting mirror records")?;
        }

        let git_repo = self.ctx.git_repo()?;
        {
            let dict = self.ctx.branch_dict.borrow();
            for (branch_id, sha1) in &final_heads {
                let branch = match dict.get(branch_id) {
                    Some(branch) => branch,
                    None => continue,
                };
                if let Some(git_branch_name) = &branch.git_branch_name {
                    let ref_name = format!("refs/heads/{git_branch_name}");
                    git_repo.update_ref(&ref_name, *sha1, "depot copy")?;
                    summary.ref_updates.insert(ref_name, *sha1);
                }
            }
        }
        self.materialize_pending_tags(&mut summary)?;

        if let Some(highest) = summary.copied_changes.iter().max().copied() {
            self.ctx.write_last_copied_change(highest)?;
        }
        Ok(summary)
    }

    /// Step 1: per-branch changelist discovery, merged into one sorted
    /// work list.
    fn discover_changes(
        &self,
        stop_at: Option<u64>,
    ) -> eyre::Result<BTreeMap<u64, ChangeWorkItem>> {
        let conn = self.ctx.conn();
        let mut work = BTreeMap::new();
        let branches = {
            let dict = self.ctx.branch_dict.borrow();
            dict.values().filter(|b| !b.deleted).cloned().collect_vec()
        };
        for branch in &branches {
            let start = self
                .mirror
                .highest_change_for_branch(self.ctx.mirror_conn(), &branch.branch_id)?
                .map(|change_num| change_num + 1)
                .unwrap_or(1);
            for row in self.changes_in_view(conn, branch, start, stop_at)? {
                let change_num = match row.get_int("change")? {
                    Some(change_num) => change_num,
                    None => continue,
                };
                let description = row.get("desc").unwrap_or_default().to_string();
                // A ghost changelist reproduces state Git already has; it
                // never becomes a commit.
                if ChangeDesc::parse(&description).ghost.is_ghost() {
                    continue;
                }
                work.entry(change_num).or_insert_with(|| ChangeWorkItem {
                    change_num,
                    branch_id: branch.branch_id.clone(),
                    description,
                });
            }
        }
        Ok(work)
    }

    fn changes_in_view(
        &self,
        conn: &dyn Connection,
        branch: &Branch,
        start: u64,
        stop_at: Option<u64>,
    ) -> DepotResult<Vec<TaggedDict>> {
        let stop = stop_at
            .map(|change_num| change_num.to_string())
            .unwrap_or_else(|| "now".to_string());
        let mut rows = Vec::new();
        for pattern in branch.included_lhs_patterns() {
            let range_arg = format!("{pattern}@{start},{stop}");
            rows.extend(conn.run_tagged("changes", &["-l", &range_arg])?);
        }
        Ok(rows)
    }

    /// Currently-known branch head commits from the mirror, used as
    /// `from` parents when the stream begins.
    fn known_branch_heads(&self) -> eyre::Result<HashMap<String, ParentRef>> {
        let mut heads = HashMap::new();
        let dict = self.ctx.branch_dict.borrow();
        for branch in dict.values() {
            let highest = self
                .mirror
                .highest_change_for_branch(self.ctx.mirror_conn(), &branch.branch_id)?;
            if let Some(change_num) = highest {
                if let Some(sha1) = self.mirror.commit_for_change(
                    self.ctx.mirror_conn(),
                    &branch.branch_id,
                    change_num,
                )? {
                    heads.insert(branch.branch_id.clone(), ParentRef::Sha1(sha1));
                }
            }
        }
        Ok(heads)
    }

    /// Steps 2 and 4 for one changelist: fetch blobs, choose parents, and
    /// emit the commit. Returns the commit's mark, or `None` when the
    /// commit already exists in Git (mirror fast path).
    fn emit_change(
        &mut self,
        script: &mut FastImportScript,
        item: &ChangeWorkItem,
        branch_heads: &mut HashMap<String, ParentRef>,
    ) -> eyre::Result<Option<Mark>> {
        let conn = self.ctx.conn();
        let branch = {
            let dict = self.ctx.branch_dict.borrow();
            dict.get(&item.branch_id)
                .cloned()
                .ok_or_else(|| eyre!("change {} has unknown branch", item.change_num))?
        };

        // Mirror fast path: an already-recorded (commit, branch) pair is
        // copied by reusing the existing objects.
        if let Some(existing) = self.mirror.commit_for_change(
            self.ctx.mirror_conn(),
            &item.branch_id,
            item.change_num,
        )? {
            if self.ctx.git_repo()?.object_exists(existing) {
                branch_heads.insert(item.branch_id.clone(), ParentRef::Sha1(existing));
                return Ok(None);
            }
        }

        let describe = crate::depot::client::run_tagged_one(
            conn,
            "describe",
            &["-s", &item.change_num.to_string()],
        )?
        .ok_or_else(|| eyre!("changelist {} disappeared mid-copy", item.change_num))?;
        let files = parse_described_files(&describe)?;

        let mut changes: Vec<FileChange> = Vec::new();
        for file in &files {
            let repo_path = match branch.depot_to_repo_path(&file.depot_path) {
                Some(repo_path) => repo_path,
                None => continue,
            };
            if file.is_delete() {
                changes.push(FileChange::Delete { path: repo_path });
                continue;
            }
            let blob = self.blob_for_rev(script, file)?;
            changes.push(FileChange::Modify {
                mode: file.git_mode(),
                blob,
                path: repo_path,
            });
        }

        let desc = ChangeDesc::parse(&item.description);
        let parents = self.parent_commits(&desc, item, &branch, branch_heads)?;
        let (author, committer) = signature_for(&desc, &describe);
        let message = commit_message(&desc, item.change_num);

        let ref_name = match &branch.git_branch_name {
            Some(git_branch_name) => format!("refs/heads/{git_branch_name}"),
            None => format!("refs/git-fusion/branches/{}", branch.branch_id),
        };
        let mark = script.commit(
            &ref_name,
            (&author.0, &author.1, author.2),
            (&committer.0, &committer.1, committer.2),
            message.as_bytes(),
            &parents,
            &changes,
        );
        branch_heads.insert(item.branch_id.clone(), ParentRef::Mark(mark));
        Ok(Some(mark))
    }

    /// Fetch one file revision's bytes and hash them into a blob, reusing
    /// mirror content and previously-printed revisions.
    fn blob_for_rev(
        &mut self,
        script: &mut FastImportScript,
        file: &DescribedFile,
    ) -> eyre::Result<ParentRef> {
        if let Some(sha1) = self.rev_store.get(&file.depot_path, file.rev)? {
            if self.ctx.git_repo()?.object_exists(sha1) {
                return Ok(ParentRef::Sha1(sha1));
            }
        }
        struct Grab {
            content: Vec<u8>,
            seen: bool,
        }
        impl PrintSink for Grab {
            fn file(&mut self, _depot_path: &str, _rev: u64, content: &[u8]) -> DepotResult<()> {
                self.content = content.to_vec();
                self.seen = true;
                Ok(())
            }
        }
        let mut sink = Grab {
            content: Vec::new(),
            seen: false,
        };
        self.ctx.conn().print(
            &[format!("{}#{}", file.depot_path, file.rev)],
            &mut sink,
        )?;
        if !sink.seen {
            return Err(eyre!(
                "could not print {}#{}",
                file.depot_path,
                file.rev
            ));
        }
        let mut content = sink.content;
        // The depot stores symlink targets with a trailing newline; Git
        // hashes the raw target bytes.
        if file.is_symlink() && content.last() == Some(&b'\n') {
            content.pop();
        }
        let sha1 = Sha1::hash_object(git2::ObjectType::Blob, &content)
            .map_err(|err| eyre!("hashing blob: {err}"))?;
        self.rev_store.put(&file.depot_path, file.rev, sha1)?;

        // Already present from a previous (possibly interrupted) copy?
        if self.ctx.git_repo()?.object_exists(sha1) {
            return Ok(ParentRef::Sha1(sha1));
        }
        if let Some(mirrored) = self.mirror.fetch_blob(self.ctx.mirror_conn(), sha1)? {
            let mark = script.blob(&mirrored);
            return Ok(ParentRef::Mark(mark));
        }
        let mark = script.blob(&content);
        Ok(ParentRef::Mark(mark))
    }

    /// Parent-commit analysis: the description's tag block wins; otherwise
    /// filelog integration sources are converted into mirrored commits,
    /// with first-parent = the previous changelist on the same branch.
    fn parent_commits(
        &self,
        desc: &ChangeDesc,
        item: &ChangeWorkItem,
        branch: &Branch,
        branch_heads: &HashMap<String, ParentRef>,
    ) -> eyre::Result<Vec<ParentRef>> {
        if !desc.parents.is_empty() {
            let mut parents = Vec::new();
            for parent_sha1 in &desc.parents {
                if self.ctx.git_repo()?.object_exists(*parent_sha1) {
                    parents.push(ParentRef::Sha1(*parent_sha1));
                } else if let Some(head) = branch_heads.get(&item.branch_id) {
                    parents.push(*head);
                }
            }
            if !parents.is_empty() {
                return Ok(parents);
            }
        }

        let mut parents = Vec::new();
        if let Some(head) = branch_heads.get(&item.branch_id) {
            parents.push(*head);
        }
        for (source_branch_id, source_change) in
            self.integ_sources(item.change_num, branch)?
        {
            if source_branch_id == item.branch_id {
                continue;
            }
            if let Some(source_sha1) = self.mirror.commit_for_change(
                self.ctx.mirror_conn(),
                &source_branch_id,
                source_change,
            )? {
                parents.push(ParentRef::Sha1(source_sha1));
            } else if let Some(head) = branch_heads.get(&source_branch_id) {
                parents.push(*head);
            }
        }
        Ok(parents.into_iter().unique_by(parent_key).collect())
    }

    /// Run filelog over a changelist and resolve each integration source
    /// to (branch id, changelist).
    fn integ_sources(
        &self,
        change_num: u64,
        branch: &Branch,
    ) -> eyre::Result<Vec<(String, u64)>> {
        let conn = self.ctx.conn();
        let mut sources = Vec::new();
        for pattern in branch.included_lhs_patterns() {
            let arg = format!("{pattern}@={change_num}");
            for row in conn.run_tagged("filelog", &["-m1", &arg])? {
                for source_path_rev in row.get_numbered("sourceFile") {
                    let (source_path, source_rev) =
                        match source_path_rev.rsplit_once('#') {
                            Some((path, rev)) => {
                                (path.to_string(), rev.parse::<u64>().unwrap_or(1))
                            }
                            None => (source_path_rev, 1),
                        };
                    let source_change =
                        match self.change_for_path_rev(&source_path, source_rev)? {
                            Some(source_change) => source_change,
                            None => continue,
                        };
                    if let Some(source_branch_id) = self.branch_for_depot_path(&source_path)
                    {
                        sources.push((source_branch_id, source_change));
                    }
                }
            }
        }
        Ok(sources.into_iter().unique().collect())
    }

    fn change_for_path_rev(&self, depot_path: &str, rev: u64) -> DepotResult<Option<u64>> {
        let arg = format!("{depot_path}#{rev},#{rev}");
        let rows = self.ctx.conn().run_tagged("changes", &["-m1", &arg])?;
        for row in rows {
            if let Some(change_num) = row.get_int("change")? {
                return Ok(Some(change_num));
            }
        }
        Ok(None)
    }

    /// Map an integration-source depot path to the branch housing it,
    /// minting a lightweight branch when the path belongs to a storage
    /// region not yet represented in the repo (step 3).
    fn branch_for_depot_path(&self, depot_path: &str) -> Option<String> {
        {
            let dict = self.ctx.branch_dict.borrow();
            if let Some(branch) = dict
                .values()
                .find(|branch| branch.intersects_depot_path(depot_path))
            {
                return Some(branch.branch_id.clone());
            }
        }
        let region = {
            let index = self.ctx.depot_branch_index.borrow();
            index.find_by_depot_path(depot_path).cloned()
        }?;
        let template = {
            let dict = self.ctx.branch_dict.borrow();
            super::branch::most_equal(&dict).cloned()
        }?;
        let branch_id = format!("anon-{}", self.ctx.config.id_gen.next_id());
        let branch = template.copy_rerooted(&branch_id, &region);
        warn!(
            branch_id = %branch_id,
            region = %region.depot_branch_id,
            "minting branch for integration source region"
        );
        self.ctx
            .branch_dict
            .borrow_mut()
            .insert(branch_id.clone(), branch);
        Some(branch_id)
    }

    /// Step 6b: tags recorded by previous pushes but not yet materialized
    /// as Git refs.
    fn materialize_pending_tags(&self, summary: &mut P2GSummary) -> eyre::Result<()> {
        struct Tags {
            entries: Vec<(String, String)>,
        }
        impl PrintSink for Tags {
            fn file(&mut self, depot_path: &str, _rev: u64, content: &[u8]) -> DepotResult<()> {
                let name = depot_path
                    .rsplit_once('/')
                    .map(|(_, name)| name.to_string())
                    .unwrap_or_default();
                self.entries
                    .push((name, String::from_utf8_lossy(content).trim().to_string()));
                Ok(())
            }
        }
        let mut sink = Tags {
            entries: Vec::new(),
        };
        let pattern = format!(
            "//{}/repos/{}/tags/...",
            self.ctx.config.depot, self.ctx.config.repo
        );
        self.ctx.conn().print(&[pattern], &mut sink)?;
        let git_repo = self.ctx.git_repo()?;
        for (tag_name, sha_text) in sink.entries {
            let sha1: Sha1 = match sha_text.parse() {
                Ok(sha1) => sha1,
                Err(_) => continue,
            };
            let ref_name = format!("refs/tags/{tag_name}");
            if git_repo.resolve_ref(&ref_name)?.is_none() && git_repo.object_exists(sha1) {
                git_repo.update_ref(&ref_name, sha1, "materialize pushed tag")?;
                summary.ref_updates.insert(ref_name, sha1);
            }
        }
        Ok(())
    }
}

fn parent_key(parent: &ParentRef) -> String {
    match parent {
        ParentRef::Mark(mark) => format!("mark-{}", mark.0),
        ParentRef::Sha1(sha1) => format!("sha1-{sha1}"),
    }
}

fn signature_for(
    desc: &ChangeDesc,
    describe: &TaggedDict,
) -> ((String, String, i64), (String, String, i64)) {
    let fallback = || {
        let user = describe.get("user").unwrap_or("git-fusion-user").to_string();
        let time = describe
            .get("time")
            .and_then(|time| time.parse().ok())
            .unwrap_or(0);
        (user.clone(), format!("{user}@depot"), time)
    };
    let author = desc
        .author
        .as_deref()
        .and_then(parse_signature)
        .unwrap_or_else(fallback);
    let committer = desc
        .committer
        .as_deref()
        .and_then(parse_signature)
        .unwrap_or_else(|| author.clone());
    (author, committer)
}

/// Parse `Name <email> epoch` as written by the description codec.
fn parse_signature(text: &str) -> Option<(String, String, i64)> {
    let open = text.find('<')?;
    let close = text.find('>')?;
    let name = text[..open].trim().to_string();
    let email = text[open + 1..close].to_string();
    let epoch = text[close + 1..]
        .split_whitespace()
        .next()
        .and_then(|epoch| epoch.parse().ok())
        .unwrap_or(0);
    Some((name, email, epoch))
}

fn commit_message(desc: &ChangeDesc, change_num: u64) -> String {
    if desc.sha1.is_some() {
        // Round trip of a Fusion-written changelist: the original commit
        // message, exactly.
        desc.message.clone()
    } else {
        format!("{}\n\nCopied from depot change {change_num}.", desc.message)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{test_context_with_git, InMemoryDepot, ScratchGitRepo};

    use super::*;

    #[test]
    fn test_parse_signature() {
        let (name, email, epoch) =
            parse_signature("Alice Liddell <alice@example.com> 1400000000").unwrap();
        assert_eq!(name, "Alice Liddell");
        assert_eq!(email, "alice@example.com");
        assert_eq!(epoch, 1400000000);
    }

    #[test]
    fn test_described_file_modes() {
        let file = DescribedFile {
            depot_path: "//depot/main/link".to_string(),
            rev: 1,
            action: "add".to_string(),
            filetype: "symlink".to_string(),
        };
        assert_eq!(file.git_mode(), GitFileMode::Symlink);
        let file = DescribedFile {
            filetype: "xtext".to_string(),
            action: "edit".to_string(),
            ..file
        };
        // Plain "xtext" has no +x modifier; stays a blob.
        assert_eq!(file.git_mode(), GitFileMode::Blob);
        let file = DescribedFile {
            filetype: "text+x".to_string(),
            ..file
        };
        assert_eq!(file.git_mode(), GitFileMode::BlobExecutable);
    }

    #[test]
    fn test_symlink_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SymlinkRevStore::new(dir.path().to_path_buf());
        let sha1: Sha1 = "ab".repeat(20).parse().unwrap();
        store.put("//depot/main/a@b.txt", 3, sha1).unwrap();
        assert_eq!(store.get("//depot/main/a@b.txt", 3).unwrap(), Some(sha1));
        assert_eq!(store.get("//depot/main/other.txt", 1).unwrap(), None);
    }

    #[test]
    fn test_discover_changes_skips_ghosts_and_old() {
        let scratch = ScratchGitRepo::new();
        let depot = InMemoryDepot::new();
        let ctx = test_context_with_git(&depot, "repoA", &scratch);

        depot.submit_change(
            "alice",
            &[("//depot/main/f", b"x".to_vec())],
            "first change",
        );
        let ghost_desc = {
            let mut desc = ChangeDesc::default();
            desc.ghost.precedes_sha1 = Some("ab".repeat(20).parse().unwrap());
            desc.render()
        };
        depot.submit_change(
            "git-fusion-user",
            &[("//depot/main/g", b"y".to_vec())],
            &ghost_desc,
        );
        depot.submit_change("bob", &[("//depot/main/h", b"z".to_vec())], "third change");

        let p2g = P2G::new(&ctx);
        let work = p2g.discover_changes(None).unwrap();
        let descriptions: Vec<&str> = work
            .values()
            .map(|item| item.description.as_str())
            .collect();
        assert_eq!(descriptions.len(), 2);
        assert!(descriptions[0].contains("first change"));
        assert!(descriptions[1].contains("third change"));
    }
}
