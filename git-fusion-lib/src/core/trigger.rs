//! Depot-side submit trigger protocol.
//!
//! Non-Fusion submits are coordinated with in-flight pushes through the
//! same counters and interest lists the lock layer uses: before content is
//! accepted, the submitting changelist's files are registered on the
//! non-Fusion interest account and checked against every Fusion server's
//! interest list; on commit or failure the registration is removed. The
//! hooks run on the depot host, far from any Fusion instance, so every
//! step speaks only depot state.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::depot::{counter, spec, Connection, DepotError};

use super::lock::{
    add_interest_block, heartbeat_is_fresh, interest_intersects, read_interest,
    remove_interest_block,
};

/// Protocol version advertised through the version counters. Fusion
/// refuses to operate when the installed triggers advertise anything
/// else.
pub const TRIGGER_VERSION: &str = "2";

/// Counter serializing edits to the non-Fusion interest list.
pub const NON_GF_REVIEWS_LOCK: &str = "git-fusion-non-gf-reviews-lock";

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(
        "Files in this changelist are locked by Git Fusion server {server}. \
         Please retry after the Git Fusion push completes."
    )]
    LockedByFusion { server: String },

    #[error("could not acquire the non-Fusion interest lock")]
    InterestLockBusy,

    #[error("trigger version counter {counter} is {found:?}, expected {expected:?}")]
    VersionMismatch {
        counter: String,
        found: String,
        expected: String,
    },

    #[error(transparent)]
    Depot(#[from] DepotError),
}

/// Result type for trigger operations.
pub type Result<T> = std::result::Result<T, TriggerError>;

/// Write both version counters. Run at trigger installation time.
#[instrument(skip(conn))]
pub fn advertise_version(conn: &dyn Connection) -> Result<()> {
    counter::set(conn, counter::PRE_SUBMIT_TRIGGER_VERSION, TRIGGER_VERSION)?;
    counter::set(conn, counter::POST_SUBMIT_TRIGGER_VERSION, TRIGGER_VERSION)?;
    Ok(())
}

/// Verify both version counters. Fusion calls this before operating;
/// missing or stale triggers are a hard refusal.
#[instrument(skip(conn))]
pub fn check_version(conn: &dyn Connection) -> Result<()> {
    for name in [
        counter::PRE_SUBMIT_TRIGGER_VERSION,
        counter::POST_SUBMIT_TRIGGER_VERSION,
    ] {
        let found = counter::get(conn, name)?.to_string();
        if found != TRIGGER_VERSION {
            return Err(TriggerError::VersionMismatch {
                counter: name.to_string(),
                found,
                expected: TRIGGER_VERSION.to_string(),
            });
        }
    }
    Ok(())
}

/// Timing knobs for the trigger side.
#[derive(Clone, Copy, Debug)]
pub struct TriggerConfig {
    /// Heartbeat age beyond which a Fusion holder is considered dead.
    pub stale_after: Duration,

    /// Attempts to acquire the non-Fusion interest lock.
    pub lock_attempts: u32,

    /// Back-off between attempts.
    pub lock_sleep: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig {
            stale_after: Duration::from_secs(60),
            lock_attempts: 20,
            lock_sleep: Duration::from_millis(500),
        }
    }
}

/// The files named by an in-flight changelist.
#[instrument(skip(conn))]
pub fn files_at_change(conn: &dyn Connection, change_num: u64) -> Result<Vec<String>> {
    let arg = format!("//...@={change_num}");
    let rows = conn.run_tagged("files", &["-e", &arg])?;
    let mut files = Vec::new();
    for row in rows {
        if let Some(depot_file) = row.get("depotFile") {
            files.push(depot_file.to_string());
        }
    }
    Ok(files)
}

fn acquire_interest_lock(conn: &dyn Connection, config: &TriggerConfig) -> Result<()> {
    for attempt in 0..config.lock_attempts {
        let value = counter::increment(conn, NON_GF_REVIEWS_LOCK)?;
        if value == 1 {
            return Ok(());
        }
        counter::set(conn, NON_GF_REVIEWS_LOCK, &(value - 1).to_string())?;
        if attempt + 1 < config.lock_attempts {
            std::thread::sleep(config.lock_sleep);
        }
    }
    Err(TriggerError::InterestLockBusy)
}

fn release_interest_lock(conn: &dyn Connection) -> Result<()> {
    counter::delete(conn, NON_GF_REVIEWS_LOCK)?;
    Ok(())
}

/// Every per-server Fusion reviews account currently present, with its
/// server id.
fn fusion_reviews_accounts(conn: &dyn Connection) -> Result<Vec<(String, String)>> {
    let rows = conn.run_tagged("users", &[])?;
    let mut accounts = Vec::new();
    for row in rows {
        let user = match row.get("User") {
            Some(user) => user,
            None => continue,
        };
        if user == spec::REVIEWS_ALL_GF || user == spec::REVIEWS_NON_GF {
            continue;
        }
        if let Some(server_id) = user.strip_prefix("git-fusion-reviews-") {
            accounts.push((user.to_string(), server_id.to_string()));
        }
    }
    Ok(accounts)
}

/// Whether any Fusion view-lock heartbeat anywhere on the depot is fresh.
fn any_fresh_heartbeat(
    conn: &dyn Connection,
    config: &TriggerConfig,
    now_epoch: i64,
) -> Result<bool> {
    let rows = conn.run_tagged(
        "counters",
        &["-u", "-e", "git-fusion-view-*-lock-heartbeat"],
    )?;
    for row in rows {
        let name = match row.get("counter") {
            Some(name) => name,
            None => continue,
        };
        let repo = name
            .strip_prefix("git-fusion-view-")
            .and_then(|rest| rest.strip_suffix("-lock-heartbeat"));
        if let Some(repo) = repo {
            if heartbeat_is_fresh(conn, repo, config.stale_after, now_epoch)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// `change-content`: register the submitting changelist's files on the
/// non-Fusion interest list, then fail the submit if a live Fusion
/// instance holds overlapping interest.
#[instrument(skip(conn))]
pub fn on_change_content(
    conn: &dyn Connection,
    change_num: u64,
    config: &TriggerConfig,
    now_epoch: i64,
) -> Result<()> {
    let files = files_at_change(conn, change_num)?;
    counter::set(
        conn,
        &counter::non_gf_submit_name(change_num),
        "change-content",
    )?;

    acquire_interest_lock(conn, config)?;
    let registered = add_interest_block(
        conn,
        spec::REVIEWS_NON_GF,
        &change_num.to_string(),
        &files,
    );
    if let Err(err) = registered {
        let _ = release_interest_lock(conn);
        return Err(err.into());
    }

    let verdict = check_fusion_overlap(conn, config, now_epoch, &files);
    match verdict {
        Ok(None) => {
            release_interest_lock(conn)?;
            debug!(change_num, "non-Fusion submit clears Fusion interest");
            Ok(())
        }
        Ok(Some(server)) => {
            // Roll back our registration before failing the submit.
            if let Err(err) =
                remove_interest_block(conn, spec::REVIEWS_NON_GF, &change_num.to_string())
            {
                warn!(?err, "could not remove interest block after conflict");
            }
            let _ = counter::delete(conn, &counter::non_gf_submit_name(change_num));
            release_interest_lock(conn)?;
            Err(TriggerError::LockedByFusion { server })
        }
        Err(err) => {
            let _ = release_interest_lock(conn);
            Err(err)
        }
    }
}

fn check_fusion_overlap(
    conn: &dyn Connection,
    config: &TriggerConfig,
    now_epoch: i64,
    files: &[String],
) -> Result<Option<String>> {
    if !any_fresh_heartbeat(conn, config, now_epoch)? {
        return Ok(None);
    }
    for (account, server_id) in fusion_reviews_accounts(conn)? {
        let interest = read_interest(conn, &account)?;
        if interest_intersects(&interest, files.iter().map(String::as_str)) {
            return Ok(Some(server_id));
        }
    }
    Ok(None)
}

/// `change-commit` / `change-failed`: remove exactly this changelist's
/// interest entries and its state counter. The sequence BEGIN-C … END-C
/// followed by this removal leaves the interest list byte-identical to
/// its pre-BEGIN state.
#[instrument(skip(conn))]
pub fn on_change_finished(
    conn: &dyn Connection,
    change_num: u64,
    config: &TriggerConfig,
) -> Result<()> {
    acquire_interest_lock(conn, config)?;
    let removed = remove_interest_block(conn, spec::REVIEWS_NON_GF, &change_num.to_string());
    let release = release_interest_lock(conn);
    removed?;
    release?;
    counter::delete(conn, &counter::non_gf_submit_name(change_num))?;
    Ok(())
}

/// `change-commit` for files matching the repo-config path pattern:
/// append the new repo's view lines to the all-Fusion interest list.
#[instrument(skip(conn))]
pub fn on_repo_config_commit(
    conn: &dyn Connection,
    depot: &str,
    change_num: u64,
) -> Result<()> {
    let files = files_at_change(conn, change_num)?;
    let config_prefix = format!("//{depot}/repos/");
    let mut new_views = Vec::new();
    for depot_file in files {
        let is_config = depot_file.starts_with(&config_prefix)
            && depot_file.ends_with("/p4gf_config");
        if !is_config {
            continue;
        }
        let text = match print_one(conn, &depot_file)? {
            Some(text) => text,
            None => continue,
        };
        let parsed = match super::config::RepoConfig::parse(&text) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(?err, %depot_file, "unparseable repo config in commit trigger");
                continue;
            }
        };
        let dict = match super::branch::dict_from_config(&parsed) {
            Ok(dict) => dict,
            Err(err) => {
                warn!(?err, %depot_file, "bad view lines in repo config");
                continue;
            }
        };
        for branch in dict.values() {
            new_views.extend(branch.included_lhs_patterns());
        }
    }
    if new_views.is_empty() {
        return Ok(());
    }
    add_interest_block(
        conn,
        spec::REVIEWS_ALL_GF,
        &format!("config-{change_num}"),
        &new_views,
    )?;
    Ok(())
}

fn print_one(conn: &dyn Connection, depot_path: &str) -> Result<Option<String>> {
    struct Grab {
        text: Option<String>,
    }
    impl crate::depot::PrintSink for Grab {
        fn file(
            &mut self,
            _depot_path: &str,
            _rev: u64,
            content: &[u8],
        ) -> crate::depot::DepotResult<()> {
            self.text = Some(String::from_utf8_lossy(content).into_owned());
            Ok(())
        }
    }
    let mut sink = Grab { text: None };
    conn.print(&[depot_path.to_string()], &mut sink)?;
    Ok(sink.text)
}

#[cfg(test)]
mod tests {
    use crate::core::lock;
    use crate::testing::InMemoryDepot;

    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn config() -> TriggerConfig {
        TriggerConfig {
            stale_after: Duration::from_secs(60),
            lock_attempts: 2,
            lock_sleep: Duration::from_millis(1),
        }
    }

    fn depot_with_fusion_holder() -> InMemoryDepot {
        let depot = InMemoryDepot::new();
        depot.create_user(&spec::reviews_user_name("gf-east"));
        depot.create_user(spec::REVIEWS_NON_GF);
        depot.create_user(spec::REVIEWS_ALL_GF);
        let conn = depot.connect("git-fusion-user");
        lock::add_interest_block(
            &conn,
            &spec::reviews_user_name("gf-east"),
            "push-1",
            &["//depot/foo/...".to_string()],
        )
        .unwrap();
        counter::set(
            &conn,
            &counter::view_lock_heartbeat_name("repoA"),
            &(NOW - 5).to_string(),
        )
        .unwrap();
        depot
    }

    #[test]
    fn test_version_round_trip() {
        let depot = InMemoryDepot::new();
        let conn = depot.connect("git-fusion-user");
        assert!(check_version(&conn).is_err());
        advertise_version(&conn).unwrap();
        check_version(&conn).unwrap();
    }

    #[test]
    fn test_overlapping_submit_rejected() {
        let depot = depot_with_fusion_holder();
        let conn = depot.connect("builder");
        let change = depot.create_pending_change(&conn, &["//depot/foo/bar"]);
        let err = on_change_content(&conn, change, &config(), NOW).unwrap_err();
        match err {
            TriggerError::LockedByFusion { server } => assert_eq!(server, "gf-east"),
            other => panic!("unexpected error: {other:?}"),
        }
        // Rejection rolled back the interest registration.
        let interest = read_interest(&conn, spec::REVIEWS_NON_GF).unwrap();
        assert!(interest.is_empty());
    }

    #[test]
    fn test_non_overlapping_submit_allowed() {
        let depot = depot_with_fusion_holder();
        let conn = depot.connect("builder");
        let change = depot.create_pending_change(&conn, &["//depot/unrelated/baz"]);
        on_change_content(&conn, change, &config(), NOW).unwrap();
        // Interest stays registered until commit/fail.
        let interest = read_interest(&conn, spec::REVIEWS_NON_GF).unwrap();
        assert!(!interest.is_empty());

        on_change_finished(&conn, change, &config()).unwrap();
        let interest = read_interest(&conn, spec::REVIEWS_NON_GF).unwrap();
        assert!(interest.is_empty());
        assert!(
            !counter::exists(&conn, &counter::non_gf_submit_name(change)).unwrap()
        );
    }

    #[test]
    fn test_stale_heartbeat_does_not_block() {
        let depot = depot_with_fusion_holder();
        let conn = depot.connect("builder");
        counter::set(
            &conn,
            &counter::view_lock_heartbeat_name("repoA"),
            &(NOW - 3600).to_string(),
        )
        .unwrap();
        let change = depot.create_pending_change(&conn, &["//depot/foo/bar"]);
        on_change_content(&conn, change, &config(), NOW).unwrap();
    }

    #[test]
    fn test_repo_config_commit_extends_union_interest() {
        let depot = InMemoryDepot::new();
        depot.create_user(spec::REVIEWS_ALL_GF);
        let conn = depot.connect("git-fusion-user");
        let config_text = "[master]\ngit-branch-name = master\nview = //depot/newrepo/... ...\n";
        let change = depot.submit_change(
            "admin",
            &[(
                "//.git-fusion/repos/newrepo/p4gf_config",
                config_text.as_bytes().to_vec(),
            )],
            "add repo config",
        );
        on_repo_config_commit(&conn, ".git-fusion", change).unwrap();
        let interest = read_interest(&conn, spec::REVIEWS_ALL_GF).unwrap();
        assert!(interest_intersects(&interest, vec!["//depot/newrepo/file"]));
    }
}
