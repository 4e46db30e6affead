//! The atomic-push lock: cross-instance, cross-host coordination using
//! only depot counters and "reviews" interest lists on service accounts.
//!
//! Two kinds of entries cooperate. The per-repo counter serializes Fusion
//! instances: acquire by atomic increment-and-test, where the caller who
//! observes the value become `1` holds the lock. Interest lists let the
//! depot-side triggers detect overlap with non-Fusion submits without a
//! central coordinator: each server's reviews account carries the depot
//! path patterns it is currently mutating, bracketed by marker entries so
//! a failed operation can remove exactly its own block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::depot::{counter, spec::UserSpec, Connection, DepotResult};

use super::error::{CoreError, Result};
use super::view_map::pattern_matches;

/// How lock acquisition polls and how heartbeats age out.
#[derive(Clone, Copy, Debug)]
pub struct LockConfig {
    /// Attempts before giving up on the per-repo counter.
    pub max_attempts: u32,

    /// Fixed back-off between acquisition attempts.
    pub retry_sleep: Duration,

    /// How often the holder rewrites the heartbeat counter.
    pub heartbeat_interval: Duration,

    /// Age after which other participants treat the lock as stale and
    /// revocable.
    pub stale_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            max_attempts: 100,
            retry_sleep: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Marker entry opening an interest block.
pub fn begin_marker(tag: &str) -> String {
    format!("//git-fusion-marker/BEGIN-{tag}")
}

/// Marker entry closing an interest block.
pub fn end_marker(tag: &str) -> String {
    format!("//git-fusion-marker/END-{tag}")
}

/// Append an interest block to `account`'s reviews field: `BEGIN` marker,
/// the path patterns, `END` marker.
#[instrument(skip(conn, paths))]
pub fn add_interest_block(
    conn: &dyn Connection,
    account: &str,
    tag: &str,
    paths: &[String],
) -> DepotResult<()> {
    let mut user = match UserSpec::fetch(conn, account)? {
        Some(user) => user,
        None => return Ok(()),
    };
    user.reviews.push(begin_marker(tag));
    user.reviews.extend(paths.iter().cloned());
    user.reviews.push(end_marker(tag));
    user.save(conn)
}

/// Remove exactly the block bracketed by `tag`'s markers, leaving every
/// other entry byte-identical.
#[instrument(skip(conn))]
pub fn remove_interest_block(conn: &dyn Connection, account: &str, tag: &str) -> DepotResult<()> {
    let mut user = match UserSpec::fetch(conn, account)? {
        Some(user) => user,
        None => return Ok(()),
    };
    let begin = begin_marker(tag);
    let end = end_marker(tag);
    let mut kept = Vec::with_capacity(user.reviews.len());
    let mut in_block = false;
    for entry in user.reviews.drain(..) {
        if entry == begin {
            in_block = true;
            continue;
        }
        if entry == end {
            in_block = false;
            continue;
        }
        if !in_block {
            kept.push(entry);
        }
    }
    user.reviews = kept;
    user.save(conn)
}

/// The path patterns of `account`'s reviews field, marker entries
/// excluded.
#[instrument(skip(conn))]
pub fn read_interest(conn: &dyn Connection, account: &str) -> DepotResult<Vec<String>> {
    let user = match UserSpec::fetch(conn, account)? {
        Some(user) => user,
        None => return Ok(Vec::new()),
    };
    Ok(user
        .reviews
        .into_iter()
        .filter(|entry| !entry.starts_with("//git-fusion-marker/"))
        .collect())
}

/// Whether any interest pattern covers any of the given depot paths.
pub fn interest_intersects<'a>(
    patterns: &[String],
    depot_paths: impl IntoIterator<Item = &'a str>,
) -> bool {
    let paths: Vec<&str> = depot_paths.into_iter().collect();
    patterns
        .iter()
        .any(|pattern| paths.iter().any(|path| pattern_matches(pattern, path)))
}

/// Read the heartbeat counter and decide whether the holder looks alive.
#[instrument(skip(conn))]
pub fn heartbeat_is_fresh(
    conn: &dyn Connection,
    repo: &str,
    stale_after: Duration,
    now_epoch: i64,
) -> DepotResult<bool> {
    let name = counter::view_lock_heartbeat_name(repo);
    match counter::get(conn, &name)? {
        counter::CounterValue::Int(0) => Ok(false),
        counter::CounterValue::Int(epoch) => {
            let age = now_epoch.saturating_sub(i64::try_from(epoch).unwrap_or(i64::MAX));
            Ok(age >= 0 && Duration::from_secs(u64::try_from(age).unwrap_or(u64::MAX)) < stale_after)
        }
        counter::CounterValue::Text(_) => Ok(false),
    }
}

/// Background heartbeat: rewrites the heartbeat counter on an interval
/// while verifying the lock counter still exists. When the counter
/// disappears (cancellation by a third party), the `canceled` flag latches
/// and the owning operation raises [`CoreError::LockCanceled`] at its next
/// suspension point.
#[derive(Debug)]
pub struct Heartbeat {
    canceled: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Start the heartbeat thread on its own connection.
    pub fn spawn(
        conn: Box<dyn Connection + Send>,
        repo: &str,
        config: LockConfig,
    ) -> Heartbeat {
        let canceled = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_canceled = Arc::clone(&canceled);
        let thread_stop = Arc::clone(&stop);
        let lock_name = counter::view_lock_name(repo);
        let heartbeat_name = counter::view_lock_heartbeat_name(repo);
        let thread = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::SeqCst) {
                match counter::get(conn.as_ref(), &lock_name) {
                    Ok(counter::CounterValue::Int(value)) if value >= 1 => {
                        let epoch = chrono::Utc::now().timestamp();
                        if let Err(err) =
                            counter::set(conn.as_ref(), &heartbeat_name, &epoch.to_string())
                        {
                            warn!(?err, "could not write heartbeat");
                        }
                    }
                    Ok(_) => {
                        thread_canceled.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(err) => {
                        warn!(?err, "heartbeat could not read lock counter");
                    }
                }
                std::thread::sleep(config.heartbeat_interval);
            }
        });
        Heartbeat {
            canceled,
            stop,
            thread: Some(thread),
        }
    }

    /// A heartbeat that never beats, for operations running without a
    /// background thread (the owner then calls [`Heartbeat::beat_once`]
    /// at suspension points).
    pub fn manual() -> Heartbeat {
        Heartbeat {
            canceled: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// One manual beat: verify the lock counter, write the epoch.
    #[instrument(skip(self, conn))]
    pub fn beat_once(&self, conn: &dyn Connection, repo: &str) -> Result<()> {
        let lock_name = counter::view_lock_name(repo);
        match counter::get(conn, &lock_name).map_err(CoreError::Depot)? {
            counter::CounterValue::Int(value) if value >= 1 => {
                let epoch = chrono::Utc::now().timestamp();
                counter::set(
                    conn,
                    &counter::view_lock_heartbeat_name(repo),
                    &epoch.to_string(),
                )
                .map_err(CoreError::Depot)?;
                Ok(())
            }
            _ => {
                self.canceled.store(true, Ordering::SeqCst);
                Err(CoreError::LockCanceled)
            }
        }
    }

    /// Raise if a third party cleared the lock counter.
    pub fn check(&self) -> Result<()> {
        if self.canceled.load(Ordering::SeqCst) {
            Err(CoreError::LockCanceled)
        } else {
            Ok(())
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Exclusive ownership of one repo's view lock.
///
/// Releasing deletes the heartbeat and lock counters and removes any
/// interest blocks registered through the handle. Dropping without
/// [`ViewLock::release`] performs the same cleanup best-effort.
#[derive(Debug)]
pub struct ViewLock<'conn> {
    conn: &'conn dyn Connection,
    repo: String,
    interest_tags: Vec<(String, String)>,
    released: bool,
}

impl<'conn> ViewLock<'conn> {
    /// Acquire the per-repo view lock, polling with fixed back-off.
    #[instrument(skip(conn))]
    pub fn acquire(
        conn: &'conn dyn Connection,
        repo: &str,
        config: &LockConfig,
    ) -> Result<Self> {
        let name = counter::view_lock_name(repo);
        for attempt in 0..config.max_attempts {
            let value = counter::increment(conn, &name).map_err(CoreError::Depot)?;
            if value == 1 {
                let epoch = chrono::Utc::now().timestamp();
                counter::set(
                    conn,
                    &counter::view_lock_heartbeat_name(repo),
                    &epoch.to_string(),
                )
                .map_err(CoreError::Depot)?;
                return Ok(ViewLock {
                    conn,
                    repo: repo.to_string(),
                    interest_tags: Vec::new(),
                    released: false,
                });
            }
            // Back off: undo our increment so the holder's release leaves
            // the counter unset rather than stuck above zero.
            counter::set(conn, &name, &(value - 1).to_string()).map_err(CoreError::Depot)?;
            if attempt + 1 < config.max_attempts {
                std::thread::sleep(config.retry_sleep);
            }
        }
        Err(CoreError::Conflict {
            holder: format!("holder of {name}"),
        })
    }

    /// The repo this lock covers.
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Register an interest block on `account` and remember it for
    /// removal at release time.
    #[instrument(skip(self, paths))]
    pub fn register_interest(
        &mut self,
        account: &str,
        tag: &str,
        paths: &[String],
    ) -> Result<()> {
        add_interest_block(self.conn, account, tag, paths).map_err(CoreError::Depot)?;
        self.interest_tags
            .push((account.to_string(), tag.to_string()));
        Ok(())
    }

    /// Release the lock: interest blocks removed, heartbeat and lock
    /// counters deleted.
    #[instrument(skip(self))]
    pub fn release(mut self) -> Result<()> {
        self.release_inner().map_err(CoreError::Depot)?;
        self.released = true;
        Ok(())
    }

    fn release_inner(&mut self) -> DepotResult<()> {
        for (account, tag) in std::mem::take(&mut self.interest_tags) {
            remove_interest_block(self.conn, &account, &tag)?;
        }
        counter::delete(self.conn, &counter::view_lock_heartbeat_name(&self.repo))?;
        counter::delete(self.conn, &counter::view_lock_name(&self.repo))?;
        Ok(())
    }
}

impl Drop for ViewLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.release_inner() {
            warn!(repo = %self.repo, ?err, "could not release view lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::depot::spec::reviews_user_name;
    use crate::testing::InMemoryDepot;

    use super::*;

    fn fast_config() -> LockConfig {
        LockConfig {
            max_attempts: 2,
            retry_sleep: Duration::from_millis(1),
            heartbeat_interval: Duration::from_millis(5),
            stale_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_acquire_release() {
        let depot = InMemoryDepot::new();
        let conn = depot.connect("git-fusion-user");
        let lock = ViewLock::acquire(&conn, "repoA", &fast_config()).unwrap();
        assert_eq!(
            counter::get(&conn, &counter::view_lock_name("repoA"))
                .unwrap()
                .as_int(),
            Some(1)
        );
        lock.release().unwrap();
        assert_eq!(
            counter::get(&conn, &counter::view_lock_name("repoA"))
                .unwrap()
                .as_int(),
            Some(0)
        );
    }

    #[test]
    fn test_second_acquirer_backs_off() {
        let depot = InMemoryDepot::new();
        let conn = depot.connect("git-fusion-user");
        let _held = ViewLock::acquire(&conn, "repoA", &fast_config()).unwrap();
        let conn2 = depot.connect("git-fusion-user");
        let second = ViewLock::acquire(&conn2, "repoA", &fast_config());
        assert!(matches!(second, Err(CoreError::Conflict { .. })));
        // The loser's back-off left the holder's count intact.
        assert_eq!(
            counter::get(&conn, &counter::view_lock_name("repoA"))
                .unwrap()
                .as_int(),
            Some(1)
        );
    }

    #[test]
    fn test_interest_block_round_trip() {
        let depot = InMemoryDepot::new();
        let account = reviews_user_name("server-1");
        depot.create_user(&account);
        let conn = depot.connect("git-fusion-user");

        let before = read_interest(&conn, &account).unwrap();
        add_interest_block(
            &conn,
            &account,
            "1234",
            &["//depot/foo/...".to_string(), "//depot/bar/a.txt".to_string()],
        )
        .unwrap();
        let during = read_interest(&conn, &account).unwrap();
        assert!(interest_intersects(&during, vec!["//depot/foo/x/y.txt"]));
        assert!(!interest_intersects(&during, vec!["//depot/other/z.txt"]));

        remove_interest_block(&conn, &account, "1234").unwrap();
        let after = read_interest(&conn, &account).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_remove_only_own_block() {
        let depot = InMemoryDepot::new();
        let account = reviews_user_name("server-1");
        depot.create_user(&account);
        let conn = depot.connect("git-fusion-user");
        add_interest_block(&conn, &account, "1", &["//depot/one/...".to_string()]).unwrap();
        add_interest_block(&conn, &account, "2", &["//depot/two/...".to_string()]).unwrap();
        remove_interest_block(&conn, &account, "1").unwrap();
        let remaining = read_interest(&conn, &account).unwrap();
        assert!(interest_intersects(&remaining, vec!["//depot/two/file"]));
        assert!(!interest_intersects(&remaining, vec!["//depot/one/file"]));
    }

    #[test]
    fn test_cancellation_observed() {
        let depot = InMemoryDepot::new();
        let conn = depot.connect("git-fusion-user");
        let _lock = ViewLock::acquire(&conn, "repoA", &fast_config()).unwrap();
        let heartbeat = Heartbeat::manual();
        heartbeat.beat_once(&conn, "repoA").unwrap();

        // A third party clears the counter; the next beat raises.
        counter::delete(&conn, &counter::view_lock_name("repoA")).unwrap();
        let err = heartbeat.beat_once(&conn, "repoA").unwrap_err();
        assert!(matches!(err, CoreError::LockCanceled));
        assert!(heartbeat.check().is_err());
    }

    #[test]
    fn test_heartbeat_freshness() {
        let depot = InMemoryDepot::new();
        let conn = depot.connect("git-fusion-user");
        let now = 1_700_000_000;
        counter::set(
            &conn,
            &counter::view_lock_heartbeat_name("repoA"),
            &(now - 10).to_string(),
        )
        .unwrap();
        assert!(heartbeat_is_fresh(&conn, "repoA", Duration::from_secs(60), now).unwrap());
        assert!(!heartbeat_is_fresh(&conn, "repoA", Duration::from_secs(5), now).unwrap());
        assert!(
            !heartbeat_is_fresh(&conn, "absent", Duration::from_secs(60), now).unwrap()
        );
    }
}
