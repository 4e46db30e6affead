//! Depot counters: named integers-or-strings with an atomic increment,
//! used for locks, heartbeats, high-water marks, and trigger versioning.

use tracing::instrument;

use super::client::{run_tagged_one, Connection, Error, Result};

/// The value of a counter. A counter which has never been set reads as `0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CounterValue {
    /// A numeric counter value.
    Int(u64),

    /// A non-numeric counter value (e.g. a trigger version string).
    Text(String),
}

impl CounterValue {
    /// The numeric value, or `None` for text counters.
    pub fn as_int(&self) -> Option<u64> {
        match self {
            CounterValue::Int(value) => Some(*value),
            CounterValue::Text(_) => None,
        }
    }
}

impl std::fmt::Display for CounterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterValue::Int(value) => write!(f, "{value}"),
            CounterValue::Text(value) => write!(f, "{value}"),
        }
    }
}

fn parse_value(raw: &str) -> CounterValue {
    match raw.parse::<u64>() {
        Ok(value) => CounterValue::Int(value),
        Err(_) => CounterValue::Text(raw.to_string()),
    }
}

/// Read a counter. An unset counter reads as `Int(0)`.
#[instrument(skip(conn))]
pub fn get(conn: &dyn Connection, name: &str) -> Result<CounterValue> {
    match run_tagged_one(conn, "counter", &["-u", name])? {
        Some(row) => Ok(parse_value(row.expect("counter", "value")?)),
        None => Ok(CounterValue::Int(0)),
    }
}

/// Set a counter to an arbitrary value.
#[instrument(skip(conn))]
pub fn set(conn: &dyn Connection, name: &str, value: &str) -> Result<()> {
    conn.run_tagged("counter", &["-u", name, value])?;
    Ok(())
}

/// Atomically increment a counter and return the post-increment value. The
/// observer of `1` is the party that transitioned the counter from unset.
#[instrument(skip(conn))]
pub fn increment(conn: &dyn Connection, name: &str) -> Result<u64> {
    let row = run_tagged_one(conn, "counter", &["-u", "-i", name])?.ok_or_else(|| {
        Error::CommandFailed {
            command: format!("counter -u -i {name}"),
            message: "no output from increment".to_string(),
        }
    })?;
    let value = row.expect("counter", "value")?;
    value.parse().map_err(|_| Error::ParseInt {
        field: "value".to_string(),
        value: value.to_string(),
    })
}

/// Delete a counter. Deleting an unset counter is a no-op.
#[instrument(skip(conn))]
pub fn delete(conn: &dyn Connection, name: &str) -> Result<()> {
    conn.run_tagged("counter", &["-u", "-d", name])?;
    Ok(())
}

/// Determine whether a counter is currently set.
#[instrument(skip(conn))]
pub fn exists(conn: &dyn Connection, name: &str) -> Result<bool> {
    Ok(get(conn, name)? != CounterValue::Int(0))
}

/// Per-repo view lock counter name.
pub fn view_lock_name(repo: &str) -> String {
    format!("git-fusion-view-{repo}-lock")
}

/// Heartbeat counter accompanying the view lock.
pub fn view_lock_heartbeat_name(repo: &str) -> String {
    format!("git-fusion-view-{repo}-lock-heartbeat")
}

/// High-water mark of changelists already copied to Git for one repo on one
/// server.
pub fn last_copied_change_name(repo: &str, server_id: &str) -> String {
    format!("git-fusion-last-copied-change-{repo}-{server_id}")
}

/// Version counter advertised by the pre-submit trigger.
pub const PRE_SUBMIT_TRIGGER_VERSION: &str = "git-fusion-pre-submit-trigger-version";

/// Version counter advertised by the post-submit trigger.
pub const POST_SUBMIT_TRIGGER_VERSION: &str = "git-fusion-post-submit-trigger-version";

/// Per-change state counter for a non-Fusion submit in progress.
pub fn non_gf_submit_name(change_num: u64) -> String {
    format!("git-fusion-non-gf-submit-{change_num}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_names() {
        assert_eq!(view_lock_name("repoA"), "git-fusion-view-repoA-lock");
        assert_eq!(
            view_lock_heartbeat_name("repoA"),
            "git-fusion-view-repoA-lock-heartbeat"
        );
        assert_eq!(
            last_copied_change_name("repoA", "gf-east"),
            "git-fusion-last-copied-change-repoA-gf-east"
        );
        assert_eq!(non_gf_submit_name(42), "git-fusion-non-gf-submit-42");
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("17"), CounterValue::Int(17));
        assert_eq!(
            parse_value("2016.1"),
            CounterValue::Text("2016.1".to_string())
        );
    }
}
