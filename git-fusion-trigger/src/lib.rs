//! Entry points for the depot-side submit triggers.
//!
//! The depot server invokes these hooks around every non-Fusion submit:
//! `change-content` before content is accepted, then `change-commit` or
//! `change-failed`. The protocol itself lives in
//! [`lib::core::trigger`]; this crate parses the trigger command line and
//! dispatches. Installing the trigger table entries on the depot server is
//! an administrative step outside this crate.

#![warn(missing_docs)]
#![warn(
    clippy::all,
    clippy::as_conversions,
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro
)]

use eyre::{bail, eyre};
use lib::core::trigger::{
    advertise_version, on_change_content, on_change_finished, on_repo_config_commit,
    TriggerConfig, TriggerError,
};
use lib::depot::Connection;
use tracing::instrument;

/// One parsed trigger invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerRequest {
    /// `change-content %change%`
    ChangeContent {
        /// The submitting changelist.
        change_num: u64,
    },

    /// `change-commit %change%`
    ChangeCommit {
        /// The submitted changelist.
        change_num: u64,
    },

    /// `change-failed %change%`
    ChangeFailed {
        /// The abandoned changelist.
        change_num: u64,
    },

    /// `install`: write the version counters.
    Install,
}

impl TriggerRequest {
    /// Parse a trigger argv (not counting the program name).
    pub fn parse(args: &[String]) -> eyre::Result<Self> {
        let mut iter = args.iter();
        let verb = iter
            .next()
            .ok_or_else(|| eyre!("usage: git-fusion-trigger <verb> [change-num]"))?;
        let change_num = || -> eyre::Result<u64> {
            let raw = iter
                .clone()
                .next()
                .ok_or_else(|| eyre!("trigger verb {verb} requires a changelist number"))?;
            raw.parse()
                .map_err(|_| eyre!("bad changelist number: {raw:?}"))
        };
        match verb.as_str() {
            "change-content" => Ok(TriggerRequest::ChangeContent {
                change_num: change_num()?,
            }),
            "change-commit" => Ok(TriggerRequest::ChangeCommit {
                change_num: change_num()?,
            }),
            "change-failed" => Ok(TriggerRequest::ChangeFailed {
                change_num: change_num()?,
            }),
            "install" => Ok(TriggerRequest::Install),
            other => bail!("unknown trigger verb: {other:?}"),
        }
    }
}

/// Dispatch one trigger invocation over an established depot connection.
///
/// Returns `Ok(())` when the submit may proceed. A
/// [`TriggerError::LockedByFusion`] failure message is what the submitting
/// user sees.
#[instrument(skip(conn))]
pub fn dispatch(
    conn: &dyn Connection,
    depot: &str,
    request: &TriggerRequest,
    config: &TriggerConfig,
    now_epoch: i64,
) -> Result<(), TriggerError> {
    match request {
        TriggerRequest::ChangeContent { change_num } => {
            on_change_content(conn, *change_num, config, now_epoch)
        }
        TriggerRequest::ChangeCommit { change_num } => {
            on_change_finished(conn, *change_num, config)?;
            on_repo_config_commit(conn, depot, *change_num)
        }
        TriggerRequest::ChangeFailed { change_num } => {
            on_change_finished(conn, *change_num, config)
        }
        TriggerRequest::Install => advertise_version(conn),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            TriggerRequest::parse(&args(&["change-content", "42"])).unwrap(),
            TriggerRequest::ChangeContent { change_num: 42 }
        );
        assert_eq!(
            TriggerRequest::parse(&args(&["change-failed", "7"])).unwrap(),
            TriggerRequest::ChangeFailed { change_num: 7 }
        );
        assert_eq!(
            TriggerRequest::parse(&args(&["install"])).unwrap(),
            TriggerRequest::Install
        );
        assert!(TriggerRequest::parse(&args(&["change-content"])).is_err());
        assert!(TriggerRequest::parse(&args(&["frobnicate", "1"])).is_err());
        assert!(TriggerRequest::parse(&args(&[])).is_err());
    }
}
