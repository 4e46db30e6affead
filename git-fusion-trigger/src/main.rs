//! Binary entry point for the depot-side submit triggers.
//!
//! The depot server's trigger table invokes this with a verb and a
//! changelist number, e.g.:
//!
//! ```text
//! git-fusion-content change-content //... "git-fusion-trigger change-content %change%"
//! ```
//!
//! The connection shells out to the CLI client on the depot host, using
//! `P4PORT`/`P4USER` (defaulting to the standard service account) and
//! `GF_DEPOT` for the Fusion-dedicated depot name.

use std::path::PathBuf;

use git_fusion_trigger::{dispatch, TriggerRequest};
use lib::core::trigger::{TriggerConfig, TriggerError};
use lib::depot::CliConnection;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let request = match TriggerRequest::parse(&args) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("git-fusion-trigger: {err}");
            std::process::exit(2);
        }
    };

    let path_to_p4 = std::env::var_os("P4BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("p4"));
    let port = std::env::var("P4PORT").unwrap_or_else(|_| "perforce:1666".to_string());
    let user = std::env::var("P4USER").unwrap_or_else(|_| "git-fusion-user".to_string());
    let depot = std::env::var("GF_DEPOT").unwrap_or_else(|_| ".git-fusion".to_string());
    let conn = CliConnection::new(path_to_p4, &port, &user);

    let now_epoch = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    match dispatch(&conn, &depot, &request, &TriggerConfig::default(), now_epoch) {
        Ok(()) => {}
        Err(err @ TriggerError::LockedByFusion { .. }) => {
            // The depot shows this message to the submitting user.
            println!("{err}");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("git-fusion-trigger: {err}");
            std::process::exit(1);
        }
    }
}
