//! Fetch-modify-save access to depot specs (users and client workspaces).
//!
//! Specs are fetched as tagged dictionaries with list fields under numbered
//! keys, edited in place, and saved back; a save of an unmodified fetch is
//! idempotent.

use std::path::PathBuf;

use tracing::instrument;

use super::client::{run_tagged_one, Connection, Result, TaggedDict};

/// Service account owning all Fusion-generated changelists.
pub const GF_USER: &str = "git-fusion-user";

/// Union of all Fusion-managed paths, across every server.
pub const REVIEWS_ALL_GF: &str = "git-fusion-reviews--all-gf";

/// Interest list for non-Fusion submits currently in progress.
pub const REVIEWS_NON_GF: &str = "git-fusion-reviews--non-gf";

/// Per-server interest list account name.
pub fn reviews_user_name(server_id: &str) -> String {
    format!("git-fusion-reviews-{server_id}")
}

/// A user spec. Only the fields the core reads or writes are surfaced; the
/// rest ride along in `raw` so that save round-trips unknown fields.
#[derive(Clone, Debug)]
pub struct UserSpec {
    /// The user name.
    pub user: String,

    /// The `Reviews` field: depot path patterns this user is subscribed to.
    pub reviews: Vec<String>,

    raw: TaggedDict,
}

impl UserSpec {
    /// Fetch a user spec, or `None` if the user does not exist.
    #[instrument(skip(conn))]
    pub fn fetch(conn: &dyn Connection, user: &str) -> Result<Option<Self>> {
        let row = match run_tagged_one(conn, "user", &["-o", user])? {
            Some(row) => row,
            None => return Ok(None),
        };
        let user = row.expect("user", "User")?.to_string();
        let reviews = row.get_numbered("Reviews");
        Ok(Some(UserSpec {
            user,
            reviews,
            raw: row,
        }))
    }

    /// Save this spec back to the depot.
    #[instrument(skip(conn))]
    pub fn save(&self, conn: &dyn Connection) -> Result<()> {
        let mut form = self.raw.clone();
        form.insert("User", self.user.clone());
        form.set_numbered("Reviews", &self.reviews);
        conn.run_tagged_with_input("user", &["-i", "-f"], &form)?;
        Ok(())
    }
}

/// A client workspace spec.
#[derive(Clone, Debug)]
pub struct ClientSpec {
    /// The client name.
    pub client: String,

    /// Local filesystem root.
    pub root: PathBuf,

    /// View mapping lines, in `//depot/... //client/...` form.
    pub view: Vec<String>,

    raw: TaggedDict,
}

impl ClientSpec {
    /// Fetch a client spec, or `None` if the client does not exist.
    #[instrument(skip(conn))]
    pub fn fetch(conn: &dyn Connection, client: &str) -> Result<Option<Self>> {
        let row = match run_tagged_one(conn, "client", &["-o", client])? {
            Some(row) => row,
            None => return Ok(None),
        };
        // `client -o` manufactures a spec for nonexistent clients; the
        // Access field is only present once the spec has been saved.
        if row.get("Access").is_none() {
            return Ok(None);
        }
        Ok(Some(Self::from_form(row)))
    }

    fn from_form(row: TaggedDict) -> Self {
        let client = row.get("Client").unwrap_or_default().to_string();
        let root = PathBuf::from(row.get("Root").unwrap_or_default());
        let view = row.get_numbered("View");
        ClientSpec {
            client,
            root,
            view,
            raw: row,
        }
    }

    /// Construct a spec for a client that may not yet exist.
    pub fn new(client: &str, root: PathBuf, view: Vec<String>) -> Self {
        ClientSpec {
            client: client.to_string(),
            root,
            view,
            raw: TaggedDict::new(),
        }
    }

    /// Create or update this client workspace.
    #[instrument(skip(conn))]
    pub fn save(&self, conn: &dyn Connection) -> Result<()> {
        let mut form = self.raw.clone();
        form.insert("Client", self.client.clone());
        form.insert("Root", self.root.display().to_string());
        form.set_numbered("View", &self.view);
        conn.run_tagged_with_input("client", &["-i"], &form)?;
        Ok(())
    }

    /// Delete this client workspace.
    #[instrument(skip(conn))]
    pub fn delete(conn: &dyn Connection, client: &str) -> Result<()> {
        conn.run_tagged("client", &["-d", client])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reviews_user_name() {
        assert_eq!(
            reviews_user_name("gf-west"),
            "git-fusion-reviews-gf-west"
        );
    }
}
