//! Numbered pending changelists with scope-bound cleanup.

use tracing::{instrument, warn};

use super::client::{run_tagged_one, Connection, Error, Result, TaggedDict};

/// A numbered pending changelist on the depot.
///
/// Created by a factory on the repo context. Files are opened into it by
/// passing [`NumberedChangelist::change_num`] as the `-c` argument of
/// add/edit/delete/integ commands. If neither [`NumberedChangelist::submit`]
/// nor [`NumberedChangelist::abandon`] consumes the handle, dropping it
/// reverts any opened files and deletes the changelist, so an unwinding
/// error cannot leak pending state onto the depot.
#[derive(Debug)]
pub struct NumberedChangelist<'conn> {
    conn: &'conn dyn Connection,
    change_num: u64,
    live: bool,
}

impl<'conn> NumberedChangelist<'conn> {
    /// Create a new numbered pending changelist with the given description.
    #[instrument(skip(conn, description))]
    pub fn create(conn: &'conn dyn Connection, description: &str) -> Result<Self> {
        let mut form = TaggedDict::new();
        form.insert("Change", "new");
        form.insert("Status", "new");
        form.insert("Description", description);
        let row = conn
            .run_tagged_with_input("change", &["-i"], &form)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::CommandFailed {
                command: "change -i".to_string(),
                message: "no output from changelist creation".to_string(),
            })?;
        let change_num = row
            .get_int("change")?
            .ok_or_else(|| Error::MissingKey {
                command: "change -i".to_string(),
                key: "change",
            })?;
        Ok(NumberedChangelist {
            conn,
            change_num,
            live: true,
        })
    }

    /// The changelist number.
    pub fn change_num(&self) -> u64 {
        self.change_num
    }

    /// Replace the pending changelist's description.
    #[instrument(skip(self, description))]
    pub fn update_description(&self, description: &str) -> Result<()> {
        let row = run_tagged_one(
            self.conn,
            "change",
            &["-o", &self.change_num.to_string()],
        )?
        .ok_or_else(|| Error::CommandFailed {
            command: format!("change -o {}", self.change_num),
            message: "pending changelist not found".to_string(),
        })?;
        let mut form = row;
        form.insert("Description", description);
        self.conn.run_tagged_with_input("change", &["-i"], &form)?;
        Ok(())
    }

    /// Submit the changelist, consuming the handle. Returns the submitted
    /// changelist number, which may have been renumbered by the server.
    #[instrument(skip(self))]
    pub fn submit(mut self) -> Result<u64> {
        let change_arg = self.change_num.to_string();
        let rows = self.conn.run_tagged("submit", &["-c", &change_arg])?;
        self.live = false;
        for row in &rows {
            if let Some(submitted) = row.get_int("submittedChange")? {
                return Ok(submitted);
            }
        }
        Err(Error::CommandFailed {
            command: format!("submit -c {change_arg}"),
            message: "submit reported no submittedChange".to_string(),
        })
    }

    /// Revert all files opened in this changelist and delete it, consuming
    /// the handle.
    #[instrument(skip(self))]
    pub fn abandon(mut self) -> Result<()> {
        self.revert_and_delete()?;
        self.live = false;
        Ok(())
    }

    fn revert_and_delete(&self) -> Result<()> {
        let change_arg = self.change_num.to_string();
        self.conn
            .run_tagged("revert", &["-k", "-c", &change_arg, "//..."])?;
        self.conn.run_tagged("change", &["-d", &change_arg])?;
        Ok(())
    }
}

impl Drop for NumberedChangelist<'_> {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        if let Err(err) = self.revert_and_delete() {
            warn!(
                change_num = self.change_num,
                ?err,
                "could not clean up pending changelist"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::InMemoryDepot;

    use super::*;

    #[test]
    fn test_create_submit() {
        let depot = InMemoryDepot::new();
        let conn = depot.connect_with_client("git-fusion-user", "test-client");
        let change = NumberedChangelist::create(&conn, "test change").unwrap();
        let num = change.change_num();
        assert!(num > 0);
        depot.write_client_file(&conn, "//depot/main/file.txt", b"contents");
        conn.run_tagged("add", &["-c", &num.to_string(), "//depot/main/file.txt"])
            .unwrap();
        let submitted = change.submit().unwrap();
        assert!(submitted >= num);
        assert_eq!(
            depot.head_content("//depot/main/file.txt"),
            Some(b"contents".to_vec())
        );
    }

    #[test]
    fn test_drop_deletes_pending() {
        let depot = InMemoryDepot::new();
        let conn = depot.connect("git-fusion-user");
        let num = {
            let change = NumberedChangelist::create(&conn, "doomed").unwrap();
            change.change_num()
        };
        assert!(!depot.has_pending_change(num));
    }

    #[test]
    fn test_abandon_reverts_opened_files() {
        let depot = InMemoryDepot::new();
        let conn = depot.connect_with_client("git-fusion-user", "test-client");
        let change = NumberedChangelist::create(&conn, "abandoned").unwrap();
        let num = change.change_num();
        depot.write_client_file(&conn, "//depot/main/file.txt", b"contents");
        conn.run_tagged("add", &["-c", &num.to_string(), "//depot/main/file.txt"])
            .unwrap();
        change.abandon().unwrap();
        assert!(!depot.has_pending_change(num));
        assert!(depot.opened_files(&conn).is_empty());
    }
}
