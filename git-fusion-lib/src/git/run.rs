use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use eyre::Context;
use itertools::Itertools;
use tracing::instrument;

/// Path and environment for invoking Git plumbing as a subprocess.
///
/// Streamed operations (`fast-import`, `cat-file --batch`) go through a
/// subprocess rather than `git2` so that object writes use Git's own
/// packing and marks machinery.
#[derive(Clone)]
pub struct GitRunner {
    /// The path to the Git executable on disk.
    pub path_to_git: PathBuf,

    /// The working directory that the Git executable should be run in.
    pub working_directory: PathBuf,

    /// The environment variables that should be passed to the Git process.
    pub env: HashMap<OsString, OsString>,
}

impl std::fmt::Debug for GitRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<GitRunner path_to_git={:?} working_directory={:?} env=not shown>",
            self.path_to_git, self.working_directory
        )
    }
}

/// The captured result of one Git subprocess invocation.
#[must_use]
pub struct GitRunnerOutput {
    /// The exit code of the process.
    pub exit_code: i32,

    /// The stdout contents written by the invocation.
    pub stdout: Vec<u8>,

    /// The stderr contents written by the invocation.
    pub stderr: Vec<u8>,
}

impl GitRunnerOutput {
    /// Whether the process exited with code zero.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Interpret stdout as UTF-8, lossily.
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

impl std::fmt::Debug for GitRunnerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<GitRunnerOutput exit_code={:?} stdout={:?} stderr={:?}>",
            self.exit_code,
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr),
        )
    }
}

impl GitRunner {
    /// Run Git with the given arguments and capture its output. A non-zero
    /// exit code is not an error at this layer; callers inspect
    /// [`GitRunnerOutput::exit_code`].
    #[instrument]
    pub fn run<S: AsRef<OsStr> + std::fmt::Debug>(
        &self,
        args: &[S],
    ) -> eyre::Result<GitRunnerOutput> {
        self.run_with_stdin(args, None)
    }

    /// Run Git, writing `stdin` to the subprocess before reading output.
    #[instrument(skip(stdin))]
    pub fn run_with_stdin<S: AsRef<OsStr> + std::fmt::Debug>(
        &self,
        args: &[S],
        stdin: Option<&[u8]>,
    ) -> eyre::Result<GitRunnerOutput> {
        let args_string = args
            .iter()
            .map(|arg| arg.as_ref().to_string_lossy().to_string())
            .collect_vec()
            .join(" ");

        let mut command = Command::new(&self.path_to_git);
        command.current_dir(&self.working_directory);
        command.args(args.iter().map(AsRef::as_ref));
        command.env_clear();
        command.envs(self.env.iter());
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .wrap_err_with(|| format!("Spawning Git subprocess: git {args_string}"))?;
        if let Some(stdin_bytes) = stdin {
            child
                .stdin
                .take()
                .expect("child process stdin was requested piped")
                .write_all(stdin_bytes)
                .wrap_err("Writing to Git subprocess stdin")?;
        }
        let output = child
            .wait_with_output()
            .wrap_err_with(|| format!("Waiting for Git subprocess: git {args_string}"))?;

        // If the child was killed by a signal there is no exit code; treat
        // it as a plain failure.
        let exit_code = output.status.code().unwrap_or(1);
        Ok(GitRunnerOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
