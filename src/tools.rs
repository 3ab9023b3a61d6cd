//! Launching external executables.
//!
//! Tasks describe what to run as an [`Invocation`] and hand it to the
//! [`ToolRunner`] from the environment, so tests can swap in a fake.

use std::fs::File;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ToolError;

const POLL: Duration = Duration::from_millis(20);

/// A pipeline of commands, each given as an argument vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub commands: Vec<Vec<String>>,
    pub stdin: Option<Utf8PathBuf>,
    pub stdout: Option<Utf8PathBuf>,
    pub cwd: Option<Utf8PathBuf>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: vec![argv.into_iter().map(Into::into).collect()],
            ..Self::default()
        }
    }

    /// Appends a command that reads the previous one's output.
    pub fn pipe<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands
            .push(argv.into_iter().map(Into::into).collect());
        self
    }

    pub fn stdin(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn stdout(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn cwd(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name of the first executable.
    pub fn program(&self) -> &str {
        self.commands
            .first()
            .and_then(|argv| argv.first())
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Shell-like rendering, for logs and error messages.
    pub fn display(&self) -> String {
        let mut line = self
            .commands
            .iter()
            .map(|argv| argv.join(" "))
            .collect::<Vec<_>>()
            .join(" | ");

        if let Some(stdin) = &self.stdin {
            line.push_str(&format!(" < {stdin}"));
        }
        if let Some(stdout) = &self.stdout {
            line.push_str(&format!(" > {stdout}"));
        }

        line
    }
}

pub trait ToolRunner: Send + Sync {
    /// Runs the invocation to completion. Any non-zero exit is an error.
    fn run(&self, invocation: &Invocation) -> Result<(), ToolError>;
}

/// Fails with [`ToolError::MissingOutput`] unless `path` exists.
pub fn ensure_output(invocation: &Invocation, path: &Utf8Path) -> Result<(), ToolError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ToolError::MissingOutput {
            command: invocation.program().to_string(),
            path: path.to_owned(),
        })
    }
}

/// Runs tools as child processes of the current one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<(), ToolError> {
        if invocation.commands.iter().any(Vec::is_empty) || invocation.commands.is_empty() {
            return Err(ToolError::Empty);
        }

        tracing::debug!("running {}", invocation.display());

        let mut children = Vec::with_capacity(invocation.commands.len());
        let result = spawn_pipeline(invocation, &mut children)
            .and_then(|_| wait_pipeline(invocation, &mut children));

        if result.is_err() {
            for (_, child) in &mut children {
                let _ = child.kill();
                let _ = child.wait();
            }
        }

        result
    }
}

fn spawn_pipeline(
    invocation: &Invocation,
    children: &mut Vec<(String, Child)>,
) -> Result<(), ToolError> {
    let last = invocation.commands.len() - 1;

    for (i, argv) in invocation.commands.iter().enumerate() {
        let command = argv.join(" ");
        let redirect = |source| ToolError::Redirect {
            command: command.clone(),
            source,
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).stderr(Stdio::inherit());

        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }

        let stdin = match children.last_mut() {
            Some((_, prev)) => prev.stdout.take().map(Stdio::from).unwrap_or_else(Stdio::null),
            None => match &invocation.stdin {
                Some(path) => Stdio::from(File::open(path).map_err(redirect)?),
                None => Stdio::null(),
            },
        };
        cmd.stdin(stdin);

        let stdout = match (&invocation.stdout, i == last) {
            (_, false) => Stdio::piped(),
            (Some(path), true) => Stdio::from(File::create(path).map_err(redirect)?),
            (None, true) => Stdio::inherit(),
        };
        cmd.stdout(stdout);

        let child = cmd.spawn().map_err(|source| ToolError::Spawn {
            command: command.clone(),
            source,
        })?;
        children.push((command, child));
    }

    Ok(())
}

fn wait_pipeline(
    invocation: &Invocation,
    children: &mut [(String, Child)],
) -> Result<(), ToolError> {
    let deadline = invocation.timeout.map(|timeout| Instant::now() + timeout);
    let mut first_error = None;

    for (command, child) in children.iter_mut() {
        let status = wait_until(child, deadline).map_err(|source| ToolError::Spawn {
            command: command.clone(),
            source,
        })?;

        let Some(status) = status else {
            return Err(ToolError::Timeout {
                command: command.clone(),
                timeout: invocation.timeout.unwrap_or_default(),
            });
        };

        if first_error.is_none() {
            first_error = check_status(command, status).err();
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn wait_until(child: &mut Child, deadline: Option<Instant>) -> std::io::Result<Option<ExitStatus>> {
    let Some(deadline) = deadline else {
        return child.wait().map(Some);
    };

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL);
    }
}

fn check_status(command: &str, status: ExitStatus) -> Result<(), ToolError> {
    if status.success() {
        return Ok(());
    }

    match status.code() {
        Some(code) => Err(ToolError::Exit {
            command: command.to_string(),
            code,
        }),
        None => Err(ToolError::Signal {
            command: command.to_string(),
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use super::*;
    use crate::testing::utf8;

    #[test]
    fn test_stdout_is_captured_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = utf8(dir.path()).join("out.txt");

        let invocation = Invocation::new(["echo", "chr1"]).stdout(&out);
        ProcessRunner.run(&invocation).unwrap();

        assert_eq!(fs::read_to_string(out).unwrap(), "chr1\n");
    }

    #[test]
    fn test_pipe_feeds_next_command() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        fs::write(root.join("in.txt"), "a\nb\nc\n").unwrap();

        let invocation = Invocation::new(["cat"])
            .pipe(["wc", "-l"])
            .stdin(root.join("in.txt"))
            .stdout(root.join("count.txt"));
        ProcessRunner.run(&invocation).unwrap();

        let count = fs::read_to_string(root.join("count.txt")).unwrap();
        assert_eq!(count.trim(), "3");
    }

    #[test]
    fn test_exit_status_is_reported() {
        let invocation = Invocation::new(["sh", "-c", "exit 3"]);
        let err = ProcessRunner.run(&invocation).unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let invocation = Invocation::new(["definitely-not-a-real-tool-xyz"]);
        let err = ProcessRunner.run(&invocation).unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[test]
    fn test_timeout_kills_the_tool() {
        let invocation =
            Invocation::new(["sleep", "5"]).timeout(Some(Duration::from_millis(100)));
        let start = Instant::now();
        let err = ProcessRunner.run(&invocation).unwrap_err();

        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_output_is_an_error() {
        let invocation = Invocation::new(["true"]);
        let err = ensure_output(&invocation, Utf8Path::new("/nonexistent/out.hal")).unwrap_err();
        assert!(matches!(err, ToolError::MissingOutput { .. }));
    }
}
