pub mod lock;

use chrono::Local;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;
use which::which;

use crate::errors::{AppError, Result};

/// A single external program invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        CommandSpec {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// File name of the program, used in log lines and error messages.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn status_description(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "termination by signal".to_string(),
        }
    }
}

/// Runs external programs synchronously. The backup pipeline only talks to
/// subprocesses through this trait.
pub trait CommandRunner: Send + Sync {
    /// Resolves a program name or path to the executable that will be run.
    fn locate(&self, program: &str) -> Result<PathBuf>;

    /// Runs the command to completion. Spawn failures are errors; a non-zero
    /// exit is reported through the returned output.
    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands with `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn locate(&self, program: &str) -> Result<PathBuf> {
        let candidate = Path::new(program);
        if candidate.components().count() > 1 {
            if candidate.is_file() {
                return Ok(candidate.to_path_buf());
            }
            return Err(AppError::ToolUnavailable {
                tool: program.to_string(),
                reason: format!("{} does not exist", candidate.display()),
            });
        }
        which(program).map_err(|e| AppError::ToolUnavailable {
            tool: program.to_string(),
            reason: format!("not found in PATH ({})", e),
        })
    }

    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().map_err(|e| AppError::ToolUnavailable {
            tool: spec.tool_name(),
            reason: format!("failed to start {}: {}", spec.program.display(), e),
        })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs `spec` and turns a non-zero exit into `AppError::Command`.
pub fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    let output = runner.execute(spec)?;
    let stdout = output.stdout.trim();
    if !stdout.is_empty() {
        debug!("{} stdout: {}", spec.tool_name(), stdout);
    }
    if !output.success() {
        return Err(AppError::Command {
            tool: spec.tool_name(),
            status: output.status_description(),
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Timestamp used to name run directories and archives.
pub fn run_timestamp() -> String {
    Local::now().format("%Y-%m-%d_%H_%M_%S").to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    type Hook = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

    /// Records every invocation and answers through a per-test hook.
    pub(crate) struct FakeRunner {
        pub(crate) calls: Mutex<Vec<CommandSpec>>,
        pub(crate) missing: HashSet<String>,
        hook: Hook,
    }

    impl FakeRunner {
        pub(crate) fn new<F>(hook: F) -> Self
        where
            F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
        {
            FakeRunner {
                calls: Mutex::new(Vec::new()),
                missing: HashSet::new(),
                hook: Box::new(hook),
            }
        }

        pub(crate) fn with_missing(mut self, program: &str) -> Self {
            self.missing.insert(program.to_string());
            self
        }

        pub(crate) fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn locate(&self, program: &str) -> Result<PathBuf> {
            if self.missing.contains(program) {
                return Err(AppError::ToolUnavailable {
                    tool: program.to_string(),
                    reason: "not found in PATH".to_string(),
                });
            }
            Ok(PathBuf::from(program))
        }

        fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            Ok((self.hook)(spec))
        }
    }

    impl CommandSpec {
        /// Value following `flag` in the argument list, or the inline value of `flag=...`.
        pub(crate) fn arg_value(&self, flag: &str) -> Option<PathBuf> {
            let inline = format!("{}=", flag);
            let mut args = self.args.iter();
            while let Some(arg) = args.next() {
                let arg = arg.to_string_lossy();
                if arg == flag {
                    return args.next().map(PathBuf::from);
                }
                if let Some(value) = arg.strip_prefix(&inline) {
                    return Some(PathBuf::from(value));
                }
            }
            None
        }

        /// Database a dump command targets: the trailing positional, or the
        /// unquoted value of a trailing `--dbname=dbname='...'`.
        pub(crate) fn target_database(&self) -> Option<String> {
            let last = self.args.last()?.to_string_lossy().into_owned();
            let quoted = match last
                .strip_prefix("--dbname=dbname='")
                .and_then(|rest| rest.strip_suffix('\''))
            {
                Some(quoted) => quoted.to_string(),
                None => return Some(last),
            };
            let mut name = String::new();
            let mut chars = quoted.chars();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => name.extend(chars.next()),
                    other => name.push(other),
                }
            }
            Some(name)
        }
    }

    pub(crate) fn exited(code: i32) -> CommandOutput {
        CommandOutput {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    #[test]
    fn test_arg_value_reads_both_forms() {
        let spec = CommandSpec::new("/usr/bin/pg_dump")
            .arg("--file")
            .arg("/tmp/run/app.sql")
            .arg("--result-file=/tmp/run/other.sql");
        assert_eq!(spec.arg_value("--file"), Some(PathBuf::from("/tmp/run/app.sql")));
        assert_eq!(spec.arg_value("--result-file"), Some(PathBuf::from("/tmp/run/other.sql")));
        assert_eq!(spec.arg_value("--host"), None);
        assert_eq!(spec.tool_name(), "pg_dump");
    }

    #[test]
    fn test_run_checked_reports_non_zero_exit() {
        let runner = FakeRunner::new(|_| CommandOutput {
            exit_code: Some(2),
            stdout: String::new(),
            stderr: "mysqldump: Got error: 1044: Access denied\n".to_string(),
        });
        let err = run_checked(&runner, &CommandSpec::new("mysqldump")).unwrap_err();
        match err {
            AppError::Command { tool, status, stderr } => {
                assert_eq!(tool, "mysqldump");
                assert_eq!(status, "exit code 2");
                assert_eq!(stderr, "mysqldump: Got error: 1044: Access denied");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_run_checked_keeps_stdout() {
        let runner = FakeRunner::new(|_| CommandOutput {
            exit_code: Some(0),
            stdout: "  adding: 2026-10-16_02_00_00_mysql/app.sql (deflated 61%)\n".to_string(),
            stderr: String::new(),
        });
        let output = run_checked(&runner, &CommandSpec::new("zip")).unwrap();
        assert!(output.stdout.contains("app.sql"));
    }

    #[test]
    fn test_target_database_unquotes_conninfo() {
        let spec = CommandSpec::new("pg_dump").arg(r"--dbname=dbname='o\'brien'");
        assert_eq!(spec.target_database().as_deref(), Some("o'brien"));
        let spec = CommandSpec::new("mysqldump").arg("--").arg("app");
        assert_eq!(spec.target_database().as_deref(), Some("app"));
    }

    #[test]
    fn test_system_runner_missing_explicit_path() {
        let err = SystemCommandRunner
            .locate("/definitely/not/here/mysqldump")
            .unwrap_err();
        assert!(matches!(err, AppError::ToolUnavailable { .. }));
    }

    #[test]
    fn test_system_runner_spawn_failure_is_tool_unavailable() {
        let spec = CommandSpec::new("/definitely/not/here/zip").arg("-r");
        let err = SystemCommandRunner.execute(&spec).unwrap_err();
        assert!(matches!(err, AppError::ToolUnavailable { ref tool, .. } if tool == "zip"));
    }

    #[test]
    fn test_run_timestamp_shape() {
        let ts = run_timestamp();
        assert_eq!(ts.len(), "2026-10-16_02_00_00".len());
        assert!(!ts.contains(' ') && !ts.contains(':'));
    }
}
