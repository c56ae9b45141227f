use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Script(String),
    Program {
        program: PathBuf,
        args: Vec<String>,
        stdin: Option<PathBuf>,
        env: Vec<(String, String)>,
    },
}

impl Invocation {
    pub fn script(body: impl Into<String>) -> Self {
        Self::Script(body.into())
    }

    pub fn program<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Program {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            env: Vec::new(),
        }
    }

    pub fn with_stdin(mut self, path: impl Into<PathBuf>) -> Self {
        if let Self::Program { stdin, .. } = &mut self {
            *stdin = Some(path.into());
        }
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Self::Program { env, .. } = &mut self {
            env.push((key.into(), value.into()));
        }
        self
    }

    pub fn label(&self) -> String {
        match self {
            Self::Script(_) => "script".to_string(),
            Self::Program { program, .. } => program
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| program.display().to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn first_line(&self) -> &str {
        self.stdout.lines().next().map(str::trim).unwrap_or("")
    }
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status} (stderr: {detail})")]
    Failed {
        program: String,
        status: ExitCode,
        detail: String,
    },
}

impl ShellError {
    pub fn detail(&self) -> String {
        match self {
            Self::Launch { source, .. } => source.to_string(),
            Self::Failed { detail, .. } => detail.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Code(i32),
    Signal,
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal => write!(f, "no exit code"),
        }
    }
}

pub trait HostShell: Send + Sync {
    fn execute(&self, invocation: &Invocation) -> Result<ShellOutput, ShellError>;
}

#[derive(Debug, Clone)]
pub struct PowerShell {
    executable: PathBuf,
}

impl Default for PowerShell {
    fn default() -> Self {
        Self::new("powershell.exe")
    }
}

impl PowerShell {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn command_for(&self, invocation: &Invocation) -> io::Result<Command> {
        match invocation {
            Invocation::Script(body) => {
                let mut command = Command::new(&self.executable);
                command.args([
                    "-NoProfile",
                    "-NonInteractive",
                    "-ExecutionPolicy",
                    "Bypass",
                    "-Command",
                ]);
                command.arg(format!("& {{ {body} }}"));
                command.stdin(Stdio::null());
                Ok(command)
            }
            Invocation::Program {
                program,
                args,
                stdin,
                env,
            } => {
                let mut command = Command::new(program);
                command.args(args);
                for (key, value) in env {
                    command.env(key, value);
                }
                match stdin {
                    Some(path) => {
                        command.stdin(File::open(path)?);
                    }
                    None => {
                        command.stdin(Stdio::null());
                    }
                }
                Ok(command)
            }
        }
    }
}

impl HostShell for PowerShell {
    fn execute(&self, invocation: &Invocation) -> Result<ShellOutput, ShellError> {
        let program = invocation.label();
        debug!(program = program.as_str(), "Executing host command");
        let mut command = self
            .command_for(invocation)
            .map_err(|source| ShellError::Launch {
                program: program.clone(),
                source,
            })?;
        let output = command.output().map_err(|source| ShellError::Launch {
            program: program.clone(),
            source,
        })?;

        let result = ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        if output.status.success() {
            Ok(result)
        } else {
            let status = output
                .status
                .code()
                .map(ExitCode::Code)
                .unwrap_or(ExitCode::Signal);
            let detail = if result.stderr.is_empty() {
                result.stdout
            } else {
                result.stderr
            };
            Err(ShellError::Failed {
                program,
                status,
                detail,
            })
        }
    }
}

pub fn quote_single(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn escape_sql_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_quotes_are_doubled() {
        assert_eq!(quote_single(r"C:\O'Brien\php"), r"'C:\O''Brien\php'");
    }

    #[test]
    fn sql_strings_escape_backslashes_first() {
        assert_eq!(escape_sql_string(r"a\'b"), r"a\\\'b");
    }

    #[test]
    fn program_invocation_keeps_stdin_and_env() {
        let invocation = Invocation::program("mysql.exe", ["-u", "root"])
            .with_stdin("dump.sql")
            .with_env("KEY", "VALUE");
        match &invocation {
            Invocation::Program { args, stdin, env, .. } => {
                assert_eq!(args, &vec!["-u".to_string(), "root".to_string()]);
                assert_eq!(stdin.as_deref(), Some(Path::new("dump.sql")));
                assert_eq!(env, &vec![("KEY".to_string(), "VALUE".to_string())]);
            }
            Invocation::Script(_) => panic!("expected program invocation"),
        }
        assert_eq!(invocation.label(), "mysql.exe");
    }

    #[test]
    fn failed_error_mentions_stderr() {
        let err = ShellError::Failed {
            program: "script".into(),
            status: ExitCode::Code(1),
            detail: "access denied".into(),
        };
        assert_eq!(err.to_string(), "script exited with exit code 1 (stderr: access denied)");
    }
}
