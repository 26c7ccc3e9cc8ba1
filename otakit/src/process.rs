// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::{OsStr, OsString},
    fmt, io,
    process::{Command, ExitStatus, Output, Stdio},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Empty command line")]
    EmptyCommandLine,
    #[error("Failed to run command: {0}")]
    Spawn(CommandLine, #[source] io::Error),
    #[error("Command failed with {1}: {0}{stderr}", stderr = format_stderr(.2))]
    Execution(CommandLine, ExitStatus, Vec<u8>),
}

type Result<T> = std::result::Result<T, Error>;

fn format_stderr(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    let text = text.trim_end();

    if text.is_empty() {
        String::new()
    } else {
        format!(": {text}")
    }
}

/// A command line as passed to a [`ProcessRunner`]. Only used for error
/// reporting, where the operator needs to see the triggering command.
#[derive(Clone, Debug)]
pub struct CommandLine(pub Vec<OsString>);

impl CommandLine {
    pub fn new(argv: &[OsString]) -> Self {
        Self(argv.to_vec())
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }

            let text = arg.to_string_lossy();
            if text.is_empty() || text.contains(char::is_whitespace) {
                write!(f, "{text:?}")?;
            } else {
                f.write_str(&text)?;
            }
        }

        Ok(())
    }
}

/// Collaborator interface for running external tools. Every external tool
/// invocation in the package pipeline goes through this trait so that unit
/// tests can substitute in-process doubles.
pub trait ProcessRunner: Sync {
    fn run(&self, argv: &[OsString]) -> io::Result<Output>;
}

/// Runs commands on the host with stdout/stderr captured.
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, argv: &[OsString]) -> io::Result<Output> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Empty command line"))?;

        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
    }
}

/// Run a command and fail if it exits non-zero. There is no retry: a failing
/// external tool aborts the enclosing build.
pub fn run_checked(runner: &dyn ProcessRunner, argv: &[OsString]) -> Result<Output> {
    if argv.is_empty() {
        return Err(Error::EmptyCommandLine);
    }

    let output = runner
        .run(argv)
        .map_err(|e| Error::Spawn(CommandLine::new(argv), e))?;

    if !output.status.success() {
        return Err(Error::Execution(
            CommandLine::new(argv),
            output.status,
            output.stderr.clone(),
        ));
    }

    Ok(output)
}

/// Build an argv from anything resembling strings.
pub fn command<S: AsRef<OsStr>>(args: impl IntoIterator<Item = S>) -> Vec<OsString> {
    args.into_iter().map(|a| a.as_ref().to_owned()).collect()
}

/// An [`ExitStatus`] representing success. Only process runner doubles in
/// tests need to construct one; real runners get it from the child process.
pub fn success_status() -> ExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        ExitStatusExt::from_raw(0)
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::ExitStatusExt;
        ExitStatusExt::from_raw(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_display() {
        let cmd = CommandLine::new(&command(["bsdiff", "a file", "b"]));
        assert_eq!(cmd.to_string(), "bsdiff \"a file\" b");
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_fatal() {
        use std::os::unix::process::ExitStatusExt;

        struct FailingRunner;

        impl ProcessRunner for FailingRunner {
            fn run(&self, _argv: &[OsString]) -> io::Result<Output> {
                Ok(Output {
                    status: ExitStatus::from_raw(1 << 8),
                    stdout: vec![],
                    stderr: b"boom\n".to_vec(),
                })
            }
        }

        let err = run_checked(&FailingRunner, &command(["delta_generator"])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("delta_generator"), "{msg}");
        assert!(msg.contains("boom"), "{msg}");
    }
}
