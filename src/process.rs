//! Thin builder over `std::process::Command` for the external tools the
//! controller drives (apt, mount, hook scripts).
//!
//! ```rust,ignore
//! use imagesmith::process::Cmd;
//!
//! Cmd::new("apt-get")
//!     .args(["-y", "autoremove"])
//!     .error_msg("apt-get autoremove failed")
//!     .run()?;
//! ```

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Command, Stdio};

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Command builder with contextual error messages.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.as_os_str().to_os_string());
        self
    }

    /// Message used as the error headline when the command exits non-zero.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the output instead of an error when the command exits non-zero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Human-readable rendering used in logs and error context.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run with captured stdout/stderr.
    pub fn run(&self) -> Result<CmdOutput> {
        tracing::debug!(command = %self.display(), "running");
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("executing '{}'", self.display()))?;

        let result = CmdOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let headline = self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.display()));
            bail!(
                "{}\n  Exit code: {}\n  stderr: {}",
                headline,
                result.code.unwrap_or(-1),
                result.stderr.trim()
            );
        }

        Ok(result)
    }

    /// Run with inherited stdio so long-running tools stream progress.
    pub fn run_interactive(&self) -> Result<()> {
        tracing::debug!(command = %self.display(), "running (interactive)");
        let status = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("executing '{}'", self.display()))?;

        if !status.success() && !self.allow_fail {
            let headline = self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.display()));
            bail!("{} (status {})", headline, status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let out = Cmd::new("sh").args(["-c", "echo hello"]).run().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_failure_uses_error_msg() {
        let err = Cmd::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .error_msg("custom failure")
            .run()
            .unwrap_err()
            .to_string();
        assert!(err.contains("custom failure"));
        assert!(err.contains("Exit code: 3"));
        assert!(err.contains("boom"));
    }

    #[test]
    fn test_allow_fail_returns_output() {
        let out = Cmd::new("sh")
            .args(["-c", "exit 1"])
            .allow_fail()
            .run()
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.code, Some(1));
    }

    #[test]
    fn test_env_is_passed() {
        let out = Cmd::new("sh")
            .args(["-c", "printf %s \"$IMAGESMITH_TEST\""])
            .env("IMAGESMITH_TEST", "value")
            .run()
            .unwrap();
        assert_eq!(out.stdout, "value");
    }
}
