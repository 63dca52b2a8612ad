use std::ffi::OsString;

use crate::config::DEFAULT_IGNITE_BIN;

const SUDO_BIN: &str = "sudo";

/// Builder of a single ignite invocation, e.g. `sudo ignite stop <vm>`.
pub struct IgniteCommandBuilder {
    bin: Option<String>,
    sudo: bool,
    args: Vec<OsString>,
    stdin: Option<std::process::Stdio>,
    stdout: Option<std::process::Stdio>,
    stderr: Option<std::process::Stdio>,
}

impl Default for IgniteCommandBuilder {
    fn default() -> Self {
        Self::new()
            .with_bin(DEFAULT_IGNITE_BIN)
            .with_stdin(std::process::Stdio::null())
            .with_stdout(std::process::Stdio::piped())
            .with_stderr(std::process::Stdio::piped())
    }
}

impl IgniteCommandBuilder {
    /// new returns a blank Builder with all fields unset
    pub fn new() -> Self {
        Self {
            bin: None,
            sudo: false,
            args: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    /// with_bin specifies which ignite binary to use
    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.bin = Some(bin.into());
        self
    }

    /// bin returns the bin that was set, or `ignite` if none was
    pub fn bin(&self) -> &str {
        self.bin.as_deref().unwrap_or(DEFAULT_IGNITE_BIN)
    }

    /// set_sudo runs the binary through `sudo`
    pub fn set_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<std::process::Stdio>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_stdout(mut self, stdout: impl Into<std::process::Stdio>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<std::process::Stdio>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    /// Program and arguments as they will be executed, for logging.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if self.sudo {
            argv.push(SUDO_BIN.to_string());
        }
        argv.push(self.bin().to_string());
        argv.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        argv
    }

    /// build a tokio command. The child is killed if its handle is dropped,
    /// so an abandoned (timed out) invocation does not linger.
    pub fn build(self) -> tokio::process::Command {
        let mut cmd = if self.sudo {
            let mut cmd = tokio::process::Command::new(SUDO_BIN);
            cmd.arg(self.bin());
            cmd
        } else {
            tokio::process::Command::new(self.bin())
        };
        cmd.args(&self.args);
        if let Some(stdin) = self.stdin {
            cmd.stdin(stdin);
        }
        if let Some(stdout) = self.stdout {
            cmd.stdout(stdout);
        }
        if let Some(stderr) = self.stderr {
            cmd.stderr(stderr);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}
