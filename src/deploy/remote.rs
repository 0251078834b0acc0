//! Boundary to whatever actually runs a shell command on a host
//!
//! The grid never calls this directly; phase bodies do.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::errors::{BearError, Result};

/// Where and as whom commands run
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    username: String,
    address: String,
    password: Option<String>,
}

impl HostAddress {
    pub fn new(username: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            address: address.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn localhost() -> Self {
        Self::new(whoami(), "localhost")
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn is_local(&self) -> bool {
        matches!(self.address.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.address)
    }
}

impl fmt::Debug for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAddress")
            .field("username", &self.username)
            .field("address", &self.address)
            .finish()
    }
}

/// Captured result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`BearError::Command`]
    pub fn check(self, host: &HostAddress, command: &str) -> Result<CommandOutput> {
        if self.ok() {
            Ok(self)
        } else {
            Err(BearError::command(
                host.to_string(),
                command,
                self.exit_code,
                self.stderr,
            ))
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` through a POSIX shell on `host`.
    ///
    /// A non-zero exit is not an error here; only failing to run the
    /// command at all is.
    async fn run(&self, host: &HostAddress, command: &str) -> Result<CommandOutput>;
}

/// Runs commands on this machine through `sh -c`
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, host: &HostAddress, command: &str) -> Result<CommandOutput> {
        if !host.is_local() {
            return Err(BearError::configuration(format!(
                "local runner cannot reach {}",
                host
            )));
        }

        debug!("[{}] $ {}", host, command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| BearError::io(format!("spawn `{}`", command), e))?;

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.ok() {
            warn!("[{}] `{}` exited with {}", host, command, result.exit_code);
        }
        Ok(result)
    }
}

struct Response {
    host: Option<String>,
    pattern: String,
    output: CommandOutput,
}

/// Records commands instead of running them.
///
/// Every command succeeds with empty output unless a response registered
/// with [`DryRunRunner::respond`] matches it.
#[derive(Default)]
pub struct DryRunRunner {
    executed: DashMap<String, Vec<String>>,
    responses: RwLock<Vec<Response>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `output`. `host` restricts
    /// the response to one host, given as `user@address`. Later responses
    /// take precedence.
    pub fn respond(&self, host: Option<&str>, pattern: impl Into<String>, output: CommandOutput) {
        self.responses.write().push(Response {
            host: host.map(str::to_string),
            pattern: pattern.into(),
            output,
        });
    }

    /// Commands run on `host`, in order
    pub fn commands(&self, host: &HostAddress) -> Vec<String> {
        self.executed
            .get(&host.to_string())
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }

    pub fn total_commands(&self) -> usize {
        self.executed.iter().map(|entry| entry.value().len()).sum()
    }

    fn response_for(&self, host: &str, command: &str) -> CommandOutput {
        self.responses
            .read()
            .iter()
            .rev()
            .find(|r| {
                r.host.as_deref().map_or(true, |h| h == host) && command.contains(&r.pattern)
            })
            .map(|r| r.output.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, host: &HostAddress, command: &str) -> Result<CommandOutput> {
        let key = host.to_string();
        debug!("[{}] (dry run) $ {}", key, command);
        self.executed
            .entry(key.clone())
            .or_default()
            .push(command.to_string());
        Ok(self.response_for(&key, command))
    }
}
