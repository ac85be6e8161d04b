//! Side-channel notifications for security-relevant session events.

use std::{fmt, path::PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

/// The kind of event being reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    /// A session completed second-factor authentication.
    Login,
    /// A session closed without ever completing its second factor.
    UnauthenticatedSessionClosed,
}

impl Code {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Code::Login => "LOGIN",
            Code::UnauthenticatedSessionClosed => "UNAUTHENTICATED_SESSION_CLOSED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sink for alert notifications. Dispatch failures are the dispatcher's
/// problem: the session layer logs them and never surfaces them to the
/// operation that triggered the alert.
#[async_trait]
pub trait Alerter: Send + Sync {
    /// Delivers a single alert.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert could not be delivered.
    async fn alert(&self, code: Code, details: &str) -> Result<()>;
}

/// An [`Alerter`] that reports through the process log.
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, code: Code, details: &str) -> Result<()> {
        warn!(code = %code, "{details}");
        Ok(())
    }
}

/// An [`Alerter`] that runs a command, passing the alert code and details
/// as arguments.
pub struct CommandAlerter {
    command: PathBuf,
}

impl CommandAlerter {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Alerter for CommandAlerter {
    async fn alert(&self, code: Code, details: &str) -> Result<()> {
        let status = Command::new(&self.command)
            .arg(code.as_str())
            .arg(details)
            .status()
            .await
            .with_context(|| format!("could not run alert command {}", self.command.display()))?;
        if !status.success() {
            return Err(anyhow!(
                "alert command {} exited with {status}",
                self.command.display()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_as_wire_names() {
        assert_eq!(Code::Login.to_string(), "LOGIN");
        assert_eq!(
            Code::UnauthenticatedSessionClosed.to_string(),
            "UNAUTHENTICATED_SESSION_CLOSED"
        );
    }

    #[tokio::test]
    async fn command_alerter_reports_exit_status() {
        let ok = CommandAlerter::new("true");
        ok.alert(Code::Login, "new session").await.unwrap();

        let failing = CommandAlerter::new("false");
        assert!(
            failing
                .alert(Code::UnauthenticatedSessionClosed, "session closed")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn command_alerter_reports_missing_command() {
        let missing = CommandAlerter::new("/nonexistent/alert-hook");
        assert!(missing.alert(Code::Login, "details").await.is_err());
    }
}
