//! Notifier implementations.

use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Notification, Notifier};
use crate::config::EmailConfig;
use crate::error::NotifyError;

/// Hands messages to a sendmail-compatible program on stdin.
///
/// Credentials, when configured, are exported to the program as
/// `SMTP_USER` / `SMTP_PASSWORD` for relays that authenticate
/// (e.g. msmtp with `passwordeval`).
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    program: String,
    args: Vec<String>,
    password: Option<String>,
}

impl SendmailNotifier {
    pub fn new(program: impl Into<String>, args: Vec<String>, password: Option<String>) -> Self {
        Self {
            program: program.into(),
            args,
            password,
        }
    }

    pub fn from_config(config: &EmailConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone(), config.password.clone())
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(password) = &self.password {
            command
                .env("SMTP_USER", &notification.from)
                .env("SMTP_PASSWORD", password);
        }

        let mut child = command.spawn().map_err(|source| NotifyError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            // A program that rejects the message may exit before reading it;
            // its exit status below is the meaningful error.
            let written = match stdin.write_all(notification.to_message().as_bytes()).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!(program = %self.program, "Mail program closed stdin early");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(NotifyError::Rejected {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(to = %notification.to, "Message handed to {}", self.program);
        Ok(())
    }
}

/// Logs notifications instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            to = %notification.to,
            subject = %notification.subject,
            "Notification (delivery disabled)\n{}",
            notification.body
        );
        Ok(())
    }
}
