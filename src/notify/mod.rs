//! Batch completion notifications.
//!
//! When the last task of a batch reaches a terminal state, the submitter
//! receives one message summarizing every task and an overall verdict.

pub mod completion;
pub mod mail;
pub mod report;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EmailConfig;
use crate::error::NotifyError;

pub use completion::{BatchClosed, BatchCompletionNotifier};
pub use mail::{LogNotifier, SendmailNotifier};
pub use report::{BatchReport, Verdict};

/// A plain-text message for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// Renders the message with RFC 5322 headers.
    pub fn to_message(&self) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\n{}\n",
            header_value(&self.from),
            header_value(&self.to),
            header_value(&self.subject),
            self.body
        )
    }
}

// Header values must stay on one line.
fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Delivers notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Builds the notifier selected by the email settings.
pub fn notifier_from_config(config: &EmailConfig) -> Arc<dyn Notifier> {
    if config.enabled {
        Arc::new(SendmailNotifier::from_config(config))
    } else {
        Arc::new(LogNotifier)
    }
}
