//! Mailet contract
//!
//! A mailet performs work against the recipients a matcher put in scope.
//! It may mutate the message payload, attributes and recipient set, change
//! the routing state, or hand derived messages (bounces, notifications)
//! back to the pipeline through the [`MailetContext`].

use crate::mail::Mail;
use async_trait::async_trait;
use mailflow_common::types::EmailAddress;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Mailet error types
#[derive(Debug, Error)]
pub enum MailetError {
    /// The mailet configuration was incomplete or malformed
    #[error("Invalid mailet configuration: {0}")]
    Config(String),

    /// The mailet failed while servicing a message
    #[error("Mailet execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Opaque key/value configuration handed to a mailet at load time
#[derive(Debug, Clone, Default)]
pub struct MailetConfig {
    params: HashMap<String, String>,
}

impl MailetConfig {
    /// Build from a raw parameter map
    pub fn new(params: HashMap<String, String>) -> Self {
        Self { params }
    }

    /// Parameter value, if declared
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parameter value, or a configuration error naming the missing key
    pub fn require(&self, key: &str) -> Result<&str, MailetError> {
        self.get(key)
            .ok_or_else(|| MailetError::Config(format!("missing required parameter '{}'", key)))
    }

    /// All declared parameters, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether no parameters were declared
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// An action component acting on (a subset of) a message
#[async_trait]
pub trait Mailet: Send + Sync {
    /// Mailet name, for logs and introspection
    fn name(&self) -> &str;

    /// Called once at load time, before the instance is shared
    async fn init(&mut self, config: &MailetConfig) -> Result<(), MailetError> {
        let _ = config;
        Ok(())
    }

    /// Act on the message. `scope` is the recipient subset selected by the
    /// step's matcher; mutations of message-wide fields (payload, state,
    /// attributes) affect the whole message. Implementations must be safe
    /// for concurrent invocation across messages.
    async fn service(
        &self,
        mail: &mut Mail,
        scope: &[EmailAddress],
        ctx: &MailetContext,
    ) -> Result<(), MailetError>;

    /// Called exactly once at shutdown
    async fn destroy(&self) -> Result<(), MailetError> {
        Ok(())
    }
}

struct ContextInner {
    hostname: String,
    spool: mpsc::UnboundedSender<Mail>,
}

/// The pipeline surface exposed to mailets
#[derive(Clone)]
pub struct MailetContext {
    inner: Arc<ContextInner>,
}

impl MailetContext {
    /// Create a context feeding derived messages into the given spool queue
    pub fn new(hostname: impl Into<String>, spool: mpsc::UnboundedSender<Mail>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                hostname: hostname.into(),
                spool,
            }),
        }
    }

    /// The server hostname, for notice texts and banners
    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    /// Enqueue a derived message for a fresh dispatch at its current
    /// routing state. The message must have at least one recipient.
    pub fn send_mail(&self, mail: Mail) -> Result<(), MailetError> {
        if mail.recipients().is_empty() {
            return Err(MailetError::Execution(
                "cannot enqueue a mail without recipients".to_string(),
            ));
        }
        self.inner
            .spool
            .send(mail)
            .map_err(|_| MailetError::Execution("the spool is shut down".to_string()))
    }
}
