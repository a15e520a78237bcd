//! Matcher contract
//!
//! A matcher selects the subset of a message's recipients that are in scope
//! for the paired mailet. Matcher failures are routed through the step's
//! [`MatchFailurePolicy`] rather than unwinding through the stage run.

use crate::mail::Mail;
use async_trait::async_trait;
use mailflow_common::types::EmailAddress;
use thiserror::Error;

/// Matcher error types
#[derive(Debug, Error)]
pub enum MatcherError {
    /// The condition string handed to the matcher was malformed
    #[error("Invalid matcher condition: {0}")]
    Condition(String),

    /// Evaluation failed at runtime
    #[error("Matcher evaluation failed: {0}")]
    Evaluation(String),
}

/// Configuration handed to a matcher at load time
#[derive(Debug, Clone, Default)]
pub struct MatcherConfig {
    /// The part after `=` in a `Name=condition` specification
    pub condition: Option<String>,
}

impl MatcherConfig {
    /// Configuration with a condition string
    pub fn with_condition(condition: impl Into<String>) -> Self {
        Self {
            condition: Some(condition.into()),
        }
    }

    /// The condition, or a configuration error if the matcher requires one
    pub fn require_condition(&self) -> Result<&str, MatcherError> {
        self.condition.as_deref().ok_or_else(|| {
            MatcherError::Condition("matcher requires a condition argument".to_string())
        })
    }
}

/// A recipient-selecting condition component
#[async_trait]
pub trait Matcher: Send + Sync {
    /// Matcher name, for logs and introspection
    fn name(&self) -> &str;

    /// Called once at load time, before the instance is shared
    async fn init(&mut self, config: &MatcherConfig) -> Result<(), MatcherError> {
        let _ = config;
        Ok(())
    }

    /// Return the subset of `candidates` in scope for the paired mailet.
    /// An empty result means no match. Implementations must be safe for
    /// concurrent invocation across messages.
    async fn matches(
        &self,
        mail: &Mail,
        candidates: &[EmailAddress],
    ) -> Result<Vec<EmailAddress>, MatcherError>;

    /// Called exactly once at shutdown
    async fn destroy(&self) -> Result<(), MatcherError> {
        Ok(())
    }
}

/// Outcome of evaluating a matcher against a message
#[derive(Debug)]
pub enum MatchOutcome {
    /// These recipients are in scope for the mailet
    Matched(Vec<EmailAddress>),
    /// No recipient matched; the mailet is skipped
    NotMatched,
    /// The matcher itself failed; consumed by the step's failure policy
    Failed(MatcherError),
}

/// What a step does when its matcher fails
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MatchFailurePolicy {
    /// Reject the message: record the error and set state to `error`
    #[default]
    Deny,
    /// Treat the failure as a no-match and continue with the next step
    Decline,
    /// Route the message to the named stage immediately
    RouteTo(String),
}

impl MatchFailurePolicy {
    /// Parse the `on-match-exception` configuration value
    pub fn parse(value: &str) -> Self {
        match value {
            "error" => Self::Deny,
            "decline" | "nomatch" => Self::Decline,
            stage => Self::RouteTo(stage.to_string()),
        }
    }
}

/// Logical NOT of another matcher's recipient selection
pub struct MatcherInverter {
    inner: Box<dyn Matcher>,
    label: String,
}

impl MatcherInverter {
    /// Wrap an already initialized matcher
    pub fn new(inner: Box<dyn Matcher>) -> Self {
        let label = format!("Not({})", inner.name());
        Self { inner, label }
    }
}

#[async_trait]
impl Matcher for MatcherInverter {
    fn name(&self) -> &str {
        &self.label
    }

    async fn matches(
        &self,
        mail: &Mail,
        candidates: &[EmailAddress],
    ) -> Result<Vec<EmailAddress>, MatcherError> {
        let hit = self.inner.matches(mail, candidates).await?;
        Ok(candidates
            .iter()
            .filter(|c| !hit.contains(c))
            .cloned()
            .collect())
    }

    async fn destroy(&self) -> Result<(), MatcherError> {
        self.inner.destroy().await
    }
}
