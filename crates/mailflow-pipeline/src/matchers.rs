//! Built-in matchers
//!
//! The standard matcher set a stock configuration can draw on. Conditions
//! come from the `Name=condition` part of the step declaration and are
//! validated at load time, so a bad condition fails startup instead of the
//! first message.

use crate::mail::Mail;
use crate::matcher::{Matcher, MatcherConfig, MatcherError};
use crate::registry::PluginRegistry;
use async_trait::async_trait;
use mailflow_common::types::EmailAddress;

/// Register the built-in matchers
pub fn register(registry: &mut PluginRegistry) {
    registry.register_matcher("All", || Box::new(All));
    registry.register_matcher("RecipientIs", || Box::new(RecipientIs::default()));
    registry.register_matcher("SenderIs", || Box::new(SenderIs::default()));
    registry.register_matcher("SizeGreaterThan", || Box::new(SizeGreaterThan::default()));
    registry.register_matcher("SubjectStartsWith", || {
        Box::new(SubjectStartsWith::default())
    });
    registry.register_matcher("HasMailAttribute", || {
        Box::new(HasMailAttribute::default())
    });
    registry.register_matcher("HasMailAttributeWithValueRegex", || {
        Box::new(HasMailAttributeWithValueRegex::default())
    });
}

fn parse_address_list(condition: &str) -> Result<Vec<EmailAddress>, MatcherError> {
    let addresses: Vec<EmailAddress> = condition
        .split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(|s| {
            EmailAddress::parse(s)
                .ok_or_else(|| MatcherError::Condition(format!("invalid address: {}", s)))
        })
        .collect::<Result<_, _>>()?;

    if addresses.is_empty() {
        return Err(MatcherError::Condition(
            "expected at least one address".to_string(),
        ));
    }
    Ok(addresses)
}

/// Matches every recipient
pub struct All;

#[async_trait]
impl Matcher for All {
    fn name(&self) -> &str {
        "All"
    }

    async fn matches(
        &self,
        _mail: &Mail,
        candidates: &[EmailAddress],
    ) -> Result<Vec<EmailAddress>, MatcherError> {
        Ok(candidates.to_vec())
    }
}

/// Matches the recipients named in the condition
#[derive(Default)]
pub struct RecipientIs {
    recipients: Vec<EmailAddress>,
}

#[async_trait]
impl Matcher for RecipientIs {
    fn name(&self) -> &str {
        "RecipientIs"
    }

    async fn init(&mut self, config: &MatcherConfig) -> Result<(), MatcherError> {
        self.recipients = parse_address_list(config.require_condition()?)?;
        Ok(())
    }

    async fn matches(
        &self,
        _mail: &Mail,
        candidates: &[EmailAddress],
    ) -> Result<Vec<EmailAddress>, MatcherError> {
        Ok(candidates
            .iter()
            .filter(|c| self.recipients.contains(c))
            .cloned()
            .collect())
    }
}

/// Matches all recipients when the envelope sender is one of the condition
/// addresses
#[derive(Default)]
pub struct SenderIs {
    senders: Vec<EmailAddress>,
}

#[async_trait]
impl Matcher for SenderIs {
    fn name(&self) -> &str {
        "SenderIs"
    }

    async fn init(&mut self, config: &MatcherConfig) -> Result<(), MatcherError> {
        self.senders = parse_address_list(config.require_condition()?)?;
        Ok(())
    }

    async fn matches(
        &self,
        mail: &Mail,
        candidates: &[EmailAddress],
    ) -> Result<Vec<EmailAddress>, MatcherError> {
        match mail.sender() {
            Some(sender) if self.senders.contains(sender) => Ok(candidates.to_vec()),
            _ => Ok(Vec::new()),
        }
    }
}

/// Matches all recipients when the payload exceeds the configured size.
/// The condition accepts a byte count or a `k`/`m` suffix, e.g. `100k`.
#[derive(Default)]
pub struct SizeGreaterThan {
    threshold: usize,
}

#[async_trait]
impl Matcher for SizeGreaterThan {
    fn name(&self) -> &str {
        "SizeGreaterThan"
    }

    async fn init(&mut self, config: &MatcherConfig) -> Result<(), MatcherError> {
        let condition = config.require_condition()?.trim().to_lowercase();

        let (number, multiplier) = if let Some(stripped) = condition.strip_suffix('k') {
            (stripped, 1024)
        } else if let Some(stripped) = condition.strip_suffix('m') {
            (stripped, 1024 * 1024)
        } else {
            (condition.as_str(), 1)
        };

        let value: usize = number
            .parse()
            .map_err(|_| MatcherError::Condition(format!("invalid size: {}", condition)))?;
        if value == 0 {
            return Err(MatcherError::Condition(
                "size threshold must be positive".to_string(),
            ));
        }

        self.threshold = value * multiplier;
        Ok(())
    }

    async fn matches(
        &self,
        mail: &Mail,
        candidates: &[EmailAddress],
    ) -> Result<Vec<EmailAddress>, MatcherError> {
        if mail.size() > self.threshold {
            Ok(candidates.to_vec())
        } else {
            Ok(Vec::new())
        }
    }
}

/// Matches all recipients when the decoded Subject header starts with the
/// configured prefix
#[derive(Default)]
pub struct SubjectStartsWith {
    prefix: String,
}

#[async_trait]
impl Matcher for SubjectStartsWith {
    fn name(&self) -> &str {
        "SubjectStartsWith"
    }

    async fn init(&mut self, config: &MatcherConfig) -> Result<(), MatcherError> {
        let prefix = config.require_condition()?.trim();
        if prefix.is_empty() {
            return Err(MatcherError::Condition(
                "subject prefix must not be empty".to_string(),
            ));
        }
        self.prefix = prefix.to_string();
        Ok(())
    }

    async fn matches(
        &self,
        mail: &Mail,
        candidates: &[EmailAddress],
    ) -> Result<Vec<EmailAddress>, MatcherError> {
        let matched = mail
            .parsed()
            .and_then(|m| m.subject().map(|s| s.starts_with(&self.prefix)))
            .unwrap_or(false);

        if matched {
            Ok(candidates.to_vec())
        } else {
            Ok(Vec::new())
        }
    }
}

/// Matches all recipients when the named attribute is set
#[derive(Default)]
pub struct HasMailAttribute {
    key: String,
}

#[async_trait]
impl Matcher for HasMailAttribute {
    fn name(&self) -> &str {
        "HasMailAttribute"
    }

    async fn init(&mut self, config: &MatcherConfig) -> Result<(), MatcherError> {
        self.key = config.require_condition()?.trim().to_string();
        if self.key.is_empty() {
            return Err(MatcherError::Condition(
                "attribute name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn matches(
        &self,
        mail: &Mail,
        candidates: &[EmailAddress],
    ) -> Result<Vec<EmailAddress>, MatcherError> {
        if mail.attribute(&self.key).is_some() {
            Ok(candidates.to_vec())
        } else {
            Ok(Vec::new())
        }
    }
}

/// Matches all recipients when the named attribute's string form matches
/// the configured regex. Condition: `attribute-name, pattern`.
#[derive(Default)]
pub struct HasMailAttributeWithValueRegex {
    key: String,
    pattern: Option<regex::Regex>,
}

#[async_trait]
impl Matcher for HasMailAttributeWithValueRegex {
    fn name(&self) -> &str {
        "HasMailAttributeWithValueRegex"
    }

    async fn init(&mut self, config: &MatcherConfig) -> Result<(), MatcherError> {
        let condition = config.require_condition()?;
        let (key, pattern) = condition.split_once(',').ok_or_else(|| {
            MatcherError::Condition(
                "expected condition of the form 'attribute-name, pattern'".to_string(),
            )
        })?;

        self.key = key.trim().to_string();
        let pattern = regex::Regex::new(pattern.trim())
            .map_err(|e| MatcherError::Condition(format!("invalid pattern: {}", e)))?;
        self.pattern = Some(pattern);
        Ok(())
    }

    async fn matches(
        &self,
        mail: &Mail,
        candidates: &[EmailAddress],
    ) -> Result<Vec<EmailAddress>, MatcherError> {
        let pattern = self
            .pattern
            .as_ref()
            .ok_or_else(|| MatcherError::Evaluation("matcher was not initialized".to_string()))?;

        let matched = mail
            .attribute(&self.key)
            .map(|value| match value {
                serde_json::Value::String(s) => pattern.is_match(s),
                other => pattern.is_match(&other.to_string()),
            })
            .unwrap_or(false);

        if matched {
            Ok(candidates.to_vec())
        } else {
            Ok(Vec::new())
        }
    }
}
