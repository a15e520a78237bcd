//! Built-in mailets
//!
//! The storage-free part of the standard mailet set: routing, attribute
//! bookkeeping, header stamping, logging and sender notification. Delivery
//! mailets live next to the storage layer they need.

use crate::mail::Mail;
use crate::mailet::{Mailet, MailetConfig, MailetContext, MailetError};
use crate::registry::PluginRegistry;
use async_trait::async_trait;
use mailflow_common::types::EmailAddress;
use tracing::info;

/// Register the built-in mailets
pub fn register(registry: &mut PluginRegistry) {
    registry.register_mailet("Null", || Box::new(Null));
    registry.register_mailet("ToProcessor", || Box::new(ToProcessor::default()));
    registry.register_mailet("LogMessage", || Box::new(LogMessage::default()));
    registry.register_mailet("SetMailAttribute", || {
        Box::new(SetMailAttribute::default())
    });
    registry.register_mailet("RemoveMailAttribute", || {
        Box::new(RemoveMailAttribute::default())
    });
    registry.register_mailet("SetMimeHeader", || Box::new(SetMimeHeader::default()));
    registry.register_mailet("NotifySender", || Box::new(NotifySender::default()));
}

/// Consumes the message unconditionally
pub struct Null;

#[async_trait]
impl Mailet for Null {
    fn name(&self) -> &str {
        "Null"
    }

    async fn service(
        &self,
        mail: &mut Mail,
        _scope: &[EmailAddress],
        _ctx: &MailetContext,
    ) -> Result<(), MailetError> {
        mail.set_state(Mail::GHOST);
        Ok(())
    }
}

/// Redirects the message to another stage. Parameters: `processor`
/// (required target stage), `notice` (optional text recorded as the
/// message's error message, useful when routing to the error stage).
#[derive(Default)]
pub struct ToProcessor {
    processor: String,
    notice: Option<String>,
}

#[async_trait]
impl Mailet for ToProcessor {
    fn name(&self) -> &str {
        "ToProcessor"
    }

    async fn init(&mut self, config: &MailetConfig) -> Result<(), MailetError> {
        self.processor = config.require("processor")?.to_string();
        self.notice = config.get("notice").map(str::to_string);
        Ok(())
    }

    async fn service(
        &self,
        mail: &mut Mail,
        _scope: &[EmailAddress],
        _ctx: &MailetContext,
    ) -> Result<(), MailetError> {
        if let Some(notice) = &self.notice {
            mail.set_error_message(notice.clone());
        }
        mail.set_state(&self.processor);
        Ok(())
    }
}

/// Logs a summary of the message and passes it through unchanged.
/// Parameter: `comment` (optional text prepended to the log line).
#[derive(Default)]
pub struct LogMessage {
    comment: Option<String>,
}

#[async_trait]
impl Mailet for LogMessage {
    fn name(&self) -> &str {
        "LogMessage"
    }

    async fn init(&mut self, config: &MailetConfig) -> Result<(), MailetError> {
        self.comment = config.get("comment").map(str::to_string);
        Ok(())
    }

    async fn service(
        &self,
        mail: &mut Mail,
        scope: &[EmailAddress],
        _ctx: &MailetContext,
    ) -> Result<(), MailetError> {
        let subject = mail
            .parsed()
            .and_then(|m| m.subject().map(str::to_string))
            .unwrap_or_default();

        info!(
            comment = self.comment.as_deref().unwrap_or(""),
            mail = %mail.name(),
            sender = %mail
                .sender()
                .map(ToString::to_string)
                .unwrap_or_else(|| "<>".to_string()),
            recipients = mail.recipients().len(),
            in_scope = scope.len(),
            state = %mail.state(),
            size = mail.size(),
            subject = %subject,
            "Message logged"
        );
        Ok(())
    }
}

/// Sets every configured parameter as a mail attribute
#[derive(Default)]
pub struct SetMailAttribute {
    attributes: Vec<(String, String)>,
}

#[async_trait]
impl Mailet for SetMailAttribute {
    fn name(&self) -> &str {
        "SetMailAttribute"
    }

    async fn init(&mut self, config: &MailetConfig) -> Result<(), MailetError> {
        self.attributes = config
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if self.attributes.is_empty() {
            return Err(MailetError::Config(
                "at least one attribute must be configured".to_string(),
            ));
        }
        Ok(())
    }

    async fn service(
        &self,
        mail: &mut Mail,
        _scope: &[EmailAddress],
        _ctx: &MailetContext,
    ) -> Result<(), MailetError> {
        for (key, value) in &self.attributes {
            mail.set_attribute(key.clone(), serde_json::Value::String(value.clone()));
        }
        Ok(())
    }
}

/// Removes the attributes named in the comma-separated `name` parameter
#[derive(Default)]
pub struct RemoveMailAttribute {
    keys: Vec<String>,
}

#[async_trait]
impl Mailet for RemoveMailAttribute {
    fn name(&self) -> &str {
        "RemoveMailAttribute"
    }

    async fn init(&mut self, config: &MailetConfig) -> Result<(), MailetError> {
        self.keys = config
            .require("name")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if self.keys.is_empty() {
            return Err(MailetError::Config(
                "at least one attribute name must be configured".to_string(),
            ));
        }
        Ok(())
    }

    async fn service(
        &self,
        mail: &mut Mail,
        _scope: &[EmailAddress],
        _ctx: &MailetContext,
    ) -> Result<(), MailetError> {
        for key in &self.keys {
            mail.remove_attribute(key);
        }
        Ok(())
    }
}

/// Prepends a header to the MIME payload. Parameters: `name` and `value`,
/// both required.
#[derive(Default)]
pub struct SetMimeHeader {
    header: String,
    value: String,
}

#[async_trait]
impl Mailet for SetMimeHeader {
    fn name(&self) -> &str {
        "SetMimeHeader"
    }

    async fn init(&mut self, config: &MailetConfig) -> Result<(), MailetError> {
        self.header = config.require("name")?.trim().to_string();
        self.value = config.require("value")?.to_string();
        if self.header.is_empty() {
            return Err(MailetError::Config(
                "header name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn service(
        &self,
        mail: &mut Mail,
        _scope: &[EmailAddress],
        _ctx: &MailetContext,
    ) -> Result<(), MailetError> {
        let mut body = Vec::with_capacity(mail.size() + self.header.len() + self.value.len() + 4);
        body.extend_from_slice(self.header.as_bytes());
        body.extend_from_slice(b": ");
        body.extend_from_slice(self.value.as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(mail.body());
        mail.set_body(body);
        Ok(())
    }
}

/// Sends a short notice about the message back to its envelope sender as a
/// derived null-sender message, then passes the original through.
/// Parameter: `notice` (optional text, defaults to a generic line).
#[derive(Default)]
pub struct NotifySender {
    notice: Option<String>,
}

#[async_trait]
impl Mailet for NotifySender {
    fn name(&self) -> &str {
        "NotifySender"
    }

    async fn init(&mut self, config: &MailetConfig) -> Result<(), MailetError> {
        self.notice = config.get("notice").map(str::to_string);
        Ok(())
    }

    async fn service(
        &self,
        mail: &mut Mail,
        _scope: &[EmailAddress],
        ctx: &MailetContext,
    ) -> Result<(), MailetError> {
        // A null-sender original has nobody to notify, and notifying it
        // would loop bounces forever.
        let Some(sender) = mail.sender().cloned() else {
            return Ok(());
        };

        let notice = self
            .notice
            .as_deref()
            .unwrap_or("Your message was processed by this server.");
        let body = format!(
            "From: <postmaster@{host}>\r\n\
             To: <{sender}>\r\n\
             Subject: Notice from {host}\r\n\
             \r\n\
             {notice}\r\n\
             \r\n\
             Regarding message {name}.\r\n",
            host = ctx.hostname(),
            sender = sender,
            name = mail.name(),
        );

        let derived = Mail::new(None, vec![sender], body.into_bytes());
        ctx.send_mail(derived)?;
        Ok(())
    }
}
