//! The in-flight mail entity
//!
//! A [`Mail`] is what travels through the pipeline: envelope addressing, the
//! raw MIME payload, an attribute map for inter-step communication, and the
//! routing state naming the stage the message is addressed to next.

use chrono::{DateTime, Utc};
use mailflow_common::types::EmailAddress;
use std::collections::HashMap;
use uuid::Uuid;

/// An in-flight mail message
#[derive(Debug, Clone)]
pub struct Mail {
    name: String,
    sender: Option<EmailAddress>,
    recipients: Vec<EmailAddress>,
    body: Vec<u8>,
    attributes: HashMap<String, serde_json::Value>,
    state: String,
    error_message: Option<String>,
    client_ip: Option<String>,
    last_updated: DateTime<Utc>,
}

impl Mail {
    /// Terminal pseudo-state: the message is consumed and will be discarded
    pub const GHOST: &'static str = "ghost";

    /// Pseudo-state for failed messages; routed like any other state name,
    /// conventionally to a stage named "error"
    pub const ERROR: &'static str = "error";

    /// Conventional entry stage for freshly received messages
    pub const DEFAULT: &'static str = "root";

    /// Create a new mail with a generated unique name
    pub fn new(
        sender: Option<EmailAddress>,
        recipients: Vec<EmailAddress>,
        body: Vec<u8>,
    ) -> Self {
        let name = format!("Mail{}", Uuid::now_v7().simple());
        Self::named(name, sender, recipients, body)
    }

    /// Create a new mail with an explicit name
    pub fn named(
        name: impl Into<String>,
        sender: Option<EmailAddress>,
        recipients: Vec<EmailAddress>,
        body: Vec<u8>,
    ) -> Self {
        let mut mail = Self {
            name: name.into(),
            sender,
            recipients: Vec::new(),
            body,
            attributes: HashMap::new(),
            state: Self::DEFAULT.to_string(),
            error_message: None,
            client_ip: None,
            last_updated: Utc::now(),
        };
        for recipient in recipients {
            if !mail.recipients.contains(&recipient) {
                mail.recipients.push(recipient);
            }
        }
        mail
    }

    /// Set the client IP the message was received from
    pub fn with_client_ip(mut self, ip: Option<String>) -> Self {
        self.client_ip = ip;
        self
    }

    /// Unique name, stable for the message's lifetime in the pipeline
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Envelope sender; None is the null sender used by bounces
    pub fn sender(&self) -> Option<&EmailAddress> {
        self.sender.as_ref()
    }

    /// Current recipient set, in order, without duplicates
    pub fn recipients(&self) -> &[EmailAddress] {
        &self.recipients
    }

    /// Keep only the recipients present in `keep`
    pub fn retain_recipients(&mut self, keep: &[EmailAddress]) {
        self.recipients.retain(|r| keep.contains(r));
        self.touch();
    }

    /// Remove a single recipient; returns whether it was present
    pub fn remove_recipient(&mut self, recipient: &EmailAddress) -> bool {
        let before = self.recipients.len();
        self.recipients.retain(|r| r != recipient);
        self.touch();
        self.recipients.len() != before
    }

    /// Raw MIME payload
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the raw MIME payload
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
        self.touch();
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// Parse the payload on demand; None if the bytes are not a MIME message
    pub fn parsed(&self) -> Option<mail_parser::Message<'_>> {
        mail_parser::MessageParser::default().parse(&self.body)
    }

    /// Current routing state
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Set the routing state; the state is never empty
    pub fn set_state(&mut self, state: &str) {
        debug_assert!(!state.is_empty(), "routing state must not be empty");
        self.state = state.to_string();
        self.touch();
    }

    /// Attribute value for `key`, if set
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    /// Set an attribute, returning the previous value if any
    pub fn set_attribute(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.touch();
        self.attributes.insert(key.into(), value)
    }

    /// Remove an attribute, returning its value if it was set
    pub fn remove_attribute(&mut self, key: &str) -> Option<serde_json::Value> {
        self.touch();
        self.attributes.remove(key)
    }

    /// Attribute keys, for diagnostics
    pub fn attribute_keys(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Error message recorded when the message was denied
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Record why the message failed
    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
        self.touch();
    }

    /// Client IP the message was received from, if known
    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    /// When the message was last mutated
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}
