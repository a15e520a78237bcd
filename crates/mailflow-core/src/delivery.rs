//! Delivery mailets
//!
//! The mailets that take a message out of the pipeline: final delivery
//! into per-recipient storage, and archival into a named repository
//! directory. Both are registered with storage handles by the server at
//! startup rather than through the built-in table.

use async_trait::async_trait;
use mailflow_common::types::EmailAddress;
use mailflow_pipeline::{Mail, Mailet, MailetConfig, MailetContext, MailetError};
use mailflow_storage::MessageStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Delivers the in-scope recipients' copies into local storage.
///
/// Recipients delivered successfully leave the message's recipient set;
/// once none remain the message is consumed. Failed recipients are bundled
/// into a derived message routed to the error stage so the failure is
/// handled by configuration instead of vanishing.
pub struct LocalDelivery {
    store: Arc<MessageStore>,
}

impl LocalDelivery {
    /// Create a local delivery mailet over the given store
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Mailet for LocalDelivery {
    fn name(&self) -> &str {
        "LocalDelivery"
    }

    async fn service(
        &self,
        mail: &mut Mail,
        scope: &[EmailAddress],
        ctx: &MailetContext,
    ) -> Result<(), MailetError> {
        let mut failed: Vec<EmailAddress> = Vec::new();

        for recipient in scope {
            match self
                .store
                .store_message(recipient, mail.name(), mail.body())
                .await
            {
                Ok(path) => {
                    debug!(
                        mail = %mail.name(),
                        recipient = %recipient,
                        path = %path,
                        "Delivered message copy"
                    );
                }
                Err(e) => {
                    warn!(
                        mail = %mail.name(),
                        recipient = %recipient,
                        error = %e,
                        "Local delivery failed"
                    );
                    failed.push(recipient.clone());
                }
            }
        }

        if !failed.is_empty() {
            // Hand the undeliverable subset to the error stage as its own
            // message; the original keeps flowing for everyone else.
            let mut derived = Mail::new(
                mail.sender().cloned(),
                failed.clone(),
                mail.body().to_vec(),
            );
            derived.set_error_message(format!(
                "local delivery failed for {} recipient(s)",
                failed.len()
            ));
            derived.set_state(Mail::ERROR);
            ctx.send_mail(derived)?;
        }

        for recipient in scope {
            mail.remove_recipient(recipient);
        }
        if mail.recipients().is_empty() {
            mail.set_state(Mail::GHOST);
        }
        Ok(())
    }
}

/// Archives the raw message into a repository directory.
///
/// Parameters: `repositoryPath` (required), `passThrough` ("true" to let
/// the message continue; default consumes it).
pub struct ToRepository {
    store: Arc<MessageStore>,
    repository: String,
    pass_through: bool,
}

impl ToRepository {
    /// Create an archival mailet over the given store; the repository path
    /// comes from the step configuration at init time
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self {
            store,
            repository: String::new(),
            pass_through: false,
        }
    }
}

#[async_trait]
impl Mailet for ToRepository {
    fn name(&self) -> &str {
        "ToRepository"
    }

    async fn init(&mut self, config: &MailetConfig) -> Result<(), MailetError> {
        self.repository = config.require("repositoryPath")?.to_string();
        self.pass_through = match config.get("passThrough") {
            None => false,
            Some("true") => true,
            Some("false") => false,
            Some(other) => {
                return Err(MailetError::Config(format!(
                    "passThrough must be true or false, got '{}'",
                    other
                )));
            }
        };
        Ok(())
    }

    async fn service(
        &self,
        mail: &mut Mail,
        _scope: &[EmailAddress],
        _ctx: &MailetContext,
    ) -> Result<(), MailetError> {
        let path = self
            .store
            .archive(&self.repository, mail.name(), mail.body())
            .await
            .map_err(|e| MailetError::Execution(format!("archive failed: {}", e)))?;

        debug!(mail = %mail.name(), path = %path, "Message archived");

        if !self.pass_through {
            mail.set_state(Mail::GHOST);
        }
        Ok(())
    }
}
