//! Dispatcher - the routing state machine
//!
//! The dispatcher resolves a message's routing state to a stage, runs the
//! stage from its first step, and keeps re-dispatching as long as stage
//! runs leave the message addressed to another stage. A hop budget bounds
//! stage-to-stage cycles the per-stage terminator cannot see.

use crate::builder::StageRegistry;
use crate::mail::Mail;
use crate::mailet::{MailetContext, MailetError};
use crate::stage::StageVerdict;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Errors surfaced by a dispatch run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Mailet {mailet} failed in stage {stage}: {source}")]
    Mailet {
        stage: String,
        mailet: String,
        #[source]
        source: MailetError,
    },

    #[error("No stage found for mail {mail} with state {state}")]
    UnroutableState { mail: String, state: String },

    #[error("Mail {mail} exceeded the budget of {budget} stage transitions")]
    HopBudgetExceeded { mail: String, budget: u32 },
}

/// Runs messages through the stage registry until they are consumed
pub struct Dispatcher {
    stages: Arc<StageRegistry>,
    ctx: MailetContext,
    max_hops: u32,
}

impl Dispatcher {
    /// Create a dispatcher over a built stage registry. `max_hops` bounds
    /// stage-to-stage transitions per message; 0 disables the budget.
    pub fn new(stages: Arc<StageRegistry>, ctx: MailetContext, max_hops: u32) -> Self {
        Self {
            stages,
            ctx,
            max_hops,
        }
    }

    /// The context handed to mailets during stage runs
    pub fn context(&self) -> &MailetContext {
        &self.ctx
    }

    /// Process one message to completion. Consumes the message; on return
    /// the message has been disposed, successfully or not.
    ///
    /// Stage switches always restart at step 0 of the target stage. A
    /// message addressed to a state no stage answers to is force-terminated
    /// rather than looped.
    pub async fn dispatch(&self, mut mail: Mail) -> Result<(), PipelineError> {
        let mut hops: u32 = 0;

        loop {
            let state = mail.state().to_string();

            if state == Mail::GHOST {
                self.dispose(mail);
                return Ok(());
            }

            let Some(stage) = self.stages.get(&state) else {
                error!(
                    mail = %mail.name(),
                    state = %state,
                    "No stage answers to this routing state; force-terminating mail"
                );
                let name = mail.name().to_string();
                mail.set_state(Mail::GHOST);
                self.dispose(mail);
                return Err(PipelineError::UnroutableState { mail: name, state });
            };

            match stage.run(&mut mail, &self.ctx).await? {
                StageVerdict::Ghost => {
                    self.dispose(mail);
                    return Ok(());
                }
                StageVerdict::Route(next) => {
                    hops += 1;
                    if self.max_hops > 0 && hops > self.max_hops {
                        error!(
                            mail = %mail.name(),
                            budget = self.max_hops,
                            "Mail bounced between stages past the hop budget; \
                             force-terminating"
                        );
                        let name = mail.name().to_string();
                        mail.set_state(Mail::GHOST);
                        self.dispose(mail);
                        return Err(PipelineError::HopBudgetExceeded {
                            mail: name,
                            budget: self.max_hops,
                        });
                    }
                    debug!(
                        mail = %mail.name(),
                        from = %state,
                        to = %next,
                        "Re-dispatching mail"
                    );
                }
            }
        }
    }

    fn dispose(&self, mail: Mail) {
        debug!(mail = %mail.name(), "Mail disposed");
        drop(mail);
    }
}
