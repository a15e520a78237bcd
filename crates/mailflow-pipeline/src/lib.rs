//! Mailflow Pipeline - the matcher/mailet processing engine
//!
//! This crate implements the routing core of Mailflow: messages flow through
//! named stages, each an ordered list of (matcher, mailet) steps. Matchers
//! select the recipients in scope for a step, mailets act on them and may
//! mutate the message's routing state; the dispatcher re-routes the message
//! between stages until it is consumed. An implicit terminating step at the
//! end of every stage guarantees forward progress.

pub mod builder;
pub mod dispatcher;
pub mod mail;
pub mod mailet;
pub mod mailets;
pub mod matcher;
pub mod matchers;
pub mod registry;
pub mod runtime;
pub mod spool;
pub mod stage;

pub use builder::{PipelineBuilder, StageRegistry};
pub use dispatcher::{Dispatcher, PipelineError};
pub use mail::Mail;
pub use mailet::{Mailet, MailetConfig, MailetContext, MailetError};
pub use matcher::{MatchFailurePolicy, MatchOutcome, Matcher, MatcherConfig, MatcherError};
pub use registry::PluginRegistry;
pub use runtime::{PipelineRuntime, StageInfo, StepInfo};
pub use spool::{PipelineHandle, Spool};
pub use stage::{Stage, Step};
