//! Stage and step execution
//!
//! A stage is an ordered list of (matcher, mailet, failure-policy) steps.
//! Running a message through a stage evaluates each step in declaration
//! order, watching the routing state after every step; an implicit
//! terminating step at the end forces `ghost` so a message can never fall
//! off the end of a stage and survive.

use crate::dispatcher::PipelineError;
use crate::mail::Mail;
use crate::mailet::{Mailet, MailetContext};
use crate::matcher::{MatchFailurePolicy, MatchOutcome, Matcher};
use mailflow_common::types::EmailAddress;
use std::sync::Arc;
use tracing::{debug, warn};

/// One (matcher, mailet, failure-policy) triple within a stage
pub struct Step {
    matcher: Arc<dyn Matcher>,
    mailet: Arc<dyn Mailet>,
    on_failure: MatchFailurePolicy,
    matcher_label: String,
    mailet_label: String,
}

impl Step {
    /// Assemble a step from loaded instances
    pub fn new(
        matcher: Arc<dyn Matcher>,
        mailet: Arc<dyn Mailet>,
        on_failure: MatchFailurePolicy,
    ) -> Self {
        let matcher_label = matcher.name().to_string();
        let mailet_label = mailet.name().to_string();
        Self {
            matcher,
            mailet,
            on_failure,
            matcher_label,
            mailet_label,
        }
    }

    /// Matcher name, for introspection
    pub fn matcher_label(&self) -> &str {
        &self.matcher_label
    }

    /// Mailet name, for introspection
    pub fn mailet_label(&self) -> &str {
        &self.mailet_label
    }
}

/// Where a stage run left the message
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StageVerdict {
    /// The message was consumed and must be disposed
    Ghost,
    /// The message is now addressed to another stage
    Route(String),
}

/// A named, ordered sequence of steps; immutable once built
pub struct Stage {
    name: String,
    steps: Vec<Step>,
}

impl Stage {
    /// Build a stage from its ordered steps
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Stage name, the routing key
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured steps, in execution order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run the message through this stage's steps, starting at step 0.
    ///
    /// Matcher failures are absorbed by the step's failure policy; mailet
    /// errors propagate to the caller. The returned verdict tells the
    /// dispatcher whether to dispose the message or re-dispatch it.
    pub(crate) async fn run(
        &self,
        mail: &mut Mail,
        ctx: &MailetContext,
    ) -> Result<StageVerdict, PipelineError> {
        for step in &self.steps {
            let candidates = mail.recipients().to_vec();

            let outcome = match step.matcher.matches(mail, &candidates).await {
                Ok(hit) => {
                    // The mailet only ever sees a subset of what the matcher
                    // was given, whatever the matcher returned.
                    let scope: Vec<EmailAddress> = candidates
                        .iter()
                        .filter(|c| hit.contains(c))
                        .cloned()
                        .collect();
                    if scope.is_empty() {
                        MatchOutcome::NotMatched
                    } else {
                        MatchOutcome::Matched(scope)
                    }
                }
                Err(e) => MatchOutcome::Failed(e),
            };

            match outcome {
                MatchOutcome::Matched(scope) => {
                    debug!(
                        mail = %mail.name(),
                        stage = %self.name,
                        matcher = %step.matcher_label,
                        mailet = %step.mailet_label,
                        in_scope = scope.len(),
                        "Running mailet"
                    );
                    step.mailet
                        .service(mail, &scope, ctx)
                        .await
                        .map_err(|source| PipelineError::Mailet {
                            stage: self.name.clone(),
                            mailet: step.mailet_label.clone(),
                            source,
                        })?;
                }
                MatchOutcome::NotMatched => {
                    debug!(
                        mail = %mail.name(),
                        stage = %self.name,
                        matcher = %step.matcher_label,
                        "No recipient matched, skipping mailet"
                    );
                }
                MatchOutcome::Failed(e) => {
                    warn!(
                        mail = %mail.name(),
                        stage = %self.name,
                        matcher = %step.matcher_label,
                        error = %e,
                        "Matcher evaluation failed"
                    );
                    match &step.on_failure {
                        MatchFailurePolicy::Deny => {
                            mail.set_error_message(e.to_string());
                            mail.set_state(Mail::ERROR);
                        }
                        MatchFailurePolicy::Decline => {}
                        MatchFailurePolicy::RouteTo(stage) => {
                            mail.set_state(stage);
                        }
                    }
                }
            }

            if mail.state() == Mail::GHOST {
                return Ok(StageVerdict::Ghost);
            }
            if mail.state() != self.name {
                return Ok(StageVerdict::Route(mail.state().to_string()));
            }
        }

        // Implicit terminating step: nothing redirected the message, so it
        // is consumed here rather than looping. Falling off the end of the
        // error stage is the normal fate of a denied message and not worth
        // a warning.
        if mail.state() != Mail::ERROR {
            warn!(
                mail = %mail.name(),
                stage = %self.name,
                "Message reached the end of this stage and is automatically \
                 deleted. This may indicate a configuration error."
            );
        }
        mail.set_state(Mail::GHOST);
        Ok(StageVerdict::Ghost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailet::{MailetConfig, MailetError};
    use crate::matcher::{MatcherConfig, MatcherError};
    use crate::matchers::All;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn addr(s: &str) -> EmailAddress {
        EmailAddress::parse(s).unwrap()
    }

    fn test_ctx() -> (MailetContext, mpsc::UnboundedReceiver<Mail>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MailetContext::new("mx.test", tx), rx)
    }

    fn sample_mail() -> Mail {
        Mail::new(
            Some(addr("a@b.test")),
            vec![addr("c@d.test")],
            b"Subject: t\r\n\r\nx".to_vec(),
        )
    }

    /// Mailet that records each invocation and leaves the mail untouched
    struct Recorder {
        marker: String,
        hits: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Mailet for Recorder {
        fn name(&self) -> &str {
            "Recorder"
        }

        async fn service(
            &self,
            _mail: &mut Mail,
            _scope: &[EmailAddress],
            _ctx: &MailetContext,
        ) -> Result<(), MailetError> {
            self.hits.lock().unwrap().push(self.marker.clone());
            Ok(())
        }
    }

    /// Mailet that sets the routing state to a fixed value
    struct SetState(&'static str);

    #[async_trait]
    impl Mailet for SetState {
        fn name(&self) -> &str {
            "SetState"
        }

        async fn service(
            &self,
            mail: &mut Mail,
            _scope: &[EmailAddress],
            _ctx: &MailetContext,
        ) -> Result<(), MailetError> {
            mail.set_state(self.0);
            Ok(())
        }
    }

    /// Matcher that always fails to evaluate
    struct Throwing;

    #[async_trait]
    impl Matcher for Throwing {
        fn name(&self) -> &str {
            "Throwing"
        }

        async fn matches(
            &self,
            _mail: &Mail,
            _candidates: &[EmailAddress],
        ) -> Result<Vec<EmailAddress>, MatcherError> {
            Err(MatcherError::Evaluation("boom".to_string()))
        }
    }

    /// Matcher that returns recipients outside the candidate set
    struct Overreaching;

    #[async_trait]
    impl Matcher for Overreaching {
        fn name(&self) -> &str {
            "Overreaching"
        }

        async fn matches(
            &self,
            _mail: &Mail,
            candidates: &[EmailAddress],
        ) -> Result<Vec<EmailAddress>, MatcherError> {
            let mut hit = candidates.to_vec();
            hit.push(addr("smuggled@evil.test"));
            Ok(hit)
        }
    }

    /// Mailet capturing the scope it was invoked with
    struct ScopeProbe {
        seen: Arc<Mutex<Vec<Vec<EmailAddress>>>>,
    }

    #[async_trait]
    impl Mailet for ScopeProbe {
        fn name(&self) -> &str {
            "ScopeProbe"
        }

        async fn service(
            &self,
            _mail: &mut Mail,
            scope: &[EmailAddress],
            _ctx: &MailetContext,
        ) -> Result<(), MailetError> {
            self.seen.lock().unwrap().push(scope.to_vec());
            Ok(())
        }
    }

    fn step(matcher: impl Matcher + 'static, mailet: impl Mailet + 'static) -> Step {
        Step::new(
            Arc::new(matcher),
            Arc::new(mailet),
            MatchFailurePolicy::default(),
        )
    }

    fn step_with_policy(
        matcher: impl Matcher + 'static,
        mailet: impl Mailet + 'static,
        policy: MatchFailurePolicy,
    ) -> Step {
        Step::new(Arc::new(matcher), Arc::new(mailet), policy)
    }

    // Scenario: a no-op step leaves the state alone, so the implicit
    // terminator consumes the message.
    #[tokio::test]
    async fn test_unchanged_state_terminates_in_ghost() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let stage = Stage::new(
            "root",
            vec![step(
                All,
                Recorder {
                    marker: "noop".to_string(),
                    hits: hits.clone(),
                },
            )],
        );

        let (ctx, _rx) = test_ctx();
        let mut mail = sample_mail();
        let verdict = stage.run(&mut mail, &ctx).await.unwrap();

        assert_eq!(verdict, StageVerdict::Ghost);
        assert_eq!(mail.state(), Mail::GHOST);
        assert_eq!(hits.lock().unwrap().as_slice(), &["noop".to_string()]);
    }

    // Scenario: a state change stops the stage and yields a route verdict.
    #[tokio::test]
    async fn test_state_change_stops_stage() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let stage = Stage::new(
            "root",
            vec![
                step(All, SetState("transport")),
                step(
                    All,
                    Recorder {
                        marker: "never".to_string(),
                        hits: hits.clone(),
                    },
                ),
            ],
        );

        let (ctx, _rx) = test_ctx();
        let mut mail = sample_mail();
        let verdict = stage.run(&mut mail, &ctx).await.unwrap();

        assert_eq!(verdict, StageVerdict::Route("transport".to_string()));
        assert_eq!(mail.state(), "transport");
        assert!(hits.lock().unwrap().is_empty());
    }

    // Scenario: an explicit ghost mid-stage skips the remaining steps.
    #[tokio::test]
    async fn test_ghost_mid_stage_skips_rest() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let stage = Stage::new(
            "root",
            vec![
                step(All, SetState(Mail::GHOST)),
                step(
                    All,
                    Recorder {
                        marker: "unreached".to_string(),
                        hits: hits.clone(),
                    },
                ),
                step(
                    All,
                    Recorder {
                        marker: "unreached2".to_string(),
                        hits: hits.clone(),
                    },
                ),
            ],
        );

        let (ctx, _rx) = test_ctx();
        let mut mail = sample_mail();
        let verdict = stage.run(&mut mail, &ctx).await.unwrap();

        assert_eq!(verdict, StageVerdict::Ghost);
        assert!(hits.lock().unwrap().is_empty());
    }

    // Scenario: a declining failure policy treats a broken matcher as a
    // no-match and the message continues unchanged.
    #[tokio::test]
    async fn test_decline_policy_continues() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let stage = Stage::new(
            "root",
            vec![
                step_with_policy(
                    Throwing,
                    Recorder {
                        marker: "skipped".to_string(),
                        hits: hits.clone(),
                    },
                    MatchFailurePolicy::Decline,
                ),
                step(
                    All,
                    Recorder {
                        marker: "next".to_string(),
                        hits: hits.clone(),
                    },
                ),
            ],
        );

        let (ctx, _rx) = test_ctx();
        let mut mail = sample_mail();
        let verdict = stage.run(&mut mail, &ctx).await.unwrap();

        assert_eq!(verdict, StageVerdict::Ghost);
        assert_eq!(hits.lock().unwrap().as_slice(), &["next".to_string()]);
        assert!(mail.error_message().is_none());
    }

    // Scenario: the default policy denies the message on matcher failure.
    #[tokio::test]
    async fn test_default_policy_denies() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let stage = Stage::new(
            "root",
            vec![
                step(
                    Throwing,
                    Recorder {
                        marker: "skipped".to_string(),
                        hits: hits.clone(),
                    },
                ),
                step(
                    All,
                    Recorder {
                        marker: "never".to_string(),
                        hits: hits.clone(),
                    },
                ),
            ],
        );

        let (ctx, _rx) = test_ctx();
        let mut mail = sample_mail();
        let verdict = stage.run(&mut mail, &ctx).await.unwrap();

        assert_eq!(verdict, StageVerdict::Route(Mail::ERROR.to_string()));
        assert_eq!(mail.state(), Mail::ERROR);
        assert!(mail.error_message().unwrap().contains("boom"));
        assert!(hits.lock().unwrap().is_empty());
    }

    // Scenario: a named-stage policy redirects immediately.
    #[tokio::test]
    async fn test_route_to_policy_redirects() {
        let stage = Stage::new(
            "root",
            vec![step_with_policy(
                Throwing,
                SetState("unused"),
                MatchFailurePolicy::RouteTo("quarantine".to_string()),
            )],
        );

        let (ctx, _rx) = test_ctx();
        let mut mail = sample_mail();
        let verdict = stage.run(&mut mail, &ctx).await.unwrap();

        assert_eq!(verdict, StageVerdict::Route("quarantine".to_string()));
    }

    // A zero-step stage behaves exactly like a terminator-only stage.
    #[tokio::test]
    async fn test_empty_stage_is_terminator_only() {
        let stage = Stage::new("root", Vec::new());
        let (ctx, _rx) = test_ctx();
        let mut mail = sample_mail();

        let verdict = stage.run(&mut mail, &ctx).await.unwrap();
        assert_eq!(verdict, StageVerdict::Ghost);
        assert_eq!(mail.state(), Mail::GHOST);
    }

    // The scope handed to a mailet is always a subset of the candidates the
    // matcher was given, even against a misbehaving matcher.
    #[tokio::test]
    async fn test_scope_is_narrowed_to_candidates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stage = Stage::new(
            "root",
            vec![step(Overreaching, ScopeProbe { seen: seen.clone() })],
        );

        let (ctx, _rx) = test_ctx();
        let mut mail = sample_mail();
        stage.run(&mut mail, &ctx).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec![addr("c@d.test")]);
    }

    // A mailet error propagates out of the stage run untouched by any
    // failure policy.
    #[tokio::test]
    async fn test_mailet_error_propagates() {
        struct Exploding;

        #[async_trait]
        impl Mailet for Exploding {
            fn name(&self) -> &str {
                "Exploding"
            }

            async fn service(
                &self,
                _mail: &mut Mail,
                _scope: &[EmailAddress],
                _ctx: &MailetContext,
            ) -> Result<(), MailetError> {
                Err(MailetError::Execution("mailet blew up".to_string()))
            }
        }

        let stage = Stage::new("root", vec![step(All, Exploding)]);
        let (ctx, _rx) = test_ctx();
        let mut mail = sample_mail();

        let err = stage.run(&mut mail, &ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Mailet { .. }));
    }

    // The stage run is bounded by its step count: a stage of N no-op steps
    // executes each exactly once before the terminator fires.
    #[tokio::test]
    async fn test_stage_run_is_bounded() {
        let count = Arc::new(AtomicUsize::new(0));

        struct Tick(Arc<AtomicUsize>);

        #[async_trait]
        impl Mailet for Tick {
            fn name(&self) -> &str {
                "Tick"
            }

            async fn service(
                &self,
                _mail: &mut Mail,
                _scope: &[EmailAddress],
                _ctx: &MailetContext,
            ) -> Result<(), MailetError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let steps = (0..5).map(|_| step(All, Tick(count.clone()))).collect();
        let stage = Stage::new("root", steps);

        let (ctx, _rx) = test_ctx();
        let mut mail = sample_mail();
        stage.run(&mut mail, &ctx).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(mail.state(), Mail::GHOST);
    }

    #[tokio::test]
    async fn test_default_init_hooks_accept_any_config() {
        let mut all = All;
        all.init(&MatcherConfig::with_condition("ignored"))
            .await
            .unwrap();

        let mut recorder = Recorder {
            marker: String::new(),
            hits: Arc::new(Mutex::new(Vec::new())),
        };
        recorder.init(&MailetConfig::default()).await.unwrap();
    }
}
