//! Spool - the inbound queue and worker pool
//!
//! Front-ends hand freshly received messages to the spool through a
//! [`PipelineHandle`]; a pool of workers pulls them off the queue and runs
//! each through the dispatcher. Messages are processed concurrently, but a
//! single message's stage traversal stays sequential inside one worker.

use crate::dispatcher::Dispatcher;
use crate::mail::Mail;
use mailflow_common::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Cloneable submission handle; the sole inbound interface to the pipeline
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<Mail>,
}

impl PipelineHandle {
    /// Wrap a raw queue sender; useful when embedding the pipeline without
    /// a running spool
    pub fn from_sender(tx: mpsc::UnboundedSender<Mail>) -> Self {
        Self { tx }
    }

    /// Enqueue a message for processing, entering at `initial_state`.
    /// The message must have at least one recipient.
    pub fn submit(&self, mut mail: Mail, initial_state: &str) -> Result<()> {
        if mail.recipients().is_empty() {
            return Err(Error::Pipeline(
                "cannot submit a mail without recipients".to_string(),
            ));
        }
        mail.set_state(initial_state);
        self.tx
            .send(mail)
            .map_err(|_| Error::Pipeline("the spool is shut down".to_string()))
    }
}

/// The running worker pool
pub struct Spool {
    tx: mpsc::UnboundedSender<Mail>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Spool {
    /// Start `worker_count` workers draining the queue into the dispatcher
    pub fn start(
        dispatcher: Arc<Dispatcher>,
        tx: mpsc::UnboundedSender<Mail>,
        rx: mpsc::UnboundedReceiver<Mail>,
        worker_count: usize,
    ) -> Self {
        let cancel = CancellationToken::new();
        let rx = Arc::new(Mutex::new(rx));
        let worker_count = worker_count.max(1);

        let workers = (0..worker_count)
            .map(|id| {
                let rx = rx.clone();
                let dispatcher = dispatcher.clone();
                let cancel = cancel.clone();
                tokio::spawn(worker_loop(id, rx, dispatcher, cancel))
            })
            .collect();

        Self {
            tx,
            workers,
            cancel,
        }
    }

    /// A submission handle for front-ends and derived-message producers
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop the workers. Messages already being dispatched complete;
    /// queued messages are dropped.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Mail>>>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "Spool worker started");

    loop {
        let mail = tokio::select! {
            _ = cancel.cancelled() => break,
            received = async {
                let mut rx = rx.lock().await;
                rx.recv().await
            } => match received {
                Some(mail) => mail,
                None => break,
            },
        };

        let name = mail.name().to_string();
        if let Err(e) = dispatcher.dispatch(mail).await {
            // The message is gone, the worker is not.
            error!(worker = id, mail = %name, error = %e, "Failed to process mail");
        }
    }

    debug!(worker = id, "Spool worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PipelineBuilder;
    use crate::mailet::{Mailet, MailetContext, MailetError};
    use crate::registry::PluginRegistry;
    use async_trait::async_trait;
    use mailflow_common::config::PipelineConfig;
    use mailflow_common::types::EmailAddress;
    use tokio::sync::mpsc as tokio_mpsc;

    fn addr(s: &str) -> EmailAddress {
        EmailAddress::parse(s).unwrap()
    }

    /// Mailet signalling each serviced mail name over a channel
    struct Signal {
        tx: tokio_mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Mailet for Signal {
        fn name(&self) -> &str {
            "Signal"
        }

        async fn service(
            &self,
            mail: &mut Mail,
            _scope: &[EmailAddress],
            _ctx: &MailetContext,
        ) -> std::result::Result<(), MailetError> {
            let _ = self.tx.send(mail.name().to_string());
            mail.set_state(Mail::GHOST);
            Ok(())
        }
    }

    async fn start_spool(workers: usize) -> (Spool, tokio_mpsc::UnboundedReceiver<String>) {
        let (signal_tx, signal_rx) = tokio_mpsc::unbounded_channel();
        let mut registry = PluginRegistry::with_builtins();
        registry.register_mailet("Signal", move || {
            Box::new(Signal {
                tx: signal_tx.clone(),
            })
        });

        let config: PipelineConfig = toml::from_str(
            r#"
            [[stage]]
            name = "root"
            [[stage.step]]
            mailet = "Signal"
            "#,
        )
        .unwrap();

        let (stages, _registry) = PipelineBuilder::new(registry).build(&config).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = MailetContext::new("mx.test", tx.clone());
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(stages), ctx, 100));

        (Spool::start(dispatcher, tx, rx, workers), signal_rx)
    }

    #[tokio::test]
    async fn test_submitted_mail_is_processed() {
        let (spool, mut signals) = start_spool(2).await;
        let handle = spool.handle();

        let mail = Mail::new(None, vec![addr("x@y.test")], Vec::new());
        let name = mail.name().to_string();
        handle.submit(mail, Mail::DEFAULT).unwrap();

        assert_eq!(signals.recv().await.unwrap(), name);
        spool.shutdown().await;
    }

    #[tokio::test]
    async fn test_multiple_mails_all_processed() {
        let (spool, mut signals) = start_spool(4).await;
        let handle = spool.handle();

        let mut names = Vec::new();
        for i in 0..10 {
            let mail = Mail::new(
                None,
                vec![addr(&format!("user{}@y.test", i))],
                Vec::new(),
            );
            names.push(mail.name().to_string());
            handle.submit(mail, Mail::DEFAULT).unwrap();
        }

        let mut processed = Vec::new();
        for _ in 0..10 {
            processed.push(signals.recv().await.unwrap());
        }
        processed.sort();
        names.sort();
        assert_eq!(processed, names);

        spool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_recipients() {
        let (spool, _signals) = start_spool(1).await;
        let handle = spool.handle();

        let mail = Mail::new(None, Vec::new(), Vec::new());
        assert!(handle.submit(mail, Mail::DEFAULT).is_err());

        spool.shutdown().await;
    }
}
