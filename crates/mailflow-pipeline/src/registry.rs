//! Plugin registry
//!
//! An explicit registration table resolving matcher and mailet names to
//! factory functions. Instances are created and initialized once at
//! pipeline build time, shared read-only afterwards, and torn down exactly
//! once at shutdown.

use crate::mailet::{Mailet, MailetConfig};
use crate::matcher::{Matcher, MatcherConfig, MatcherInverter};
use mailflow_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

type MatcherFactory = Box<dyn Fn() -> Box<dyn Matcher> + Send + Sync>;
type MailetFactory = Box<dyn Fn() -> Box<dyn Mailet> + Send + Sync>;

/// Name-to-factory tables plus the ledger of loaded instances
#[derive(Default)]
pub struct PluginRegistry {
    matcher_factories: HashMap<String, MatcherFactory>,
    mailet_factories: HashMap<String, MailetFactory>,
    loaded_matchers: Vec<Arc<dyn Matcher>>,
    loaded_mailets: Vec<Arc<dyn Mailet>>,
}

impl PluginRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in matchers and mailets
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::matchers::register(&mut registry);
        crate::mailets::register(&mut registry);
        registry
    }

    /// Register a matcher factory under `name`
    pub fn register_matcher<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Matcher> + Send + Sync + 'static,
    {
        self.matcher_factories
            .insert(name.to_string(), Box::new(factory));
    }

    /// Register a mailet factory under `name`
    pub fn register_mailet<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Mailet> + Send + Sync + 'static,
    {
        self.mailet_factories
            .insert(name.to_string(), Box::new(factory));
    }

    /// Registered matcher names, sorted
    pub fn matcher_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.matcher_factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered mailet names, sorted
    pub fn mailet_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.mailet_factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a matcher specification of the form `Name` or
    /// `Name=condition`, initialize the instance, and record it for
    /// teardown. With `inverted`, the instance is wrapped so it selects the
    /// complement of the inner matcher's recipients.
    pub async fn load_matcher(&mut self, spec: &str, inverted: bool) -> Result<Arc<dyn Matcher>> {
        let (name, condition) = match spec.split_once('=') {
            Some((name, condition)) => (name.trim(), Some(condition.to_string())),
            None => (spec.trim(), None),
        };

        let factory = self
            .matcher_factories
            .get(name)
            .ok_or_else(|| Error::Config(format!("Unknown matcher: {}", name)))?;

        let mut instance = factory();
        let config = MatcherConfig { condition };
        instance
            .init(&config)
            .await
            .map_err(|e| Error::Config(format!("Unable to init matcher {}: {}", name, e)))?;

        let instance: Arc<dyn Matcher> = if inverted {
            Arc::new(MatcherInverter::new(instance))
        } else {
            Arc::from(instance)
        };

        info!(matcher = %instance.name(), "Matcher instantiated");
        self.loaded_matchers.push(instance.clone());
        Ok(instance)
    }

    /// Resolve a mailet by name, initialize it with `config`, and record it
    /// for teardown
    pub async fn load_mailet(&mut self, name: &str, config: &MailetConfig) -> Result<Arc<dyn Mailet>> {
        let factory = self
            .mailet_factories
            .get(name)
            .ok_or_else(|| Error::Config(format!("Unknown mailet: {}", name)))?;

        let mut instance = factory();
        instance
            .init(config)
            .await
            .map_err(|e| Error::Config(format!("Unable to init mailet {}: {}", name, e)))?;

        let instance: Arc<dyn Mailet> = Arc::from(instance);
        info!(mailet = %instance.name(), "Mailet instantiated");
        self.loaded_mailets.push(instance.clone());
        Ok(instance)
    }

    /// Invoke every loaded instance's teardown hook exactly once. Teardown
    /// errors are logged and do not block teardown of the remaining
    /// instances.
    pub async fn teardown_all(&self) {
        debug!(
            matchers = self.loaded_matchers.len(),
            mailets = self.loaded_mailets.len(),
            "Tearing down loaded plugin instances"
        );

        for mailet in &self.loaded_mailets {
            if let Err(e) = mailet.destroy().await {
                warn!(mailet = %mailet.name(), error = %e, "Mailet teardown failed");
            }
        }

        for matcher in &self.loaded_matchers {
            if let Err(e) = matcher.destroy().await {
                warn!(matcher = %matcher.name(), error = %e, "Matcher teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::Mail;
    use crate::mailet::{MailetContext, MailetError};
    use async_trait::async_trait;
    use mailflow_common::types::EmailAddress;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMailet {
        destroyed: Arc<AtomicUsize>,
        fail_teardown: bool,
    }

    #[async_trait]
    impl Mailet for CountingMailet {
        fn name(&self) -> &str {
            "Counting"
        }

        async fn service(
            &self,
            _mail: &mut Mail,
            _scope: &[EmailAddress],
            _ctx: &MailetContext,
        ) -> std::result::Result<(), MailetError> {
            Ok(())
        }

        async fn destroy(&self) -> std::result::Result<(), MailetError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            if self.fail_teardown {
                Err(MailetError::Execution("teardown exploded".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_names_are_config_errors() {
        let mut registry = PluginRegistry::with_builtins();

        let err = registry.load_matcher("NoSuchMatcher", false).await;
        assert!(matches!(err, Err(Error::Config(_))));

        let err = registry
            .load_mailet("NoSuchMailet", &MailetConfig::default())
            .await;
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_condition_parsing() {
        let mut registry = PluginRegistry::with_builtins();

        // Condition required but absent -> init failure -> config error
        let err = registry.load_matcher("RecipientIs", false).await;
        assert!(matches!(err, Err(Error::Config(_))));

        let matcher = registry
            .load_matcher("RecipientIs=admin@example.com", false)
            .await
            .unwrap();
        assert_eq!(matcher.name(), "RecipientIs");
    }

    #[tokio::test]
    async fn test_teardown_runs_once_per_instance_and_tolerates_errors() {
        let destroyed = Arc::new(AtomicUsize::new(0));

        let mut registry = PluginRegistry::new();
        let counter = destroyed.clone();
        registry.register_mailet("Counting", move || {
            Box::new(CountingMailet {
                destroyed: counter.clone(),
                fail_teardown: false,
            })
        });
        let counter = destroyed.clone();
        registry.register_mailet("Exploding", move || {
            Box::new(CountingMailet {
                destroyed: counter.clone(),
                fail_teardown: true,
            })
        });

        // The same mailet name loaded twice yields two distinct instances
        registry
            .load_mailet("Counting", &MailetConfig::default())
            .await
            .unwrap();
        registry
            .load_mailet("Exploding", &MailetConfig::default())
            .await
            .unwrap();
        registry
            .load_mailet("Counting", &MailetConfig::default())
            .await
            .unwrap();

        registry.teardown_all().await;
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_inverted_matcher_teardown_not_doubled() {
        let mut registry = PluginRegistry::with_builtins();
        let inverted = registry.load_matcher("All", true).await.unwrap();
        assert_eq!(inverted.name(), "Not(All)");

        // Only the wrapping inverter is in the ledger; teardown forwards to
        // the inner matcher through it
        registry.teardown_all().await;
    }
}
