//! Pipeline builder
//!
//! Turns the declarative stage configuration into a [`StageRegistry`],
//! resolving every matcher and mailet through the plugin registry up
//! front. Any resolution or init failure aborts the build; no partially
//! built pipeline is ever handed out.

use crate::mailet::MailetConfig;
use crate::matcher::MatchFailurePolicy;
use crate::registry::PluginRegistry;
use crate::stage::{Stage, Step};
use mailflow_common::config::{PipelineConfig, StepConfig};
use mailflow_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Default matcher applied when a step declares neither match nor notmatch
const DEFAULT_MATCHER: &str = "All";

/// Name → stage lookup, immutable once built
pub struct StageRegistry {
    stages: HashMap<String, Arc<Stage>>,
}

impl StageRegistry {
    /// The stage answering to `name`, if configured
    pub fn get(&self, name: &str) -> Option<Arc<Stage>> {
        self.stages.get(name).cloned()
    }

    /// Configured stage names, sorted for stable output
    pub fn stage_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of configured stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no stage is configured
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Builds a stage registry from configuration
pub struct PipelineBuilder {
    registry: PluginRegistry,
}

impl PipelineBuilder {
    /// Start a build resolving names through `registry`
    pub fn new(registry: PluginRegistry) -> Self {
        Self { registry }
    }

    /// Consume the builder, producing the stage registry and the plugin
    /// registry now holding every loaded instance for later teardown
    pub async fn build(
        mut self,
        config: &PipelineConfig,
    ) -> Result<(StageRegistry, PluginRegistry)> {
        if config.stages.is_empty() {
            return Err(Error::Config(
                "Pipeline configuration declares no stages".to_string(),
            ));
        }

        let mut stages = HashMap::new();

        for stage_conf in &config.stages {
            if stages.contains_key(&stage_conf.name) {
                return Err(Error::Config(format!(
                    "Duplicate stage name: {}",
                    stage_conf.name
                )));
            }

            let mut steps = Vec::with_capacity(stage_conf.steps.len());
            for step_conf in &stage_conf.steps {
                steps.push(self.build_step(&stage_conf.name, step_conf).await?);
            }

            info!(
                stage = %stage_conf.name,
                steps = steps.len(),
                "Stage assembled"
            );
            stages.insert(
                stage_conf.name.clone(),
                Arc::new(Stage::new(stage_conf.name.clone(), steps)),
            );
        }

        Ok((StageRegistry { stages }, self.registry))
    }

    async fn build_step(&mut self, stage_name: &str, step_conf: &StepConfig) -> Result<Step> {
        let matcher = match (&step_conf.matcher, &step_conf.not_matcher) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(format!(
                    "Stage {}: configure only match or notmatch per step, not both",
                    stage_name
                )));
            }
            (Some(spec), None) => self.registry.load_matcher(spec, false).await?,
            (None, Some(spec)) => self.registry.load_matcher(spec, true).await?,
            (None, None) => self.registry.load_matcher(DEFAULT_MATCHER, false).await?,
        };

        let mailet_config = MailetConfig::new(step_conf.config.clone());
        let mailet = self
            .registry
            .load_mailet(&step_conf.mailet, &mailet_config)
            .await?;

        let on_failure = step_conf
            .on_match_exception
            .as_deref()
            .map(MatchFailurePolicy::parse)
            .unwrap_or_default();

        Ok(Step::new(matcher, mailet, on_failure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_toml(toml: &str) -> PipelineConfig {
        toml::from_str(toml).unwrap()
    }

    #[tokio::test]
    async fn test_build_wires_stages_and_steps() {
        let config = pipeline_toml(
            r#"
            [[stage]]
            name = "root"
            [[stage.step]]
            mailet = "ToProcessor"
            match = "All"
            [stage.step.config]
            processor = "transport"

            [[stage]]
            name = "transport"
            [[stage.step]]
            mailet = "Null"
            notmatch = "SenderIs=noreply@example.com"
            "#,
        );

        let (stages, _registry) = PipelineBuilder::new(PluginRegistry::with_builtins())
            .build(&config)
            .await
            .unwrap();

        assert_eq!(stages.len(), 2);
        assert_eq!(stages.stage_names(), vec!["root", "transport"]);

        let root = stages.get("root").unwrap();
        assert_eq!(root.steps().len(), 1);
        assert_eq!(root.steps()[0].matcher_label(), "All");
        assert_eq!(root.steps()[0].mailet_label(), "ToProcessor");

        let transport = stages.get("transport").unwrap();
        assert_eq!(transport.steps()[0].matcher_label(), "Not(SenderIs)");
    }

    #[tokio::test]
    async fn test_match_and_notmatch_together_is_fatal() {
        let config = pipeline_toml(
            r#"
            [[stage]]
            name = "root"
            [[stage.step]]
            mailet = "Null"
            match = "All"
            notmatch = "All"
            "#,
        );

        let err = PipelineBuilder::new(PluginRegistry::with_builtins())
            .build(&config)
            .await;
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_mailet_aborts_build() {
        let config = pipeline_toml(
            r#"
            [[stage]]
            name = "root"
            [[stage.step]]
            mailet = "DoesNotExist"
            "#,
        );

        let err = PipelineBuilder::new(PluginRegistry::with_builtins())
            .build(&config)
            .await;
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_matcher_defaults_to_all() {
        let config = pipeline_toml(
            r#"
            [[stage]]
            name = "root"
            [[stage.step]]
            mailet = "Null"
            "#,
        );

        let (stages, _registry) = PipelineBuilder::new(PluginRegistry::with_builtins())
            .build(&config)
            .await
            .unwrap();
        let root = stages.get("root").unwrap();
        assert_eq!(root.steps()[0].matcher_label(), "All");
    }

    #[tokio::test]
    async fn test_duplicate_stage_name_is_fatal() {
        let config = pipeline_toml(
            r#"
            [[stage]]
            name = "root"

            [[stage]]
            name = "root"
            "#,
        );

        let err = PipelineBuilder::new(PluginRegistry::with_builtins())
            .build(&config)
            .await;
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_fatal() {
        let config = PipelineConfig::default();
        let err = PipelineBuilder::new(PluginRegistry::with_builtins())
            .build(&config)
            .await;
        assert!(matches!(err, Err(Error::Config(_))));
    }
}
