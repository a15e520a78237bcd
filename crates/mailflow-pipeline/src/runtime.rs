//! Pipeline runtime
//!
//! A [`PipelineRuntime`] is the single owned value tying the pieces
//! together: the stage registry built from configuration, the plugin
//! registry holding every loaded instance, and the spool worker pool.
//! It is created once at startup and handed by reference to whoever needs
//! to submit messages or introspect the pipeline.

use crate::builder::{PipelineBuilder, StageRegistry};
use crate::dispatcher::Dispatcher;
use crate::mailet::MailetContext;
use crate::registry::PluginRegistry;
use crate::spool::{PipelineHandle, Spool};
use mailflow_common::config::{PipelineConfig, SpoolConfig};
use mailflow_common::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Read-only description of one configured stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInfo {
    pub name: String,
    pub steps: Vec<StepInfo>,
}

/// Read-only description of one configured step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    pub matcher: String,
    pub mailet: String,
}

/// The built and running pipeline
pub struct PipelineRuntime {
    registry: PluginRegistry,
    stages: Arc<StageRegistry>,
    spool: Spool,
}

impl PipelineRuntime {
    /// Build the stages from configuration and start the spool workers.
    /// Any configuration error aborts here, before anything is running.
    pub async fn start(
        pipeline: &PipelineConfig,
        spool: &SpoolConfig,
        hostname: &str,
        registry: PluginRegistry,
    ) -> Result<Self> {
        let (stages, registry) = PipelineBuilder::new(registry).build(pipeline).await?;
        let stages = Arc::new(stages);

        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = MailetContext::new(hostname, tx.clone());
        let dispatcher = Arc::new(Dispatcher::new(stages.clone(), ctx, pipeline.max_hops));
        let spool = Spool::start(dispatcher, tx, rx, spool.workers);

        Ok(Self {
            registry,
            stages,
            spool,
        })
    }

    /// Submission handle for front-ends
    pub fn handle(&self) -> PipelineHandle {
        self.spool.handle()
    }

    /// The built stage registry
    pub fn stages(&self) -> &StageRegistry {
        &self.stages
    }

    /// Enumerate stages and their ordered (matcher, mailet) steps, for
    /// monitoring and operator introspection
    pub fn describe(&self) -> Vec<StageInfo> {
        self.stages
            .stage_names()
            .into_iter()
            .filter_map(|name| self.stages.get(name))
            .map(|stage| StageInfo {
                name: stage.name().to_string(),
                steps: stage
                    .steps()
                    .iter()
                    .map(|step| StepInfo {
                        matcher: step.matcher_label().to_string(),
                        mailet: step.mailet_label().to_string(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Stop the workers and tear down every loaded matcher and mailet
    /// exactly once
    pub async fn shutdown(self) {
        self.spool.shutdown().await;
        self.registry.teardown_all().await;
    }
}
