//! Shared dependency container.
//!
//! `PipelineDeps` holds every collaborator behind its trait so production
//! wiring (Postgres + NATS + real providers) and test wiring (in-memory
//! stores + scripted senders) build the same components.

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::domains::campaigns::{RunStore, StatsAggregator};
use crate::domains::contacts::ContactRepository;
use crate::domains::pipeline::failure_log::FailureLog;
use crate::domains::pipeline::processor::{JobProcessor, ProcessorConfig};
use crate::domains::pipeline::queue::TenantConfigCache;
use crate::domains::pipeline::reconciler::WebhookReconciler;
use crate::domains::pipeline::senders::SenderRegistry;
use crate::domains::pipeline::store::JobStore;
use crate::domains::templates::TemplateService;
use crate::kernel::events::EventPublisher;

#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn JobStore>,
    pub failures: Arc<dyn FailureLog>,
    pub runs: Arc<dyn RunStore>,
    pub contacts: Arc<dyn ContactRepository>,
    pub templates: Arc<dyn TemplateService>,
    pub senders: Arc<SenderRegistry>,
    pub events: EventPublisher,
    pub tenant_configs: Arc<TenantConfigCache>,
}

impl PipelineDeps {
    pub fn stats(&self) -> StatsAggregator {
        StatsAggregator::new(self.runs.clone(), self.store.clone(), self.events.clone())
    }

    pub fn processor(&self, config: &PipelineConfig) -> JobProcessor {
        JobProcessor::new(
            self.store.clone(),
            self.failures.clone(),
            self.contacts.clone(),
            self.templates.clone(),
            self.senders.clone(),
            self.stats(),
            self.events.clone(),
            ProcessorConfig::from(config),
        )
    }

    pub fn reconciler(&self) -> WebhookReconciler {
        WebhookReconciler::new(
            self.store.clone(),
            self.failures.clone(),
            self.contacts.clone(),
            self.events.clone(),
        )
    }
}
