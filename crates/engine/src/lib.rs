//! Notification orchestration engine.
//!
//! [`Engine`] wires the pieces together:
//! - [`dispatch::Dispatcher`] handles submissions, cancellation and status
//! - [`scheduler::Scheduler`] parks delayed and quiet-hours requests
//! - [`retry::RetrySupervisor`] re-attempts transient failures
//! - [`engagement::EngagementRecorder`] applies provider webhooks
//!
//! All of them share one [`ledger::DeliveryLedger`].

pub mod delivery;
pub mod dispatch;
pub mod engagement;
pub mod escalation;
pub mod ledger;
pub mod pg_ledger;
pub mod preferences;
pub mod quiet_hours;
pub mod retry;
pub mod scheduler;
pub mod templates;

use std::sync::Arc;

use tokio::task::JoinHandle;

use herald_common::config::EngineConfig;
use herald_notifier::ChannelRegistry;

use crate::delivery::Delivery;
use crate::dispatch::Dispatcher;
use crate::engagement::EngagementRecorder;
use crate::escalation::EscalationSink;
use crate::ledger::DeliveryLedger;
use crate::preferences::PreferenceResolver;
use crate::retry::{RetryPolicy, RetrySupervisor};
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct Engine {
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub retry: Arc<RetrySupervisor>,
    pub engagement: Arc<EngagementRecorder>,
    pub ledger: Arc<dyn DeliveryLedger>,
    pub registry: Arc<ChannelRegistry>,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        ledger: Arc<dyn DeliveryLedger>,
        resolver: Arc<dyn PreferenceResolver>,
        registry: Arc<ChannelRegistry>,
        escalation: Arc<dyn EscalationSink>,
        scheduler: Scheduler,
    ) -> Self {
        let delivery = Arc::new(Delivery::new(
            ledger.clone(),
            registry.clone(),
            escalation,
            RetryPolicy::from_config(config),
            config.channel_timeout(),
        ));
        let scheduler = Arc::new(scheduler);

        Self {
            dispatcher: Arc::new(Dispatcher::new(
                delivery.clone(),
                resolver.clone(),
                scheduler.clone(),
                config.clone(),
            )),
            retry: Arc::new(RetrySupervisor::new(delivery, resolver, config)),
            engagement: Arc::new(EngagementRecorder::new(ledger.clone())),
            scheduler,
            ledger,
            registry,
        }
    }

    /// Start the scheduler tick loop and the retry supervisor.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.scheduler.clone().run(self.dispatcher.clone())),
            tokio::spawn(self.retry.clone().run()),
        ]
    }
}
