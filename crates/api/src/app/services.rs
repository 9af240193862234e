//! Engine wiring: in-memory stores for dev/test, Postgres when `DATABASE_URL` is set.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use hookrelay_core::RetryPolicy;
use hookrelay_infra::{
    config::EngineConfig,
    db,
    delivery::{
        DeliveryClient, HandlebarsRenderer, InMemoryTemplateRepository, PostgresTemplateRepository,
        Processor, ReqwestDeliveryClient, TemplateRepository,
    },
    dispatcher::Dispatcher,
    intake::NotificationService,
    jobs::{InMemoryJobStore, JobStore, PostgresJobStore},
    leader::{InMemoryLeaseStore, LeaderElection, LeaseStore, PostgresLeaseStore},
    monitor::{LogAlarmSink, SystemMonitor},
    queue::QueueManager,
    workers::TaskHandle,
};

/// Storage backend the services were built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    InMemory,
    Postgres,
}

/// Everything the handlers and background tasks share.
pub struct AppServices {
    pub intake: NotificationService,
    pub templates: Arc<dyn TemplateRepository>,
    pub queue: Arc<QueueManager>,
    pub leader: Arc<LeaderElection>,
    pub dispatcher: Arc<Dispatcher>,
    pub monitor: Arc<SystemMonitor>,
    backend: Backend,
}

/// The three stores an instance runs on.
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub templates: Arc<dyn TemplateRepository>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            leases: Arc::new(InMemoryLeaseStore::new()),
            templates: Arc::new(InMemoryTemplateRepository::new()),
        }
    }
}

/// Build services from configuration, connecting to Postgres when configured.
pub async fn build_services(config: &EngineConfig) -> anyhow::Result<AppServices> {
    match &config.database_url {
        Some(url) => build_persistent_services(config, url).await,
        None => {
            info!("DATABASE_URL not set; using in-memory stores");
            build_in_memory_services(config)
        }
    }
}

pub fn build_in_memory_services(config: &EngineConfig) -> anyhow::Result<AppServices> {
    AppServices::wire(config, Stores::in_memory(), Backend::InMemory)
}

/// In-memory services over caller-provided stores, e.g. a lease store shared
/// by several instances in one process.
pub fn build_services_with(config: &EngineConfig, stores: Stores) -> anyhow::Result<AppServices> {
    AppServices::wire(config, stores, Backend::InMemory)
}

async fn build_persistent_services(config: &EngineConfig, url: &str) -> anyhow::Result<AppServices> {
    let pool = db::connect(url, config.database_max_connections)
        .await
        .context("failed to connect to Postgres")?;
    db::migrate(&pool)
        .await
        .context("failed to prepare database schema")?;

    let stores = Stores {
        jobs: Arc::new(PostgresJobStore::new(pool.clone())),
        leases: Arc::new(PostgresLeaseStore::new(pool.clone())),
        templates: Arc::new(PostgresTemplateRepository::new(pool)),
    };
    AppServices::wire(config, stores, Backend::Postgres)
}

impl AppServices {
    fn wire(config: &EngineConfig, stores: Stores, backend: Backend) -> anyhow::Result<Self> {
        let client: Arc<dyn DeliveryClient> = Arc::new(
            ReqwestDeliveryClient::new(config.dispatcher.dispatch_timeout)
                .context("failed to build HTTP client")?,
        );

        let queue = Arc::new(QueueManager::new());
        let leader = Arc::new(LeaderElection::new(stores.leases, config.lease.clone()));
        let processor = Arc::new(Processor::new(
            Arc::clone(&stores.jobs),
            client,
            Arc::new(HandlebarsRenderer::new(Arc::clone(&stores.templates))),
            RetryPolicy::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            processor,
            Arc::clone(&stores.jobs),
            Arc::clone(&leader),
            config.dispatcher.clone(),
        ));
        let monitor = Arc::new(SystemMonitor::new(
            Arc::clone(&stores.jobs),
            Arc::clone(&leader),
            Arc::new(LogAlarmSink),
            config.monitor.clone(),
        ));
        let intake = NotificationService::new(
            stores.jobs,
            Arc::clone(&stores.templates),
            Arc::clone(&queue),
            Arc::clone(&leader),
        );

        Ok(Self {
            intake,
            templates: stores.templates,
            queue,
            leader,
            dispatcher,
            monitor,
            backend,
        })
    }

    pub fn backend(&self) -> &'static str {
        match self.backend {
            Backend::InMemory => "in-memory",
            Backend::Postgres => "postgres",
        }
    }

    /// Spawn the heartbeat, lane consumers, recovery poller and health monitor.
    pub fn start(&self) -> Vec<TaskHandle> {
        let mut tasks = vec![Arc::clone(&self.leader).spawn()];
        tasks.extend(Arc::clone(&self.dispatcher).spawn());
        tasks.push(Arc::clone(&self.monitor).spawn());
        tasks
    }

    /// Stop background tasks and wake any consumer still waiting on the queue.
    pub async fn stop(&self, tasks: Vec<TaskHandle>) {
        self.queue.close();
        for task in tasks {
            task.shutdown().await;
        }
        info!("background tasks stopped");
    }
}
