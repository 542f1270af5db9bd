//! Keyrelay - Credential-aware dispatch core for LLM gateways
//!
//! Sits between a gateway's HTTP surface and its upstream providers: picks a
//! credential for every request, keeps per-key quotas honest, fails over when
//! a provider misbehaves, serves repeated requests from cache and defers very
//! large requests to a bounded worker queue.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod admin;
pub mod api;
pub mod breaker;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod limits;
pub mod logging;
pub mod queue;
pub mod router;
pub mod store;

pub use admin::{Admin, ConfigSnapshot, ImportMode, ImportReport, Overview, UsageStats};
pub use api::{Completion, DispatchOutcome, InboundRequest, Message, NormalizedRequest, ResponseSource};
pub use client::{ConnectorRouter, HttpConnector, UpstreamConnector, UpstreamReply};
pub use clock::{Clock, ManualClock, SharedClock};
pub use config::{ConfigLoader, GatewayConfig};
pub use dispatch::{DispatchCore, Dispatcher};
pub use error::{RelayError, Result};
pub use queue::{JobId, JobStatus, Priority};
pub use router::{Credential, Permission, Provider, Strategy};
pub use store::{CredentialStore, JsonFileCredentialStore, MemoryCredentialStore};

use breaker::BreakerRegistry;
use cache::{CacheStats, ResponseCache};
use limits::{RateLimiter, UsageLedger};
use queue::{JobExecutor, OverflowQueue, QueueStats};
use router::{CredentialPool, Selector};

/// Period of the background task that drops stale queue results and purges
/// retired credentials
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Assembles a [`Gateway`] from a configuration plus optional overrides
pub struct GatewayBuilder {
    config: GatewayConfig,
    clock: Option<SharedClock>,
    store: Option<Arc<dyn CredentialStore>>,
    connectors: ConnectorRouter,
    fallback: Option<Arc<dyn UpstreamConnector>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            connectors: ConnectorRouter::new(),
            fallback: None,
        }
    }

    /// Use a custom clock (tests drive time with [`ManualClock`])
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Persist administrative edits through `store`
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Serve one provider with a dedicated connector
    pub fn with_connector(self, provider_id: impl Into<String>, connector: Arc<dyn UpstreamConnector>) -> Self {
        self.connectors.route(provider_id, connector);
        self
    }

    /// Connector for every provider without a dedicated one. Defaults to an
    /// [`HttpConnector`] built from the provider configs.
    pub fn with_fallback_connector(mut self, connector: Arc<dyn UpstreamConnector>) -> Self {
        self.fallback = Some(connector);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(clock::system_clock);

        let pool = Arc::new(CredentialPool::new());
        for (id, provider) in &config.providers {
            pool.upsert_provider(provider.to_provider(id));
        }
        for credential in config.build_credentials(clock.now()) {
            pool.upsert(credential)?;
        }

        let ledger = Arc::new(UsageLedger::new(clock.clone()));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.to_config(), clock.clone()));
        let selector = Arc::new(Selector::new(
            pool,
            RateLimiter::new(ledger),
            breakers,
            config.dispatch.default_strategy,
        ));

        let fallback: Arc<dyn UpstreamConnector> = match self.fallback {
            Some(connector) => connector,
            None => Arc::new(http_connector(&config)?),
        };
        let connector: Arc<dyn UpstreamConnector> = Arc::new(self.connectors.with_fallback(fallback));

        let cache = Arc::new(ResponseCache::new(config.cache.to_config(), clock.clone()));
        let queue = Arc::new(OverflowQueue::new(config.queue.to_config(), clock.clone()));
        let core = Arc::new(DispatchCore::new(
            selector.clone(),
            cache,
            connector,
            config.dispatch.attempt_timeout(),
            clock.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(core, queue, config.dispatch.clone()));

        let store: Arc<dyn CredentialStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryCredentialStore::new()),
        };
        let admin = Arc::new(Admin::new(
            selector,
            store,
            clock.clone(),
            config.dispatch.rotation_grace(),
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Gateway {
            config,
            clock,
            dispatcher,
            admin,
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// HTTP connector with one endpoint per enabled provider
fn http_connector(config: &GatewayConfig) -> Result<HttpConnector> {
    let http = HttpConnector::new()?;
    for (id, provider) in config.providers.iter().filter(|(_, p)| p.enabled) {
        http.register(id.clone(), provider.to_endpoint()?);
    }
    Ok(http)
}

/// The assembled dispatch core
pub struct Gateway {
    config: GatewayConfig,
    clock: SharedClock,
    dispatcher: Arc<Dispatcher>,
    admin: Arc<Admin>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Create a gateway from the default configuration locations
    pub fn new() -> Result<Self> {
        let loader = ConfigLoader::new()?;
        Self::from_config(loader.into_config())
    }

    /// Create a gateway with a custom config path
    pub fn with_config_path(path: impl AsRef<Path>) -> Result<Self> {
        let loader = ConfigLoader::from_path(path)?;
        Self::from_config(loader.into_config())
    }

    /// Create a gateway from a config object, talking HTTP to every provider
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        GatewayBuilder::new(config).build()
    }

    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Load stored credentials and start the background tasks: queue
    /// workers, cache sweeper and janitor. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.admin.sync_from_store().await?;

        let queue = self.dispatcher.queue();
        let executor: Arc<dyn JobExecutor> = self.dispatcher.core().clone();
        let mut tasks = vec![queue.start(executor)];

        let cache = self.dispatcher.core().cache();
        if cache.is_enabled() {
            tasks.push(cache.spawn_sweeper(self.shutdown.subscribe()));
        }
        tasks.push(self.spawn_janitor());

        self.tasks.lock().extend(tasks);
        info!(
            providers = self.config.providers.len(),
            credentials = self.admin.overview().pool.total_credentials,
            "Gateway started"
        );
        Ok(())
    }

    fn spawn_janitor(&self) -> JoinHandle<()> {
        let queue = Arc::clone(self.dispatcher.queue());
        let admin = Arc::clone(&self.admin);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = queue.sweep_finished();
                        match admin.purge_retired().await {
                            Ok(purged) if !purged.is_empty() || swept > 0 => {
                                debug!(swept, purged = purged.len(), "Janitor pass");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Purging retired credentials failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Stop accepting queued work, let running jobs finish and stop the
    /// background tasks
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.dispatcher.queue().shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Gateway stopped");
    }

    /// Dispatch one inbound request
    pub async fn dispatch(&self, request: InboundRequest) -> Result<DispatchOutcome> {
        self.dispatcher.dispatch(request).await
    }

    /// Status of a queued request
    pub fn poll_status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.dispatcher.poll_status(job_id)
    }

    /// Cancel a pending queued request
    pub fn cancel(&self, job_id: &JobId) -> bool {
        self.dispatcher.cancel(job_id)
    }

    /// Wait for a queued request and take its completion
    pub async fn wait_result(&self, job_id: &JobId) -> Result<Arc<Completion>> {
        self.dispatcher.wait_result(job_id).await
    }

    pub fn admin(&self) -> &Arc<Admin> {
        &self.admin
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// List configured provider ids
    pub fn providers(&self) -> Vec<String> {
        self.config.providers.keys().cloned().collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.dispatcher.core().cache().stats()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.dispatcher.queue().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialConfig, ProviderConfig};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl UpstreamConnector for Echo {
        async fn call(&self, credential: &Credential, _: &NormalizedRequest, _: Duration) -> Result<UpstreamReply> {
            Ok(UpstreamReply::ok(
                serde_json::json!({ "served_by": credential.id }),
                12,
                3,
            ))
        }
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config
            .providers
            .insert("openai".to_string(), ProviderConfig::new("https://api.openai.com/v1"));
        config
            .credentials
            .push(CredentialConfig::new("k1", "openai").with_key("sk-one"));
        config
    }

    #[tokio::test]
    async fn test_gateway_dispatches_and_caches() {
        let gateway = Gateway::builder(config())
            .with_fallback_connector(Arc::new(Echo))
            .build()
            .unwrap();
        gateway.start().await.unwrap();

        let request = InboundRequest::new("caller", "openai/gpt-4o", vec![Message::user("hi")]);
        let first = gateway.dispatch(request.clone()).await.unwrap();
        let second = gateway.dispatch(request).await.unwrap();

        match (first, second) {
            (
                DispatchOutcome::Completed { completion, source: ResponseSource::Upstream },
                DispatchOutcome::Completed { source: ResponseSource::Cache, .. },
            ) => assert_eq!(completion.payload["served_by"], "k1"),
            other => panic!("unexpected outcomes: {:?}", other),
        }

        assert_eq!(gateway.cache_stats().entries, 1);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_loads_stored_credentials() {
        let store = Arc::new(MemoryCredentialStore::new());
        store
            .put(&Credential::new("stored", "openai", "sk-stored"))
            .await
            .unwrap();

        let gateway = Gateway::builder(config())
            .with_store(store)
            .with_fallback_connector(Arc::new(Echo))
            .build()
            .unwrap();
        gateway.start().await.unwrap();
        gateway.start().await.unwrap();

        assert!(gateway.admin().get_credential("stored").is_ok());
        assert!(gateway.admin().get_credential("k1").is_ok());
        gateway.shutdown().await;
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.queue.max_workers = 0;
        assert!(Gateway::from_config(config).is_err());
    }
}
