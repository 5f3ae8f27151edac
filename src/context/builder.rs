//! Assembly of a [`Context`].
//!
//! Defaults are the gRPC transport, file persistence (when enabled), condvar
//! based data notifies and the failure counting health monitor. Each can be
//! replaced before [`ContextBuilder::build`].
//!
//! ## Example
//! ```ignore
//! let config = ClientConfig::new()?;
//! let context = Context::builder(config).build()?;
//! let data = context.get_service_data(&key, DataType::Instances, Duration::from_secs(1))?;
//! ```

use std::sync::Arc;

use tracing::info;
use tracing::warn;

use super::Context;
use crate::metrics;
use crate::reactor::Reactor;
use crate::CacheManager;
use crate::CacheManagerHandle;
use crate::CachePersist;
use crate::CallResultReporter;
use crate::ClientConfig;
use crate::ConnectorHandle;
use crate::DataNotifyFactory;
use crate::DataType;
use crate::DiscoverConnector;
use crate::FilePersist;
use crate::GrpcTransport;
use crate::HealthMonitor;
use crate::HostPortIndex;
use crate::LocalRegistry;
use crate::NoopPersist;
use crate::RegistryDeps;
use crate::RegistrySelector;
use crate::Result;
use crate::ServiceKey;
use crate::Transport;

pub struct ContextBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    persist: Option<Arc<dyn CachePersist>>,
    notify_factory: Option<DataNotifyFactory>,
    reporter: Option<Arc<dyn CallResultReporter>>,
}

impl ContextBuilder {
    pub(super) fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            persist: None,
            notify_factory: None,
            reporter: None,
        }
    }

    /// Replaces the gRPC transport.
    pub fn transport(
        mut self,
        transport: Arc<dyn Transport>,
    ) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the backup store chosen from the persist config.
    pub fn persist(
        mut self,
        persist: Arc<dyn CachePersist>,
    ) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn notify_factory(
        mut self,
        notify_factory: DataNotifyFactory,
    ) -> Self {
        self.notify_factory = Some(notify_factory);
        self
    }

    /// Replaces the health monitor fed with call results.
    pub fn reporter(
        mut self,
        reporter: Arc<dyn CallResultReporter>,
    ) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Validates the config, wires the components and starts every thread.
    pub fn build(self) -> Result<Context> {
        let config = self.config.validate()?;
        metrics::init_metrics();

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(GrpcTransport::new()?),
        };
        let reporter: Arc<dyn CallResultReporter> = match self.reporter {
            Some(reporter) => reporter,
            None => Arc::new(HealthMonitor::new(config.connector.failure_threshold)),
        };
        let mut file_persist = None;
        let persist: Arc<dyn CachePersist> = match self.persist {
            Some(persist) => persist,
            None if config.persist.enabled => {
                let persist = Arc::new(FilePersist::new(config.persist.clone())?);
                file_persist = Some(persist.clone());
                persist
            }
            None => Arc::new(NoopPersist),
        };

        let mut connector_reactor = Reactor::new(DiscoverConnector::new(
            config.connector.clone(),
            transport,
            reporter.clone(),
        ));
        let connector = ConnectorHandle::new(connector_reactor.handle());

        let host_ports = Arc::new(HostPortIndex::new());
        let mut cache_reactor =
            Reactor::new(CacheManager::new(config.registry.clone(), host_ports.clone()));
        let cache = CacheManagerHandle::new(cache_reactor.handle());

        let system_services: Vec<ServiceKey> = [
            &config.connector.discover_service,
            &config.connector.heartbeat_service,
        ]
        .into_iter()
        .flatten()
        .map(|s| s.service_key())
        .collect();
        let registry = LocalRegistry::new(
            config.registry.clone(),
            system_services.clone(),
            RegistryDeps {
                connector: Arc::new(connector.clone()),
                persist,
                change_sink: Arc::new(cache.clone()),
                notify_factory: self.notify_factory.unwrap_or_default(),
            },
        );

        connector_reactor
            .state_mut()
            .set_selector(Arc::new(RegistrySelector::new(
                registry.clone(),
                reporter.clone(),
                Arc::new(cache.clone()),
            )));
        cache_reactor.execute(|cm, sched| cm.start(sched, registry.clone()));
        connector_reactor.execute(|conn, sched| conn.start(sched));

        let connector_thread = connector_reactor.spawn("polaris-connector")?;
        let cache_thread = cache_reactor.spawn("polaris-cache")?;

        // Loaded here so the connector thread only ever reads them.
        for key in &system_services {
            if let Err(e) = registry.load_service_data_with_notify(key, DataType::Instances) {
                warn!(service = %key, error = %e, "track system service failed");
            }
        }

        info!(
            seeds = ?config.connector.addresses,
            persist = config.persist.enabled,
            "discovery context started"
        );
        Ok(Context::new(
            config,
            registry,
            host_ports,
            reporter,
            connector,
            cache,
            connector_thread,
            cache_thread,
            file_persist,
        ))
    }
}
