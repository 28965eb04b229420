//! Wiring of the HRMS event backbone.
//!
//! Builds the store, bus, publisher and realtime layers from one
//! [`BackboneConfig`], either fully in memory or on top of Postgres.

use std::sync::Arc;

use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use hrms_core::{DomainError, DomainResult};
use hrms_infra::config::{EventBusConfig, PublisherConfig, RealtimeConfig};
use hrms_infra::event_bus::EventBus;
use hrms_infra::event_store::{EventStore, InMemoryEventStore, PersistenceError, PostgresEventStore};
use hrms_infra::publisher::{EventPublisher, InMemoryScheduleStore};
use hrms_infra::realtime::{InMemoryTransport, RealtimeEventPublisher, RealtimeHub};

#[derive(Debug, Error)]
pub enum BackboneError {
    #[error("invalid configuration: {0}")]
    Config(#[from] DomainError),

    #[error("database connection failed: {0}")]
    Connect(#[from] sqlx::Error),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Configuration of the whole backbone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackboneConfig {
    pub bus: EventBusConfig,
    pub publisher: PublisherConfig,
    pub realtime: RealtimeConfig,
    pub database_url: Option<String>,
    /// Store events in Postgres instead of memory.
    pub use_persistent_store: bool,
}

impl BackboneConfig {
    pub fn from_env() -> Self {
        let use_persistent_store = std::env::var("USE_PERSISTENT_STORES")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        Self {
            bus: EventBusConfig::from_env(),
            publisher: PublisherConfig::from_env(),
            realtime: RealtimeConfig::from_env(),
            database_url: std::env::var("DATABASE_URL").ok(),
            use_persistent_store,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        self.bus.validate()?;
        self.publisher.validate()?;
        self.realtime.validate()?;
        if self.use_persistent_store && self.database_url.is_none() {
            return Err(DomainError::validation(
                "DATABASE_URL must be set when USE_PERSISTENT_STORES=true",
            ));
        }
        Ok(())
    }
}

/// The assembled backbone. All handles share state with each other.
#[derive(Clone)]
pub struct Backbone {
    pub store: Arc<dyn EventStore>,
    pub bus: Arc<EventBus>,
    pub publisher: EventPublisher,
    pub realtime: RealtimeEventPublisher,
    /// Transport the realtime hub broadcasts through; listeners attach here.
    pub transport: Arc<InMemoryTransport>,
}

impl Backbone {
    /// Connect according to `config`: Postgres when persistence is enabled,
    /// memory otherwise.
    pub async fn from_config(config: BackboneConfig) -> Result<Self, BackboneError> {
        config.validate()?;
        match (config.use_persistent_store, config.database_url.clone()) {
            (true, Some(database_url)) => {
                let pool = PgPool::connect(&database_url).await?;
                Self::postgres(config, pool).await
            }
            _ => Ok(Self::in_memory(config)),
        }
    }

    pub fn in_memory(config: BackboneConfig) -> Self {
        info!("using in-memory event store");
        Self::assemble(config, Arc::new(InMemoryEventStore::new()))
    }

    /// Backbone over a Postgres pool; creates the event table if missing.
    pub async fn postgres(config: BackboneConfig, pool: PgPool) -> Result<Self, BackboneError> {
        let store = PostgresEventStore::new(pool);
        store.ensure_schema().await?;
        info!("using postgres event store");
        Ok(Self::assemble(config, Arc::new(store)))
    }

    fn assemble(config: BackboneConfig, store: Arc<dyn EventStore>) -> Self {
        let bus = Arc::new(EventBus::new(config.bus, Some(store.clone())));
        let publisher = EventPublisher::with_schedule_store(
            bus.clone(),
            config.publisher,
            Arc::new(InMemoryScheduleStore::new()),
        );
        let transport = Arc::new(InMemoryTransport::new());
        let hub = Arc::new(RealtimeHub::new(config.realtime, transport.clone()));
        let realtime = RealtimeEventPublisher::new(publisher.clone(), hub);

        Self {
            store,
            bus,
            publisher,
            realtime,
            transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hrms_core::AggregateId;
    use hrms_events::{DomainEvent, EventPayload, PayrollCalculated, PublishContext};
    use hrms_infra::event_store::EventQuery;
    use hrms_infra::realtime::RealtimeChannelConfig;

    fn calculated() -> DomainEvent {
        DomainEvent::new(EventPayload::PayrollCalculated(PayrollCalculated {
            payroll_period_id: AggregateId::new(),
            period: "2024-06".to_string(),
            employee_count: 12,
            gross_total: 1_200_000,
            net_total: 980_000,
        }))
    }

    #[test]
    fn persistent_store_requires_database_url() {
        let config = BackboneConfig {
            use_persistent_store: true,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DomainError::Validation(_))));

        let config = BackboneConfig {
            database_url: Some("postgres://localhost/hrms".to_string()),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn from_config_falls_back_to_memory() {
        let backbone = Backbone::from_config(BackboneConfig::default()).await.unwrap();
        assert!(backbone.store.health_check().await.healthy);
    }

    #[tokio::test]
    async fn publish_reaches_store_and_realtime() {
        let backbone = Backbone::in_memory(BackboneConfig::default());
        backbone
            .realtime
            .create_channel(RealtimeChannelConfig::new("payroll-events").for_event_types(["*"]))
            .await
            .unwrap();
        let mut rx = backbone.transport.subscribe("payroll-events").await.unwrap();

        let result = backbone
            .publisher
            .publish(&calculated(), PublishContext::for_user("payroll-admin"), None)
            .await;
        assert!(result.success);

        let page = backbone.store.query_events(&EventQuery::new()).await.unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(rx.recv().await.unwrap().event_name, "PayrollCalculated");
    }
}
