use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use hrms_core::{AggregateId, AggregateRef, EventId};

use super::query::{
    EventQuery, EventQueryResult, EventStats, SortDirection, SortField, StoreHealth, TOP_USERS_LIMIT,
    UserActivity,
};
use super::r#trait::{EventStore, EventStoreRecord, NewEventRecord, PersistenceError};

#[derive(Debug, Default)]
struct Log {
    records: Vec<EventStoreRecord>,
    ids: HashSet<EventId>,
    /// Last version handed out per stream. Survives retention cleanup.
    versions: HashMap<AggregateRef, u64>,
}

/// In-memory append-only event log.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
    outage: AtomicBool,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with a storage error until switched off again.
    pub fn simulate_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.log.read().map(|l| l.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(PersistenceError::Storage("event store unavailable".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Log>, PersistenceError> {
        self.log
            .read()
            .map_err(|_| PersistenceError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Log>, PersistenceError> {
        self.log
            .write()
            .map_err(|_| PersistenceError::Storage("lock poisoned".to_string()))
    }
}

fn sort_key(record: &EventStoreRecord, field: SortField) -> DateTime<Utc> {
    match field {
        SortField::OccurredAt => record.occurred_at,
        SortField::CreatedAt => record.created_at,
    }
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventStore {
    async fn save_event(&self, record: NewEventRecord) -> Result<EventId, PersistenceError> {
        self.save_events(vec![record])
            .await?
            .pop()
            .ok_or_else(|| PersistenceError::Storage("append returned no id".to_string()))
    }

    async fn save_events(&self, records: Vec<NewEventRecord>) -> Result<Vec<EventId>, PersistenceError> {
        self.check_available()?;
        if records.is_empty() {
            return Ok(vec![]);
        }

        let mut log = self.write()?;

        // Reject the whole batch before touching the log.
        let mut seen = HashSet::with_capacity(records.len());
        for r in &records {
            let id = r.event.id();
            if log.ids.contains(&id) || !seen.insert(id) {
                return Err(PersistenceError::Duplicate(id));
            }
        }

        // Versions are staged and only committed once every record is built.
        let now = Utc::now();
        let mut staged: HashMap<AggregateRef, u64> = HashMap::new();
        let mut stored = Vec::with_capacity(records.len());
        for r in records {
            let version = match &r.aggregate {
                Some(a) => {
                    let current = staged
                        .get(a)
                        .or_else(|| log.versions.get(a))
                        .copied()
                        .unwrap_or(0);
                    staged.insert(a.clone(), current + 1);
                    current + 1
                }
                None => 1,
            };
            stored.push(r.into_record(version, now)?);
        }

        log.versions.extend(staged);
        let mut ids = Vec::with_capacity(stored.len());
        for record in stored {
            ids.push(record.id);
            log.ids.insert(record.id);
            log.records.push(record);
        }
        Ok(ids)
    }

    async fn query_events(&self, query: &EventQuery) -> Result<EventQueryResult, PersistenceError> {
        let log = self.read()?;
        let mut matched: Vec<&EventStoreRecord> =
            log.records.iter().filter(|r| query.matches(r)).collect();

        matched.sort_by(|a, b| {
            let ord = sort_key(a, query.sort_by).cmp(&sort_key(b, query.sort_by));
            match query.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        });

        let total = matched.len() as u64;
        let events = matched
            .into_iter()
            .skip(query.pagination.offset as usize)
            .take(query.pagination.limit as usize)
            .cloned()
            .collect();
        Ok(EventQueryResult::page(events, total, query.pagination))
    }

    async fn get_event_by_id(&self, id: EventId) -> Result<Option<EventStoreRecord>, PersistenceError> {
        let log = self.read()?;
        Ok(log.records.iter().find(|r| r.id == id).cloned())
    }

    async fn get_aggregate_events(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: Option<&str>,
        from_version: Option<u64>,
    ) -> Result<Vec<EventStoreRecord>, PersistenceError> {
        let log = self.read()?;
        let mut stream: Vec<EventStoreRecord> = log
            .records
            .iter()
            .filter(|r| r.aggregate_id == Some(aggregate_id))
            .filter(|r| aggregate_type.is_none_or(|t| r.aggregate_type.as_deref() == Some(t)))
            .filter(|r| from_version.is_none_or(|v| r.version >= v))
            .cloned()
            .collect();
        stream.sort_by(|a, b| a.version.cmp(&b.version).then(a.created_at.cmp(&b.created_at)));
        Ok(stream)
    }

    async fn get_event_stats(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<EventStats, PersistenceError> {
        let log = self.read()?;
        let mut stats = EventStats::default();
        let mut users: BTreeMap<String, u64> = BTreeMap::new();

        let in_range = log
            .records
            .iter()
            .filter(|r| from.is_none_or(|f| r.occurred_at >= f))
            .filter(|r| to.is_none_or(|t| r.occurred_at <= t));

        for r in in_range {
            stats.total_events += 1;
            *stats.events_by_type.entry(r.event_type.clone()).or_default() += 1;
            *stats
                .events_by_category
                .entry(r.metadata.category.as_str().to_string())
                .or_default() += 1;
            *stats.events_by_date.entry(r.occurred_at.date_naive()).or_default() += 1;
            if let Some(user) = &r.user_id {
                *users.entry(user.clone()).or_default() += 1;
            }
        }

        let mut top: Vec<UserActivity> = users
            .into_iter()
            .map(|(user_id, event_count)| UserActivity {
                user_id,
                event_count,
            })
            .collect();
        // Stable sort keeps ties in user-id order.
        top.sort_by(|a, b| b.event_count.cmp(&a.event_count));
        top.truncate(TOP_USERS_LIMIT);
        stats.top_users = top;

        Ok(stats)
    }

    async fn cleanup_expired_events(&self, older_than_days: u32) -> Result<u64, PersistenceError> {
        self.check_available()?;
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(older_than_days));
        let mut log = self.write()?;

        let before = log.records.len();
        let (kept, expired): (Vec<_>, Vec<_>) =
            log.records.drain(..).partition(|r| r.created_at >= cutoff);
        log.records = kept;
        for r in &expired {
            log.ids.remove(&r.id);
        }
        Ok((before - log.records.len()) as u64)
    }

    async fn health_check(&self) -> StoreHealth {
        if let Err(e) = self.check_available() {
            return StoreHealth::unhealthy(e.to_string());
        }
        match self.read() {
            Ok(log) => StoreHealth {
                healthy: true,
                total_events: log.records.len() as u64,
                last_event_time: log.records.iter().map(|r| r.created_at).max(),
                error: None,
            },
            Err(e) => StoreHealth::unhealthy(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::query::Pagination;
    use chrono::NaiveDate;
    use hrms_events::{
        DomainEvent, EmployeeCreated, EventCategory, EventMetadata, EventPayload, SystemAlert,
        aggregate_types,
    };

    fn hire(employee_id: AggregateId) -> DomainEvent {
        DomainEvent::new(EventPayload::EmployeeCreated(EmployeeCreated {
            employee_id,
            employee_code: "E-001".to_string(),
            full_name: "Nguyen Van A".to_string(),
            department: Some("Finance".to_string()),
            hired_on: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        }))
    }

    fn alert() -> DomainEvent {
        DomainEvent::new(EventPayload::SystemAlert(SystemAlert {
            component: "scheduler".to_string(),
            severity: "warning".to_string(),
            message: "queue backlog".to_string(),
        }))
    }

    #[tokio::test]
    async fn versions_increase_per_stream() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        for _ in 0..3 {
            store
                .save_event(NewEventRecord::new(hire(a), EventMetadata::default()))
                .await
                .unwrap();
        }
        store
            .save_event(NewEventRecord::new(hire(b), EventMetadata::default()))
            .await
            .unwrap();

        let stream = store
            .get_aggregate_events(a, Some(aggregate_types::EMPLOYEE), None)
            .await
            .unwrap();
        assert_eq!(stream.iter().map(|r| r.version).collect::<Vec<_>>(), vec![1, 2, 3]);

        let tail = store.get_aggregate_events(a, None, Some(2)).await.unwrap();
        assert_eq!(tail.len(), 2);

        let other = store.get_aggregate_events(b, None, None).await.unwrap();
        assert_eq!(other[0].version, 1);
    }

    #[tokio::test]
    async fn events_without_aggregate_get_version_one() {
        let store = InMemoryEventStore::new();
        let id = store
            .save_event(NewEventRecord::new(alert(), EventMetadata::default()))
            .await
            .unwrap();
        let stored = store.get_event_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(stored.aggregate_id.is_none());
        assert_eq!(stored.to_domain_event().unwrap().event_type(), "SystemAlert");
    }

    #[tokio::test]
    async fn duplicate_in_batch_rejects_everything() {
        let store = InMemoryEventStore::new();
        let event = hire(AggregateId::new());
        let batch = vec![
            NewEventRecord::new(alert(), EventMetadata::default()),
            NewEventRecord::new(event.clone(), EventMetadata::default()),
            NewEventRecord::new(event.clone(), EventMetadata::default()),
        ];
        let err = store.save_events(batch).await.unwrap_err();
        assert_eq!(err, PersistenceError::Duplicate(event.id()));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn missing_event_is_none() {
        let store = InMemoryEventStore::new();
        assert!(store.get_event_by_id(EventId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_filters_and_pages() {
        let store = InMemoryEventStore::new();
        let employee = AggregateId::new();
        for _ in 0..4 {
            store
                .save_event(
                    NewEventRecord::new(hire(employee), EventMetadata::default()).with_user("hr-1"),
                )
                .await
                .unwrap();
        }
        store
            .save_event(NewEventRecord::new(
                alert(),
                EventMetadata::default().with_category(EventCategory::System),
            ))
            .await
            .unwrap();

        let all = store.query_events(&EventQuery::new()).await.unwrap();
        assert_eq!(all.total_count, 5);

        let page = store
            .query_events(
                &EventQuery::new()
                    .event_type("EmployeeCreated")
                    .user("hr-1")
                    .paginate(Pagination::new(Some(3), Some(0)))
                    .order_by(SortField::CreatedAt, SortDirection::Asc),
            )
            .await
            .unwrap();
        assert_eq!(page.total_count, 4);
        assert_eq!(page.events.len(), 3);
        assert!(page.has_more);

        let system = store
            .query_events(&EventQuery::new().category(EventCategory::System))
            .await
            .unwrap();
        assert_eq!(system.events[0].event_type, "SystemAlert");
    }

    #[tokio::test]
    async fn stats_group_by_type_category_and_user() {
        let store = InMemoryEventStore::new();
        let employee = AggregateId::new();
        store
            .save_event(NewEventRecord::new(hire(employee), EventMetadata::default()).with_user("hr-1"))
            .await
            .unwrap();
        store
            .save_event(NewEventRecord::new(hire(employee), EventMetadata::default()).with_user("hr-1"))
            .await
            .unwrap();
        store
            .save_event(NewEventRecord::new(alert(), EventMetadata::default()).with_user("ops"))
            .await
            .unwrap();

        let stats = store.get_event_stats(None, None).await.unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_by_type["EmployeeCreated"], 2);
        assert_eq!(stats.events_by_category["BUSINESS"], 3);
        assert_eq!(stats.events_by_date.values().sum::<u64>(), 3);
        assert_eq!(stats.top_users[0].user_id, "hr-1");
        assert_eq!(stats.top_users[0].event_count, 2);
    }

    #[tokio::test]
    async fn cleanup_only_removes_old_records_and_keeps_versions_monotonic() {
        let store = InMemoryEventStore::new();
        let employee = AggregateId::new();
        store
            .save_event(NewEventRecord::new(hire(employee), EventMetadata::default()))
            .await
            .unwrap();

        assert_eq!(store.cleanup_expired_events(30).await.unwrap(), 0);
        assert_eq!(store.cleanup_expired_events(0).await.unwrap(), 1);
        assert!(store.is_empty());

        store
            .save_event(NewEventRecord::new(hire(employee), EventMetadata::default()))
            .await
            .unwrap();
        let stream = store.get_aggregate_events(employee, None, None).await.unwrap();
        assert_eq!(stream[0].version, 2);
    }

    #[tokio::test]
    async fn outage_fails_writes_and_health() {
        let store = InMemoryEventStore::new();
        store.simulate_outage(true);
        let err = store
            .save_event(NewEventRecord::new(alert(), EventMetadata::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Storage(_)));
        assert!(!store.health_check().await.healthy);

        store.simulate_outage(false);
        let health = store.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.total_events, 0);
    }
}
