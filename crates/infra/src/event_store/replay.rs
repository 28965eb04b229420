//! Rebuild event-sourced state from an aggregate stream.

use hrms_core::{Aggregate, AggregateId};
use hrms_events::DomainEvent;

use super::r#trait::{EventStore, PersistenceError};

/// Replay the full stream of `aggregate_id` into a fresh `A`.
pub async fn rehydrate<A>(store: &dyn EventStore, aggregate_id: AggregateId) -> Result<A, PersistenceError>
where
    A: Aggregate<Event = DomainEvent>,
{
    let mut state = A::default();
    catch_up(store, aggregate_id, &mut state).await?;
    Ok(state)
}

/// Apply every record newer than `state.version()`; returns how many were applied.
pub async fn catch_up<A>(
    store: &dyn EventStore,
    aggregate_id: AggregateId,
    state: &mut A,
) -> Result<usize, PersistenceError>
where
    A: Aggregate<Event = DomainEvent>,
{
    let records = store
        .get_aggregate_events(aggregate_id, Some(A::aggregate_type()), Some(state.version() + 1))
        .await?;

    for record in &records {
        let event = record.to_domain_event()?;
        state.apply(&event, record.version);
    }

    tracing::debug!(
        aggregate_id = %aggregate_id,
        aggregate_type = A::aggregate_type(),
        applied = records.len(),
        version = state.version(),
        "aggregate replayed"
    );
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{InMemoryEventStore, NewEventRecord};
    use chrono::NaiveDate;
    use hrms_events::{
        EventMetadata, EventPayload, PayrollApproval, PayrollCalculated, PayrollPaid, aggregate_types,
    };

    #[derive(Debug, Default, PartialEq)]
    enum PeriodStatus {
        #[default]
        Open,
        Calculated,
        Approved,
        Rejected,
        Paid,
    }

    #[derive(Debug, Default)]
    struct PayrollPeriod {
        version: u64,
        status: PeriodStatus,
        net_total: i64,
    }

    impl Aggregate for PayrollPeriod {
        type Event = DomainEvent;

        fn aggregate_type() -> &'static str {
            aggregate_types::PAYROLL_PERIOD
        }

        fn apply(&mut self, event: &DomainEvent, version: u64) {
            match event.payload() {
                EventPayload::PayrollCalculated(e) => {
                    self.status = PeriodStatus::Calculated;
                    self.net_total = e.net_total;
                }
                EventPayload::PayrollApproval(e) if e.approved => self.status = PeriodStatus::Approved,
                EventPayload::PayrollApproval(_) => self.status = PeriodStatus::Rejected,
                EventPayload::PayrollPaid(_) => self.status = PeriodStatus::Paid,
                _ => {}
            }
            self.version = version;
        }

        fn version(&self) -> u64 {
            self.version
        }
    }

    async fn save(store: &InMemoryEventStore, payload: EventPayload) {
        store
            .save_event(NewEventRecord::new(DomainEvent::new(payload), EventMetadata::default()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn replays_payroll_period_lifecycle() {
        let store = InMemoryEventStore::new();
        let period_id = AggregateId::new();

        save(
            &store,
            EventPayload::PayrollCalculated(PayrollCalculated {
                payroll_period_id: period_id,
                period: "2024-05".to_string(),
                employee_count: 12,
                gross_total: 240_000_000,
                net_total: 198_000_000,
            }),
        )
        .await;
        save(
            &store,
            EventPayload::PayrollApproval(PayrollApproval {
                payroll_period_id: period_id,
                period: "2024-05".to_string(),
                approved_by: "cfo".to_string(),
                approved: true,
                comment: None,
            }),
        )
        .await;

        let mut period: PayrollPeriod = rehydrate(&store, period_id).await.unwrap();
        assert_eq!(period.status, PeriodStatus::Approved);
        assert_eq!(period.version, 2);
        assert_eq!(period.net_total, 198_000_000);

        save(
            &store,
            EventPayload::PayrollPaid(PayrollPaid {
                payroll_period_id: period_id,
                period: "2024-05".to_string(),
                paid_total: 198_000_000,
                paid_on: NaiveDate::from_ymd_opt(2024, 6, 5).unwrap(),
            }),
        )
        .await;

        let applied = catch_up(&store, period_id, &mut period).await.unwrap();
        assert_eq!(applied, 1);
        assert_eq!(period.status, PeriodStatus::Paid);
        assert_eq!(period.version, 3);
    }
}
