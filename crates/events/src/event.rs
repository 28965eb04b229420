//! Typed domain events raised by HR/payroll business operations.
//!
//! The set of events is closed: every event is one `EventPayload` variant and
//! its event-type string is fixed per variant. Payload shapes are owned by the
//! business modules that raise them; the backbone only routes, persists and
//! broadcasts them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use hrms_core::{AggregateId, AggregateRef, EventId};

/// Stable event-type identifiers (the discriminator stored in `event_type`).
pub mod event_types {
    pub const EMPLOYEE_CREATED: &str = "EmployeeCreated";
    pub const EMPLOYEE_UPDATED: &str = "EmployeeUpdated";
    pub const EMPLOYEE_TERMINATED: &str = "EmployeeTerminated";
    pub const PAYROLL_CALCULATED: &str = "PayrollCalculated";
    pub const PAYROLL_APPROVAL: &str = "PayrollApproval";
    pub const PAYROLL_PAID: &str = "PayrollPaid";
    pub const INSURANCE_CONTRIBUTION_CALCULATED: &str = "InsuranceContributionCalculated";
    pub const TAX_WITHHOLDING_CALCULATED: &str = "TaxWithholdingCalculated";
    pub const AUDIT_TRAIL_RECORDED: &str = "AuditTrailRecorded";
    pub const SYSTEM_ALERT: &str = "SystemAlert";

    /// Every known event type, in declaration order.
    pub const ALL: [&str; 10] = [
        EMPLOYEE_CREATED,
        EMPLOYEE_UPDATED,
        EMPLOYEE_TERMINATED,
        PAYROLL_CALCULATED,
        PAYROLL_APPROVAL,
        PAYROLL_PAID,
        INSURANCE_CONTRIBUTION_CALCULATED,
        TAX_WITHHOLDING_CALCULATED,
        AUDIT_TRAIL_RECORDED,
        SYSTEM_ALERT,
    ];
}

/// Aggregate type names used by the default stream mapping.
pub mod aggregate_types {
    pub const EMPLOYEE: &str = "employee";
    pub const PAYROLL_PERIOD: &str = "payroll_period";
}

/// A new employee record was opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeCreated {
    pub employee_id: AggregateId,
    pub employee_code: String,
    pub full_name: String,
    pub department: Option<String>,
    pub hired_on: NaiveDate,
}

/// `changes` maps each changed field to its new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeUpdated {
    pub employee_id: AggregateId,
    pub changed_fields: Vec<String>,
    pub changes: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeTerminated {
    pub employee_id: AggregateId,
    pub terminated_on: NaiveDate,
    pub reason: Option<String>,
}

/// Amounts are in minor currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollCalculated {
    pub payroll_period_id: AggregateId,
    /// Period label, `YYYY-MM`.
    pub period: String,
    pub employee_count: u32,
    pub gross_total: i64,
    pub net_total: i64,
}

/// Approval decision on a calculated payroll period (approved or rejected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollApproval {
    pub payroll_period_id: AggregateId,
    pub period: String,
    pub approved_by: String,
    pub approved: bool,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollPaid {
    pub payroll_period_id: AggregateId,
    pub period: String,
    pub paid_total: i64,
    pub paid_on: NaiveDate,
}

/// Social insurance contribution of one employee for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsuranceContributionCalculated {
    pub employee_id: AggregateId,
    pub period: String,
    pub contribution_base: i64,
    pub employee_share: i64,
    pub employer_share: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxWithholdingCalculated {
    pub employee_id: AggregateId,
    pub period: String,
    pub taxable_income: i64,
    pub withheld: i64,
}

/// Filed under `(subject_id, subject_type)` when both are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTrailRecorded {
    pub subject_id: Option<AggregateId>,
    pub subject_type: Option<String>,
    pub actor: String,
    pub action: String,
    pub details: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAlert {
    pub component: String,
    pub severity: String,
    pub message: String,
}

/// Closed set of event payloads, tagged by event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "data")]
pub enum EventPayload {
    EmployeeCreated(EmployeeCreated),
    EmployeeUpdated(EmployeeUpdated),
    EmployeeTerminated(EmployeeTerminated),
    PayrollCalculated(PayrollCalculated),
    PayrollApproval(PayrollApproval),
    PayrollPaid(PayrollPaid),
    InsuranceContributionCalculated(InsuranceContributionCalculated),
    TaxWithholdingCalculated(TaxWithholdingCalculated),
    AuditTrailRecorded(AuditTrailRecorded),
    SystemAlert(SystemAlert),
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        use event_types::*;
        match self {
            EventPayload::EmployeeCreated(_) => EMPLOYEE_CREATED,
            EventPayload::EmployeeUpdated(_) => EMPLOYEE_UPDATED,
            EventPayload::EmployeeTerminated(_) => EMPLOYEE_TERMINATED,
            EventPayload::PayrollCalculated(_) => PAYROLL_CALCULATED,
            EventPayload::PayrollApproval(_) => PAYROLL_APPROVAL,
            EventPayload::PayrollPaid(_) => PAYROLL_PAID,
            EventPayload::InsuranceContributionCalculated(_) => INSURANCE_CONTRIBUTION_CALCULATED,
            EventPayload::TaxWithholdingCalculated(_) => TAX_WITHHOLDING_CALCULATED,
            EventPayload::AuditTrailRecorded(_) => AUDIT_TRAIL_RECORDED,
            EventPayload::SystemAlert(_) => SYSTEM_ALERT,
        }
    }

    /// Natural aggregate stream of the payload, if it has one.
    pub fn aggregate(&self) -> Option<AggregateRef> {
        use aggregate_types::{EMPLOYEE, PAYROLL_PERIOD};
        match self {
            EventPayload::EmployeeCreated(e) => Some(AggregateRef::new(e.employee_id, EMPLOYEE)),
            EventPayload::EmployeeUpdated(e) => Some(AggregateRef::new(e.employee_id, EMPLOYEE)),
            EventPayload::EmployeeTerminated(e) => Some(AggregateRef::new(e.employee_id, EMPLOYEE)),
            EventPayload::InsuranceContributionCalculated(e) => {
                Some(AggregateRef::new(e.employee_id, EMPLOYEE))
            }
            EventPayload::TaxWithholdingCalculated(e) => {
                Some(AggregateRef::new(e.employee_id, EMPLOYEE))
            }
            EventPayload::PayrollCalculated(e) => {
                Some(AggregateRef::new(e.payroll_period_id, PAYROLL_PERIOD))
            }
            EventPayload::PayrollApproval(e) => {
                Some(AggregateRef::new(e.payroll_period_id, PAYROLL_PERIOD))
            }
            EventPayload::PayrollPaid(e) => {
                Some(AggregateRef::new(e.payroll_period_id, PAYROLL_PERIOD))
            }
            EventPayload::AuditTrailRecorded(e) => match (e.subject_id, &e.subject_type) {
                (Some(id), Some(kind)) => Some(AggregateRef::new(id, kind.clone())),
                _ => None,
            },
            EventPayload::SystemAlert(_) => None,
        }
    }
}

/// A domain event: an immutable record of something that happened.
///
/// The `id` is assigned at construction and never changes; the event type is
/// derived from the payload variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    id: EventId,
    occurred_at: DateTime<Utc>,
    payload: EventPayload,
}

impl DomainEvent {
    /// Raise a new event now, with a fresh identifier.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Rebuild an event from persisted parts.
    pub fn from_parts(
        id: EventId,
        occurred_at: DateTime<Utc>,
        event_type: &str,
        data: JsonValue,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::from_value(serde_json::json!({
            "eventType": event_type,
            "data": data,
        }))?;
        Ok(Self {
            id,
            occurred_at,
            payload,
        })
    }

    /// Override the business time (e.g. for back-dated corrections).
    pub fn occurred_at_time(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn aggregate(&self) -> Option<AggregateRef> {
        self.payload.aggregate()
    }

    /// The payload body without its type tag (the `event_data` column).
    pub fn payload_json(&self) -> Result<JsonValue, serde_json::Error> {
        let mut tagged = serde_json::to_value(&self.payload)?;
        Ok(tagged
            .get_mut("data")
            .map(JsonValue::take)
            .unwrap_or(JsonValue::Null))
    }
}

impl From<EventPayload> for DomainEvent {
    fn from(payload: EventPayload) -> Self {
        Self::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn employee_created() -> EventPayload {
        EventPayload::EmployeeCreated(EmployeeCreated {
            employee_id: AggregateId::new(),
            employee_code: "E-001".to_string(),
            full_name: "Nguyen Van A".to_string(),
            department: Some("Finance".to_string()),
            hired_on: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        })
    }

    #[test]
    fn event_types_are_unique() {
        let unique: HashSet<&str> = event_types::ALL.iter().copied().collect();
        assert_eq!(unique.len(), event_types::ALL.len());
    }

    #[test]
    fn new_events_get_distinct_ids() {
        let a = DomainEvent::new(employee_created());
        let b = DomainEvent::new(employee_created());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.event_type(), "EmployeeCreated");
    }

    #[test]
    fn payload_json_strips_the_type_tag() {
        let event = DomainEvent::new(employee_created());
        let data = event.payload_json().unwrap();
        assert_eq!(data["employeeCode"], "E-001");
        assert!(data.get("eventType").is_none());
    }

    #[test]
    fn from_parts_rebuilds_the_same_event() {
        let event = DomainEvent::new(employee_created());
        let rebuilt = DomainEvent::from_parts(
            event.id(),
            event.occurred_at(),
            event.event_type(),
            event.payload_json().unwrap(),
        )
        .unwrap();
        assert_eq!(rebuilt, event);
    }

    #[test]
    fn from_parts_rejects_unknown_event_type() {
        let result = DomainEvent::from_parts(
            EventId::new(),
            Utc::now(),
            "PayrollExploded",
            serde_json::json!({}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn employee_events_map_to_employee_stream() {
        let payload = employee_created();
        let aggregate = payload.aggregate().unwrap();
        assert_eq!(aggregate.aggregate_type, aggregate_types::EMPLOYEE);

        let alert = EventPayload::SystemAlert(SystemAlert {
            component: "payroll".to_string(),
            severity: "warning".to_string(),
            message: "slow batch".to_string(),
        });
        assert!(alert.aggregate().is_none());
    }
}
