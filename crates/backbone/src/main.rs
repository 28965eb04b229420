use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;

use hrms_backbone::{Backbone, BackboneConfig};
use hrms_core::AggregateId;
use hrms_events::{
    DomainEvent, EventPayload, FnHandler, PayrollApproval, PayrollCalculated, PayrollPaid,
    PublishContext, SubscriptionOptions, TaxWithholdingCalculated, event_types,
};
use hrms_infra::publisher::{BatchEntry, BatchOptions, ScheduleOptions};
use hrms_infra::realtime::{RealtimeChannelConfig, RealtimeSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hrms_observability::init();

    let config = BackboneConfig::from_env();
    let backbone = Backbone::from_config(config)
        .await
        .context("failed to start event backbone")?;

    register_handlers(&backbone);

    backbone
        .realtime
        .create_channel(
            RealtimeChannelConfig::new("payroll-events")
                .allow_roles(["payroll_admin", "hr_manager"])
                .for_event_types([
                    event_types::PAYROLL_CALCULATED,
                    event_types::PAYROLL_APPROVAL,
                    event_types::PAYROLL_PAID,
                ]),
        )
        .await?;
    backbone
        .realtime
        .register_subscriber(
            RealtimeSubscriber::new("payroll-events")
                .for_user("payroll-admin")
                .with_roles(["payroll_admin"]),
        )
        .await?;

    run_payroll_cycle(&backbone).await?;

    let status = backbone.realtime.get_status().await;
    tracing::info!(
        healthy = status.healthy,
        published = status.metrics.events_published,
        failed = status.metrics.events_failed,
        scheduled = status.scheduled_events,
        "payroll cycle complete"
    );
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn register_handlers(backbone: &Backbone) {
    backbone.bus.subscribe(
        [
            event_types::PAYROLL_CALCULATED,
            event_types::PAYROLL_APPROVAL,
            event_types::PAYROLL_PAID,
        ],
        Arc::new(FnHandler::new("payroll-audit", |event, metadata| {
            tracing::info!(
                event_id = %event.id(),
                event_type = event.event_type(),
                correlation_id = %metadata.correlation_id,
                "payroll event recorded"
            );
            Ok(())
        })),
        SubscriptionOptions::new().with_priority(10),
    );
    backbone.bus.subscribe(
        [event_types::TAX_WITHHOLDING_CALCULATED],
        Arc::new(FnHandler::new("tax-ledger", |event, _| {
            tracing::debug!(event_id = %event.id(), "tax withholding posted");
            Ok(())
        })),
        SubscriptionOptions::new(),
    );
}

async fn run_payroll_cycle(backbone: &Backbone) -> anyhow::Result<()> {
    let period_id = AggregateId::new();
    let period = Utc::now().format("%Y-%m").to_string();
    let ctx = PublishContext::for_user("payroll-admin").with_source("hrms-backbone");

    let calculated = DomainEvent::new(EventPayload::PayrollCalculated(PayrollCalculated {
        payroll_period_id: period_id,
        period: period.clone(),
        employee_count: 3,
        gross_total: 4_500_000,
        net_total: 3_780_000,
    }));
    backbone.publisher.publish(&calculated, ctx.clone(), None).await;

    let withholdings = (0..3)
        .map(|i| {
            BatchEntry::new(DomainEvent::new(EventPayload::TaxWithholdingCalculated(
                TaxWithholdingCalculated {
                    employee_id: AggregateId::new(),
                    period: period.clone(),
                    taxable_income: 1_500_000,
                    withheld: 150_000 + i * 1_000,
                },
            )))
            .with_context(ctx.clone())
        })
        .collect();
    let batch = backbone
        .publisher
        .publish_batch(withholdings, BatchOptions::default())
        .await;
    tracing::info!(
        successful = batch.summary.successful,
        failed = batch.summary.failed,
        "withholdings published"
    );

    let approval = DomainEvent::new(EventPayload::PayrollApproval(PayrollApproval {
        payroll_period_id: period_id,
        period: period.clone(),
        approved_by: "payroll-admin".to_string(),
        approved: true,
        comment: None,
    }));
    let tx = backbone.publisher.publish_after_commit(
        approval,
        ctx.clone().with_transaction(format!("approve-{period}")),
        None,
    );
    backbone.publisher.commit_transaction(&tx).await;

    let paid = DomainEvent::new(EventPayload::PayrollPaid(PayrollPaid {
        payroll_period_id: period_id,
        period,
        paid_total: 3_780_000,
        paid_on: Utc::now().date_naive(),
    }));
    backbone
        .publisher
        .schedule_event(paid, ScheduleOptions::after(Duration::from_millis(200)), ctx, None)
        .await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    Ok(())
}
