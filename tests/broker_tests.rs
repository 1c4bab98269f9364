//! Publish/subscribe behavior of the in-process broker and its pipeline.

mod common;

use common::*;
use courier_core::broker::{MessageBroker, PublishOptions, PublishReport};
use courier_core::config::BrokerConfig;
use courier_core::envelope::Envelope;
use courier_core::error::CourierError;
use courier_core::handler::{HandlerError, HandlerType};
use courier_core::registry::RegistryHandlerFactory;
use courier_core::transport::{deliver, TransportDisposition, WireMessage};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

fn recording_factory(log: &CallLog, names: &[&'static str]) -> RegistryHandlerFactory {
    let factory = RegistryHandlerFactory::new();
    for &name in names {
        let log = log.clone();
        factory.register(name, move || Recording {
            name,
            log: log.clone(),
        });
    }
    factory
}

#[tokio::test]
async fn publish_invokes_each_subscribed_handler_once() {
    let log = CallLog::default();
    let broker = broker(
        recording_factory(&log, &["SendConfirmation", "UpdateInventory", "ShipParcel"]),
        &broker_config(1),
    );
    broker.subscribe("OrderPlaced".into(), "SendConfirmation".into());
    broker.subscribe("OrderPlaced".into(), "UpdateInventory".into());
    broker.subscribe("OrderShipped".into(), "ShipParcel".into());

    let report = assert_ok!(broker.publish(&order_envelope(1), &no_cancel()).await);

    assert_eq!(report.handler_reports().len(), 2);
    assert!(report.is_success());
    assert_eq!(log.count("SendConfirmation"), 1);
    assert_eq!(log.count("UpdateInventory"), 1);
    assert_eq!(log.count("ShipParcel"), 0);

    let stats = broker.stats();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.delivered, 2);
}

#[tokio::test]
async fn duplicate_subscription_does_not_double_dispatch() {
    let log = CallLog::default();
    let broker = broker(recording_factory(&log, &["SendConfirmation"]), &broker_config(1));

    assert!(broker.subscribe("OrderPlaced".into(), "SendConfirmation".into()));
    assert!(!broker.subscribe("OrderPlaced".into(), "SendConfirmation".into()));

    assert_ok!(broker.publish(&order_envelope(1), &no_cancel()).await);
    assert_eq!(log.count("SendConfirmation"), 1);
}

#[tokio::test]
async fn unsubscribed_handler_no_longer_receives() {
    let log = CallLog::default();
    let broker = broker(recording_factory(&log, &["SendConfirmation"]), &broker_config(1));
    broker.subscribe("OrderPlaced".into(), "SendConfirmation".into());

    assert!(broker.unsubscribe(&"OrderPlaced".into(), &"SendConfirmation".into()));
    assert!(!broker.unsubscribe(&"OrderPlaced".into(), &"SendConfirmation".into()));

    let report = assert_ok!(broker.publish(&order_envelope(1), &no_cancel()).await);
    assert_eq!(report, PublishReport::NoSubscribers);
    assert_eq!(log.len(), 0);
}

#[tokio::test]
async fn expired_envelope_is_dropped_without_invocations() {
    let log = CallLog::default();
    let broker = broker(recording_factory(&log, &["SendConfirmation"]), &broker_config(1));
    broker.subscribe("OrderPlaced".into(), "SendConfirmation".into());

    let envelope = Envelope::builder("OrderPlaced", b"{}".to_vec())
        .created_at(chrono::Utc::now() - chrono::Duration::seconds(5))
        .ttl(Duration::from_secs(1))
        .build();

    let report = assert_ok!(broker.publish(&envelope, &no_cancel()).await);

    assert_eq!(report, PublishReport::Expired);
    assert_eq!(log.len(), 0);
    assert_eq!(broker.stats().expired, 1);
}

#[tokio::test]
async fn envelope_within_ttl_is_delivered() {
    let log = CallLog::default();
    let broker = broker(recording_factory(&log, &["SendConfirmation"]), &broker_config(1));
    broker.subscribe("OrderPlaced".into(), "SendConfirmation".into());

    let envelope = Envelope::builder("OrderPlaced", b"{}".to_vec())
        .ttl(Duration::from_secs(60))
        .build();

    assert_ok!(broker.publish(&envelope, &no_cancel()).await);
    assert_eq!(log.count("SendConfirmation"), 1);
    assert_eq!(broker.stats().expired, 0);
}

#[tokio::test]
async fn failing_handler_does_not_prevent_sibling() {
    let log = CallLog::default();
    let factory = recording_factory(&log, &["SendConfirmation"]);
    let failing_log = log.clone();
    factory.register("UpdateInventory", move || Failing {
        name: "UpdateInventory",
        log: failing_log.clone(),
    });

    let broker = broker(factory, &broker_config(1));
    broker.subscribe("OrderPlaced".into(), "SendConfirmation".into());
    broker.subscribe("OrderPlaced".into(), "UpdateInventory".into());

    let report = assert_ok!(broker.publish(&order_envelope(1), &no_cancel()).await);
    let reports = report.handler_reports();
    assert_eq!(reports[0].handler_type, HandlerType::new("SendConfirmation"));
    assert!(reports[0].succeeded());
    assert_eq!(reports[1].handler_type, HandlerType::new("UpdateInventory"));
    assert_eq!(
        reports[1].outcome,
        Err(HandlerError::failed("UpdateInventory is down"))
    );

    // Propagation still runs every handler before reporting
    let err = assert_err!(
        broker
            .publish_with(&order_envelope(2), &no_cancel(), PublishOptions::propagating())
            .await
    );
    match err {
        CourierError::HandlerFailures { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].handler_type, "UpdateInventory");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(log.count("SendConfirmation"), 2);
    assert_eq!(log.count("UpdateInventory"), 2);
}

#[tokio::test]
async fn handlers_run_concurrently() {
    let factory = RegistryHandlerFactory::new();
    factory.register("SlowA", || Sleeping::new(Duration::from_millis(200)));
    factory.register("SlowB", || Sleeping::new(Duration::from_millis(200)));
    let broker = broker(factory, &broker_config(1));
    broker.subscribe("OrderPlaced".into(), "SlowA".into());
    broker.subscribe("OrderPlaced".into(), "SlowB".into());

    let started = Instant::now();
    let report = assert_ok!(broker.publish(&order_envelope(1), &no_cancel()).await);
    let elapsed = started.elapsed();

    assert!(report.is_success());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(390), "took {elapsed:?}");
}

#[tokio::test]
async fn timeout_is_reported_distinctly_and_cancels_the_handler() {
    let handler = Arc::new(Sleeping::new(Duration::from_secs(30)));
    let observed = handler.observed_cancel.clone();
    let factory = RegistryHandlerFactory::new();
    factory.register_shared("Slow", handler);

    let config = BrokerConfig {
        handler_timeout_ms: Some(200),
        ..broker_config(1)
    };
    let broker = broker(factory, &config);
    broker.subscribe("OrderPlaced".into(), "Slow".into());

    let started = Instant::now();
    let report = assert_ok!(broker.publish(&order_envelope(1), &no_cancel()).await);
    let elapsed = started.elapsed();

    let outcome = &report.handler_reports()[0].outcome;
    assert_eq!(
        outcome,
        &Err(HandlerError::TimedOut {
            after: Duration::from_millis(200)
        })
    );
    assert!(outcome.as_ref().unwrap_err().is_timeout());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");

    assert!(
        eventually(Duration::from_secs(1), || {
            let observed = observed.clone();
            async move { observed.load(Ordering::SeqCst) }
        })
        .await,
        "in-flight work should observe cancellation"
    );
}

#[tokio::test]
async fn retry_exhaustion_records_every_attempt() {
    let log = CallLog::default();
    let factory = RegistryHandlerFactory::new();
    let failing_log = log.clone();
    factory.register("UpdateInventory", move || Failing {
        name: "UpdateInventory",
        log: failing_log.clone(),
    });

    let broker = broker(factory, &broker_config(3));
    broker.subscribe("OrderPlaced".into(), "UpdateInventory".into());

    let report = assert_ok!(broker.publish(&order_envelope(1), &no_cancel()).await);

    assert_eq!(log.count("UpdateInventory"), 3);
    let attempts = &report.handler_reports()[0].attempts;
    assert_eq!(attempts.len(), 3);
    for (index, attempt) in attempts.iter().enumerate() {
        assert_eq!(attempt.attempt, index as u32 + 1);
        assert!(attempt.error.contains("UpdateInventory is down"));
        assert!(!attempt.timed_out);
    }
}

#[tokio::test]
async fn cancellation_stops_retries() {
    let log = CallLog::default();
    let factory = RegistryHandlerFactory::new();
    let failing_log = log.clone();
    factory.register("UpdateInventory", move || Failing {
        name: "UpdateInventory",
        log: failing_log.clone(),
    });

    let config = BrokerConfig {
        retry_attempts: 10,
        retry_backoff_ms: 60_000,
        ..Default::default()
    };
    let broker = broker(factory, &config);
    broker.subscribe("OrderPlaced".into(), "UpdateInventory".into());

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let report = assert_ok!(broker.publish(&order_envelope(1), &token).await);

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(log.count("UpdateInventory"), 1);
    assert_eq!(report.handler_reports()[0].outcome, Err(HandlerError::Cancelled));
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let log = CallLog::default();
    let factory = recording_factory(&log, &["SendConfirmation"]);
    factory.register("UpdateInventory", || Panicking);

    let broker = broker(factory, &broker_config(2));
    broker.subscribe("OrderPlaced".into(), "UpdateInventory".into());
    broker.subscribe("OrderPlaced".into(), "SendConfirmation".into());

    let report = assert_ok!(broker.publish(&order_envelope(1), &no_cancel()).await);
    let reports = report.handler_reports();

    match &reports[0].outcome {
        Err(HandlerError::Panicked { message }) => {
            assert!(message.contains("inventory service exploded"))
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    // Panics count as retryable failures
    assert_eq!(reports[0].attempts.len(), 2);
    assert!(reports[1].succeeded());
    assert_eq!(log.count("SendConfirmation"), 1);
}

#[tokio::test]
async fn chaos_injection_fails_before_reaching_handler() {
    let log = CallLog::default();
    let config = BrokerConfig {
        chaos_injection_rate: Some(1.0),
        ..broker_config(2)
    };
    let broker = broker(recording_factory(&log, &["SendConfirmation"]), &config);
    broker.subscribe("OrderPlaced".into(), "SendConfirmation".into());

    let report = assert_ok!(broker.publish(&order_envelope(1), &no_cancel()).await);

    assert!(matches!(
        report.handler_reports()[0].outcome,
        Err(HandlerError::Injected { .. })
    ));
    assert_eq!(log.len(), 0);
}

#[tokio::test]
async fn transport_acknowledges_success_and_abandons_failure() {
    let log = CallLog::default();
    let factory = recording_factory(&log, &["SendConfirmation"]);
    let failing_log = log.clone();
    factory.register("UpdateInventory", move || Failing {
        name: "UpdateInventory",
        log: failing_log.clone(),
    });
    let broker = broker(factory, &broker_config(1));
    broker.subscribe("OrderPlaced".into(), "SendConfirmation".into());
    broker.subscribe("OrderCancelled".into(), "UpdateInventory".into());

    let placed = WireMessage::from_envelope(&order_envelope(1));
    let cancelled =
        WireMessage::from_envelope(&Envelope::builder("OrderCancelled", b"{}".to_vec()).build());

    assert_eq!(
        deliver(broker.as_ref(), placed, &no_cancel()).await,
        TransportDisposition::Acknowledge
    );
    assert_eq!(
        deliver(broker.as_ref(), cancelled, &no_cancel()).await,
        TransportDisposition::Abandon
    );
    assert_eq!(log.entries(), vec!["SendConfirmation", "UpdateInventory"]);
}
