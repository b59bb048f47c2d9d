use std::{sync::Arc, time::Duration};

use anyhow::Result;
use outbox_dispatcher::{
    clients::{
        adapter::{AdapterRegistry, ChannelAdapter},
        webhook::{SigningSecrets, WebhookAdapter},
    },
    dispatcher::Dispatcher,
    egress::EgressFilter,
    models::{
        circuit_breaker::CircuitState,
        rule::{Channel, NotificationRule},
        status::EventStatus,
    },
};
use uuid::Uuid;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use crate::common::{Harness, breaker_config, dispatcher_config};

struct Scenario {
    harness: Harness,
    server: MockServer,
    rule: NotificationRule,
    webhook: WebhookAdapter,
    dispatcher: Dispatcher,
}

/// Webhook rule, max_attempts=2, breaker threshold=1, cooldown=60s.
async fn scenario() -> Result<Scenario> {
    let harness = Harness::new(breaker_config(1, 60));
    let server = MockServer::start().await;

    let rule = harness
        .rule(
            NotificationRule::new(Uuid::new_v4(), "order.ready", Channel::Webhook)
                .with_url(format!("{}/hooks/orders", server.uri())),
        )
        .await;

    let egress = EgressFilter::new(&["127.0.0.1".to_string()], &[])?.allow_private(true);
    let webhook = WebhookAdapter::new(
        Arc::new(egress),
        SigningSecrets::new(Some("whsec_e2e".to_string())),
        harness.clock(),
        Duration::from_secs(2),
    );

    let dispatcher = harness.dispatcher_with(
        "worker-e2e",
        AdapterRegistry::standard(webhook.clone()),
        dispatcher_config(2, &[60]),
    );

    Ok(Scenario {
        harness,
        server,
        rule,
        webhook,
        dispatcher,
    })
}

async fn request_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map(|requests| requests.len())
        .unwrap_or_default()
}

/// Test: Failure opens the breaker, the cooldown blocks calls, a successful trial delivers and closes it
#[tokio::test]
async fn test_breaker_recovers_after_successful_trial() -> Result<()> {
    let Scenario {
        harness,
        server,
        rule,
        webhook,
        dispatcher,
    } = scenario().await?;

    Mock::given(method("POST"))
        .and(path("/hooks/orders"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks/orders"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let event = harness.enqueue(rule.id, 0).await;
    let destination = webhook.destination(&rule);
    let observer = harness.breaker("observer");

    dispatcher.poll_once().await?;
    assert_eq!(harness.store.event(event.id).await.unwrap().attempts, 1);
    assert_eq!(observer.state(&destination).await?.state, CircuitState::Open);
    assert_eq!(request_count(&server).await, 1);

    harness.clock.advance_secs(30);
    dispatcher.poll_once().await?;
    assert_eq!(request_count(&server).await, 1, "No calls during the cooldown");
    assert_eq!(harness.store.event(event.id).await.unwrap().attempts, 1);

    harness.clock.advance_secs(30);
    let report = dispatcher.poll_once().await?;
    assert_eq!(report.delivered, 1);
    assert_eq!(request_count(&server).await, 2);

    let stored = harness.store.event(event.id).await.unwrap();
    assert_eq!(stored.status, EventStatus::Delivered);
    assert_eq!(stored.attempts, 2);

    let state = observer.state(&destination).await?;
    assert_eq!(state.state, CircuitState::Closed);
    assert_eq!(state.failure_count, 0);
    assert_eq!(state.opened_until, None);

    Ok(())
}

/// Test: A failed trial on the last allowed attempt dead-letters the event for good
#[tokio::test]
async fn test_failed_trial_dead_letters_event() -> Result<()> {
    let Scenario {
        harness,
        server,
        rule,
        webhook,
        dispatcher,
    } = scenario().await?;

    Mock::given(method("POST"))
        .and(path("/hooks/orders"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database is down"))
        .mount(&server)
        .await;

    let event = harness.enqueue(rule.id, 0).await;

    dispatcher.poll_once().await?;
    harness.clock.advance_secs(30);
    dispatcher.poll_once().await?;
    assert_eq!(request_count(&server).await, 1);

    harness.clock.advance_secs(30);
    let report = dispatcher.poll_once().await?;
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(request_count(&server).await, 2);

    assert!(harness.store.event(event.id).await.is_none());

    let dead_letters = harness.store.dead_letters().await;
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].original_id, event.id);
    assert_eq!(dead_letters[0].target, format!("{}/hooks/orders", server.uri()));
    assert!(dead_letters[0].error.contains("HTTP 500"));
    assert!(dead_letters[0].error.contains("database is down"));

    assert_eq!(
        harness
            .breaker("observer")
            .state(&webhook.destination(&rule))
            .await?
            .state,
        CircuitState::Open,
        "Failed trial re-opens the breaker"
    );

    for _ in 0..3 {
        harness.clock.advance_secs(3600);
        assert_eq!(dispatcher.poll_once().await?.claimed, 0);
    }
    assert_eq!(request_count(&server).await, 2);

    Ok(())
}
