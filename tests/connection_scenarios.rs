//! End-to-end connection lifecycle scenarios on a scripted transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;

use common::*;
use rtlink::{
    Action, ClientOptions, ConnectionState, ErrorInfo, RtClient,
};

fn setup(
    options: ClientOptions,
) -> (RtClient, Arc<ScriptedFactory>, Arc<CountingCredentials>) {
    let factory = ScriptedFactory::new();
    let credentials = CountingCredentials::new("token-0");
    let client = RtClient::new(options, credentials.clone(), factory.clone())
        .expect("options must validate");
    (client, factory, credentials)
}

#[tokio::test(start_paused = true)]
async fn connects_against_primary_host() {
    let (client, factory, _) = setup(ClientOptions::default());

    client.connect().await;
    eventually(|| factory.link_count() == 1).await;
    assert_eq!(factory.opens()[0].host, rtlink::config::DEFAULT_HOST);

    factory
        .link(0)
        .send_frame(connected_frame("conn-1", "key-1"))
        .await;
    eventually(|| client.state() == ConnectionState::Connected).await;

    assert_eq!(client.connection_id().as_deref(), Some("conn-1"));
    assert_eq!(client.recovery_key().as_deref(), Some("conn-1:key-1:-1"));
}

#[tokio::test(start_paused = true)]
async fn first_reconnect_is_immediate_then_spaced_by_retry_timeout() {
    // Scenario: disconnectedRetryTimeout = 2s.
    let (client, factory, _) = setup(ClientOptions {
        disconnected_retry_timeout: Duration::from_secs(2),
        ..Default::default()
    });

    client.connect().await;
    eventually(|| factory.link_count() == 1).await;
    factory
        .link(0)
        .send_frame(connected_frame("conn-1", "key-1"))
        .await;
    eventually(|| client.state() == ConnectionState::Connected).await;

    // The immediate retry will fail, forcing a second, delayed attempt.
    factory.fail_next_open(ErrorInfo::connection_disconnected());
    let dropped_at = tokio::time::Instant::now();
    factory.link(0).drop_transport(None).await;

    eventually(|| factory.open_count() == 2).await;
    let opens = factory.opens();
    assert!(
        opens[1].at.duration_since(dropped_at) < Duration::from_millis(100),
        "first reconnect attempt must be immediate"
    );

    eventually(|| factory.open_count() == 3).await;
    let opens = factory.opens();
    assert!(
        opens[2].at.duration_since(opens[1].at) >= Duration::from_secs(2),
        "second reconnect attempt must wait the retry timeout"
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_resume_with_key_and_serial() {
    let (client, factory, _) = setup(ClientOptions::default());

    client.connect().await;
    eventually(|| factory.link_count() == 1).await;
    factory
        .link(0)
        .send_frame(connected_frame("conn-1", "key-1"))
        .await;
    eventually(|| client.state() == ConnectionState::Connected).await;

    factory.link(0).drop_transport(None).await;
    eventually(|| factory.open_count() == 2).await;

    let resume = factory.opens()[1].resume.clone().expect("must try resume");
    assert_eq!(resume.connection_key, "key-1");
    assert_eq!(resume.connection_serial, -1);

    // Service honors the resume: same connection id.
    factory
        .link(1)
        .send_frame(connected_frame("conn-1", "key-1"))
        .await;
    eventually(|| client.state() == ConnectionState::Connected).await;
    assert_eq!(client.connection_id().as_deref(), Some("conn-1"));
}

#[tokio::test(start_paused = true)]
async fn token_expiry_renews_silently_without_failing() {
    // Scenario: ERROR 40140 while connected.
    let (client, factory, credentials) = setup(ClientOptions::default());
    credentials.push_token("token-1");

    client.connect().await;
    eventually(|| factory.link_count() == 1).await;
    factory
        .link(0)
        .send_frame(connected_frame("conn-1", "key-1"))
        .await;
    eventually(|| client.state() == ConnectionState::Connected).await;

    let seen_states = Arc::new(Mutex::new(Vec::new()));
    let mut stream = client.connection_states().await.unwrap();
    let collector = seen_states.clone();
    tokio::spawn(async move {
        while let Some(change) = stream.next().await {
            collector.lock().push(change.current);
        }
    });

    factory
        .link(0)
        .send_frame(error_frame(ErrorInfo::new(40140, 401, "token expired")))
        .await;

    eventually(|| factory.open_count() == 2).await;
    assert_eq!(credentials.renewal_count(), 1, "renew() must run exactly once");
    assert_eq!(factory.opens()[1].token, "token-1");

    factory
        .link(1)
        .send_frame(connected_frame("conn-1", "key-1"))
        .await;
    eventually(|| client.state() == ConnectionState::Connected).await;

    let states = seen_states.lock().clone();
    assert!(states.contains(&ConnectionState::Connecting));
    assert!(states.contains(&ConnectionState::Connected));
    assert!(
        !states.contains(&ConnectionState::Failed),
        "token expiry must never surface as failed"
    );
}

#[tokio::test(start_paused = true)]
async fn renewal_failure_is_fatal() {
    let (client, factory, credentials) = setup(ClientOptions::default());

    client.connect().await;
    eventually(|| factory.link_count() == 1).await;
    factory
        .link(0)
        .send_frame(connected_frame("conn-1", "key-1"))
        .await;
    eventually(|| client.state() == ConnectionState::Connected).await;

    credentials.fail_next_renewal(ErrorInfo::new(40141, 401, "token revoked"));
    factory
        .link(0)
        .send_frame(error_frame(ErrorInfo::new(40142, 401, "token expired")))
        .await;

    eventually(|| client.state() == ConnectionState::Failed).await;
    assert_eq!(client.error_reason().unwrap().code, 40141);
}

#[tokio::test(start_paused = true)]
async fn fatal_error_frame_fails_connection() {
    let (client, factory, _) = setup(ClientOptions::default());

    client.connect().await;
    eventually(|| factory.link_count() == 1).await;
    factory
        .link(0)
        .send_frame(connected_frame("conn-1", "key-1"))
        .await;
    eventually(|| client.state() == ConnectionState::Connected).await;

    factory
        .link(0)
        .send_frame(error_frame(ErrorInfo::new(40400, 404, "application disabled")))
        .await;

    eventually(|| client.state() == ConnectionState::Failed).await;
    assert_eq!(client.error_reason().unwrap().code, 40400);

    // close() from failed reports an invalid transition.
    let err = client.close().await.expect_err("close from failed must error");
    assert_eq!(err.code, 90001);
}

#[tokio::test(start_paused = true)]
async fn fallback_hosts_are_tried_in_nonrepeating_order_then_primary() {
    let fallbacks: Vec<String> = vec!["fb-a".into(), "fb-b".into(), "fb-c".into()];
    let (client, factory, _) = setup(ClientOptions {
        fallback_hosts: Some(fallbacks.clone()),
        disconnected_retry_timeout: Duration::from_millis(20),
        ..Default::default()
    });

    for _ in 0..5 {
        factory.fail_next_open(ErrorInfo::connection_disconnected());
    }
    client.connect().await;

    eventually(|| factory.open_count() >= 5).await;
    let opens = factory.opens();

    assert_eq!(opens[0].host, rtlink::config::DEFAULT_HOST);
    let mut tried: Vec<String> = opens[1..4].iter().map(|o| o.host.clone()).collect();
    tried.sort();
    let mut expected = fallbacks.clone();
    expected.sort();
    assert_eq!(tried, expected, "each fallback host exactly once");
    assert_eq!(opens[4].host, rtlink::config::DEFAULT_HOST);
}

#[tokio::test(start_paused = true)]
async fn empty_fallback_list_only_attempts_primary() {
    let (client, factory, _) = setup(ClientOptions {
        fallback_hosts: Some(Vec::new()),
        disconnected_retry_timeout: Duration::from_millis(20),
        ..Default::default()
    });

    for _ in 0..4 {
        factory.fail_next_open(ErrorInfo::connection_disconnected());
    }
    client.connect().await;

    eventually(|| factory.open_count() >= 4).await;
    assert!(factory
        .opens()
        .iter()
        .all(|o| o.host == rtlink::config::DEFAULT_HOST));
}

#[tokio::test(start_paused = true)]
async fn retry_cycle_exhaustion_suspends_connection() {
    let (client, factory, _) = setup(ClientOptions {
        disconnected_retry_timeout: Duration::from_millis(30),
        suspended_retry_timeout: Duration::from_millis(50),
        max_connection_state_ttl: Duration::from_millis(100),
        ..Default::default()
    });

    for _ in 0..16 {
        factory.fail_next_open(ErrorInfo::connection_disconnected());
    }
    client.connect().await;

    eventually(|| client.state() == ConnectionState::Suspended).await;

    // Suspended retries keep running; eventually one succeeds.
    eventually(|| {
        factory.open_count() > 16 && factory.link_count() >= 1
    })
    .await;
    factory
        .last_link()
        .send_frame(connected_frame("conn-1", "key-1"))
        .await;
    eventually(|| client.state() == ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn close_sends_close_and_awaits_closed() {
    let (client, factory, _) = setup(ClientOptions::default());

    client.connect().await;
    eventually(|| factory.link_count() == 1).await;
    let link = factory.link(0);
    link.send_frame(connected_frame("conn-1", "key-1")).await;
    eventually(|| client.state() == ConnectionState::Connected).await;

    let closer = {
        let client = client.clone();
        tokio::spawn(async move { client.close().await })
    };
    eventually(|| !link.sent_with_action(Action::Close).is_empty()).await;
    link.send_frame(closed_frame()).await;

    closer.await.unwrap().expect("close must complete");
    assert_eq!(client.state(), ConnectionState::Closed);

    // Idempotent from closed.
    client.close().await.expect("close from closed is a no-op");
}

#[tokio::test(start_paused = true)]
async fn close_cancels_pending_reconnect() {
    let (client, factory, _) = setup(ClientOptions {
        disconnected_retry_timeout: Duration::from_secs(5),
        ..Default::default()
    });

    client.connect().await;
    eventually(|| factory.link_count() == 1).await;
    factory
        .link(0)
        .send_frame(connected_frame("conn-1", "key-1"))
        .await;
    eventually(|| client.state() == ConnectionState::Connected).await;

    factory.fail_next_open(ErrorInfo::connection_disconnected());
    factory.link(0).drop_transport(None).await;
    eventually(|| client.state() == ConnectionState::Disconnected).await;

    let attempts_before = factory.open_count();
    client.close().await.expect("close while disconnected");
    assert_eq!(client.state(), ConnectionState::Closed);

    // Let the cancelled retry window pass; no new attempt may appear.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(factory.open_count(), attempts_before);
}

#[tokio::test(start_paused = true)]
async fn recovery_key_resumes_after_full_restart() {
    let (client, factory, _) = setup(ClientOptions::default());

    client.connect().await;
    eventually(|| factory.link_count() == 1).await;
    factory
        .link(0)
        .send_frame(connected_frame("conn-1", "key-1"))
        .await;
    eventually(|| client.state() == ConnectionState::Connected).await;
    let recovery_key = client.recovery_key().expect("recovery key available");
    client.close().await.expect("clean close");

    // Brand-new client instance, recovered session.
    let factory2 = ScriptedFactory::new();
    let credentials2 = CountingCredentials::new("token-0");
    let recovered = RtClient::new(
        ClientOptions {
            recover: Some(recovery_key),
            ..Default::default()
        },
        credentials2,
        factory2.clone(),
    )
    .unwrap();

    recovered.connect().await;
    eventually(|| factory2.open_count() == 1).await;
    let resume = factory2.opens()[0].resume.clone().expect("must resume");
    assert_eq!(resume.connection_key, "key-1");
}
