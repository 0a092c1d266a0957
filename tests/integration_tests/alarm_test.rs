//! Webhook alarm delivery against a mock endpoint

use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lanesync::config::AlarmConfig;
use lanesync::notifications::{
    Alarm, AlarmKind, AlarmSink, Channel, NotificationManager, WebhookChannel, WebhookConfig,
};

use super::fixtures::wait_until;

fn stop_alarm() -> Alarm {
    Alarm::task(AlarmKind::TaskStop, "T1", "S1", "T1-S1 stopped", "batch 2 failed to load")
        .with_recipients(vec!["dba".to_string()])
}

fn channel(server: &MockServer, max_retries: u32) -> WebhookChannel {
    let config = WebhookConfig::new(format!("{}/alarms", server.uri()))
        .with_auth_token("secret")
        .with_max_retries(max_retries)
        .with_backoff_base_ms(5);
    WebhookChannel::new(config).unwrap()
}

#[tokio::test]
async fn test_webhook_sends_bearer_token_and_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alarms"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let status = channel(&server, 3).send(&stop_alarm()).await.unwrap();
    assert!(status.success);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["kind"], "task_stop");
    assert_eq!(body["task_id"], "T1");
    assert_eq!(body["message"], "batch 2 failed to load");
    assert_eq!(body["recipients"][0], "dba");
}

#[tokio::test]
async fn test_webhook_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let status = channel(&server, 2).send(&stop_alarm()).await.unwrap();
    assert!(!status.success);
    assert!(status.message.unwrap().contains("503"));
}

#[tokio::test]
async fn test_webhook_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let status = channel(&server, 3).send(&stop_alarm()).await.unwrap();
    assert!(status.success);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_webhook_does_not_retry_client_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let status = channel(&server, 3).send(&stop_alarm()).await.unwrap();
    assert!(!status.success);
}

#[tokio::test]
async fn test_manager_suppresses_repeats_inside_window() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alarms"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = AlarmConfig {
        webhook_url: Some(format!("{}/alarms", server.uri())),
        recipients: vec!["oncall".to_string()],
        ..AlarmConfig::default()
    };
    let manager = Arc::new(NotificationManager::from_config(&config).unwrap());
    assert_eq!(manager.channel_count(), 2);

    manager.notify(stop_alarm());
    manager.notify(stop_alarm());
    manager.notify(Alarm::task(
        AlarmKind::TaskWarning,
        "T1",
        "S1",
        "backlog",
        "unconsumed events: 20000, alarm threshold: 10000",
    ));

    let mock = &server;
    assert!(
        wait_until(Duration::from_secs(2), || async move {
            mock.received_requests().await.unwrap_or_default().len() >= 2
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let kinds: Vec<String> = requests
        .iter()
        .map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            assert!(body["recipients"]
                .as_array()
                .unwrap()
                .iter()
                .any(|v| v == "oncall"));
            body["kind"].as_str().unwrap().to_string()
        })
        .collect();
    assert!(kinds.contains(&"task_stop".to_string()));
    assert!(kinds.contains(&"task_warning".to_string()));
}
