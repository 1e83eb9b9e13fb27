//! Job-loop behavior: validation, progress events, publish envelopes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::crypto::AesGcmTokenCipher;
use courier_core::{Dispatcher, Lanes, TracingJobLog};
use courier_domain::{
    GrantConfig, GrantKind, OAuth2Endpoints, ProviderConfig, ProviderKind, SigningConfig,
    StoragelessConfig, TmpConfig, Tokens,
};
use courier_worker::job::{JobLoop, JobPublisher, JobSource};
use tokio::sync::{mpsc, Mutex};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct ChannelSource {
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

#[async_trait]
impl JobSource for ChannelSource {
    async fn next_job(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

#[derive(Default)]
struct CapturePublisher {
    messages: Mutex<Vec<serde_json::Value>>,
    notify: tokio::sync::Notify,
}

#[async_trait]
impl JobPublisher for CapturePublisher {
    async fn publish(&self, _tube: &str, message: serde_json::Value) {
        self.messages.lock().await.push(message);
        self.notify.notify_waiters();
    }
}

impl CapturePublisher {
    /// Wait until a message matching `predicate` arrives and return it.
    async fn wait_for(&self, predicate: impl Fn(&serde_json::Value) -> bool) -> serde_json::Value {
        loop {
            {
                let messages = self.messages.lock().await;
                if let Some(found) = messages.iter().find(|m| predicate(m)) {
                    return found.clone();
                }
            }
            self.notify.notified().await;
        }
    }
}

fn provider(idp: &MockServer, seed_access: &str) -> ProviderConfig {
    ProviderConfig {
        kind: ProviderKind::Storageless,
        oauth2: OAuth2Endpoints {
            authorization_url: format!("{}/authorize", idp.uri()),
            token_url: format!("{}/token", idp.uri()),
            client_id: "cid".into(),
            client_secret: "shh".into(),
            redirect_uri: String::new(),
            scope: String::new(),
        },
        grant: GrantConfig {
            kind: GrantKind::ClientCredentials,
            rfc_6749_strict: false,
            formpost: false,
        },
        headers: BTreeMap::new(),
        headers_per_method: BTreeMap::new(),
        secret_headers: Vec::new(),
        signing: SigningConfig::default(),
        templates: None,
        tmp: TmpConfig::default(),
        storage: None,
        storageless: Some(StoragelessConfig {
            headers: BTreeMap::new(),
            tokens: Tokens {
                token_type: "Bearer".into(),
                access: seed_access.into(),
                ..Default::default()
            },
        }),
    }
}

struct Harness {
    publisher: Arc<CapturePublisher>,
    tx: mpsc::UnboundedSender<String>,
}

async fn harness(idp: &MockServer) -> Harness {
    let lanes = Lanes::start();
    let dispatcher = Dispatcher::new(
        Arc::clone(&lanes),
        Arc::new(AesGcmTokenCipher::new(&[5u8; 32]).unwrap()),
        Arc::new(TracingJobLog),
    );
    dispatcher.setup([("proxy".to_string(), provider(idp, "W1"))], None).unwrap();

    let publisher = Arc::new(CapturePublisher::default());
    let job_loop = JobLoop::new(
        lanes,
        dispatcher,
        Arc::clone(&publisher) as Arc<dyn JobPublisher>,
        "proxy".to_string(),
        "courier-test/1.0".to_string(),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let source = Arc::new(ChannelSource { rx: Mutex::new(rx) });
    tokio::spawn(job_loop.run(source));

    Harness { publisher, tx }
}

#[tokio::test]
async fn missing_http_object_publishes_400() {
    let idp = MockServer::start().await;
    let h = harness(&idp).await;

    h.tx.send(r#"{"id": 11, "tube": "proxy"}"#.to_string()).unwrap();

    let error = h.publisher.wait_for(|m| m["__id__"] == 11 && m["code"] == 400).await;
    assert!(error["error"].as_str().unwrap().contains("http"));
    let done = h
        .publisher
        .wait_for(|m| m["__id__"] == 11 && m["step"] == "Done")
        .await;
    assert_eq!(done["status"], "Failed");
}

#[tokio::test]
async fn missing_url_publishes_400() {
    let idp = MockServer::start().await;
    let h = harness(&idp).await;

    h.tx
        .send(r#"{"id": 12, "tube": "proxy", "http": {"method": "GET"}}"#.to_string())
        .unwrap();

    let error = h.publisher.wait_for(|m| m["__id__"] == 12 && m["code"] == 400).await;
    assert!(error["error"].as_str().unwrap().contains("url"));
}

#[tokio::test]
async fn successful_job_publishes_progress_and_response() {
    let idp = MockServer::start().await;
    let api = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("Authorization", "Bearer W1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"u":1}"#, "application/json"))
        .expect(1)
        .mount(&api)
        .await;

    let h = harness(&idp).await;
    let job = serde_json::json!({
        "id": 21,
        "tube": "proxy",
        "http": { "method": "GET", "url": format!("{}/me", api.uri()) }
    });
    h.tx.send(job.to_string()).unwrap();

    let doing = h
        .publisher
        .wait_for(|m| m["__id__"] == 21 && m["step"] == "DoingIt")
        .await;
    assert_eq!(doing["status"], "InProgress");

    let response = h
        .publisher
        .wait_for(|m| m["__id__"] == 21 && m.get("body").is_some())
        .await;
    assert_eq!(response["body"]["u"], 1);
    assert_eq!(response["content-type"], "application/json");

    let done = h
        .publisher
        .wait_for(|m| m["__id__"] == 21 && m["step"] == "Done")
        .await;
    assert_eq!(done["status"], "Completed");
}

#[tokio::test]
async fn unknown_provider_field_overrides_the_tube() {
    let idp = MockServer::start().await;
    let h = harness(&idp).await;

    let job = serde_json::json!({
        "id": 31,
        "tube": "proxy",
        "provider": "nope",
        "http": { "method": "GET", "url": "http://127.0.0.1:9/x" }
    });
    h.tx.send(job.to_string()).unwrap();

    let error = h.publisher.wait_for(|m| m["__id__"] == 31 && m["code"] == 400).await;
    assert!(error["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn primitive_job_publishes_framed_data() {
    let idp = MockServer::start().await;
    let api = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"k":"a,b"}"#, "application/json"))
        .mount(&api)
        .await;

    let h = harness(&idp).await;
    let job = serde_json::json!({
        "id": 41,
        "tube": "proxy",
        "primitive": true,
        "http": { "method": "GET", "url": format!("{}/me", api.uri()) }
    });
    h.tx.send(job.to_string()).unwrap();

    let response = h
        .publisher
        .wait_for(|m| m["__id__"] == 41 && m.get("data").is_some())
        .await;
    assert!(response["data"].as_str().unwrap().starts_with("!200,"));
}

#[tokio::test]
async fn unsupported_method_publishes_400() {
    let idp = MockServer::start().await;
    let h = harness(&idp).await;

    let job = serde_json::json!({
        "id": 51,
        "tube": "proxy",
        "http": { "method": "TRACE", "url": "http://127.0.0.1:9/x" }
    });
    h.tx.send(job.to_string()).unwrap();

    let error = h.publisher.wait_for(|m| m["__id__"] == 51 && m["code"] == 400).await;
    assert!(error["error"].as_str().unwrap().contains("TRACE"));
}
