use axum::routing::post;
use axum::Router;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stormcloud_common::{RuleDraft, SubstitutionDraft, VariantDraft};
use stormcloud_core::{MemoryStore, ServerConfig, StubServer};
use tokio::net::TcpListener;

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn spawn_stub(store: Arc<MemoryStore>) -> String {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = StubServer::new(ServerConfig::default(), store);
    tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            eprintln!("Stub server failed: {}", e);
        }
    });
    format!("http://{}", addr)
}

fn rule(path: &str, verb: &str, action: &str) -> RuleDraft {
    RuleDraft {
        vendor_id: None,
        hostname: "127.0.0.1".to_string(),
        path: path.to_string(),
        verb: verb.to_string(),
        action: action.to_string(),
        delay_ms: None,
        live_url: None,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_stub_server_over_tcp() {
    let store = Arc::new(MemoryStore::new());
    let base = spawn_stub(store.clone()).await;
    let client = client();

    // First contact discovers the endpoint
    let resp = client.get(format!("{}/stripe/post/", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "");
    let rules = store.rules().await;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].hostname, "127.0.0.1");

    // Health stays outside interception
    let resp = client.get(format!("{}/admin/health", base)).send().await.unwrap();
    assert!(resp.status().is_success());
    assert_eq!(store.rules().await.len(), 1);
}

#[tokio::test]
async fn test_redirect_location_is_post_substitution() {
    let store = Arc::new(MemoryStore::new());
    let redirect = store.add_rule(rule("/login", "GET", "302")).await.unwrap();
    store
        .add_variant(
            redirect.id,
            VariantDraft {
                body: "https://vendor.example.com/callback".to_string(),
                active: true,
            },
        )
        .await
        .unwrap();
    store
        .add_substitution(
            redirect.id,
            SubstitutionDraft {
                position: 0,
                find: "vendor.example.com".to_string(),
                replace: "localhost:3000".to_string(),
                active: true,
            },
        )
        .await
        .unwrap();
    let base = spawn_stub(store).await;

    let resp = client().get(format!("{}/login", base)).send().await.unwrap();
    assert_eq!(resp.status(), 302);
    assert_eq!(
        resp.headers().get("location").unwrap(),
        "https://localhost:3000/callback"
    );
}

#[tokio::test]
async fn test_live_post_forwards_method_and_body() {
    let target = spawn(Router::new().route(
        "/v1/charges",
        post(|body: String| async move { format!("sandbox charged {}", body) }),
    ))
    .await;

    let store = Arc::new(MemoryStore::new());
    let mut live = rule("/v1/charges", "POST", "live");
    live.live_url = Some(format!("{}/v1/charges", target));
    let live = store.add_rule(live).await.unwrap();
    store
        .add_substitution(
            live.id,
            SubstitutionDraft {
                position: 0,
                find: "sandbox".to_string(),
                replace: "stub".to_string(),
                active: true,
            },
        )
        .await
        .unwrap();
    let base = spawn_stub(store).await;

    let resp = client()
        .post(format!("{}/v1/charges", base))
        .header("content-type", "application/x-www-form-urlencoded")
        .body("amount=2000")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "stub charged amount=2000");
}

#[tokio::test]
async fn test_delay_floor_over_tcp() {
    let store = Arc::new(MemoryStore::new());
    let mut delayed = rule("/slow", "GET", "flat");
    delayed.delay_ms = Some(200);
    store.add_rule(delayed).await.unwrap();
    let base = spawn_stub(store).await;

    let started = Instant::now();
    let resp = client().get(format!("{}/slow", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(started.elapsed() >= Duration::from_millis(200));
}
