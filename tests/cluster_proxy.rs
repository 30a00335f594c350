//! Cross-server forwarding against a shared Redis registry.
//!
//! These tests need a live Redis. Run them with:
//!
//! ```sh
//! TUNGO_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored
//! ```

use std::time::Duration;

mod common;

fn redis_url() -> String {
    std::env::var("TUNGO_TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn request_on_wrong_server_is_forwarded_to_owner() {
    let redis = redis_url();
    common::start_mock_origin(28210, "hello from s1").await;

    let s1 = common::TestServer::start_distributed("s1", 28211, 28212, &redis).await;
    let s2 = common::TestServer::start_distributed("s2", 28213, 28214, &redis).await;

    // The tunnel lives on s1.
    let client = common::TestClient::connect(28212, 28210, Some("demo"), None).await;
    assert_eq!(client.sub_domain, "demo");
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A public request landing on s2 is forwarded to s1 and answered
    // verbatim, with the forwarding diagnostic added.
    let hostname = "demo.localhost";
    let http = common::public_client(hostname, 28213);
    let response = http
        .get(format!("http://{}:28213/", hostname))
        .send()
        .await
        .expect("public request via s2 failed");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-tungo-proxied-by")
            .and_then(|v| v.to_str().ok()),
        Some("s1")
    );
    assert_eq!(response.text().await.unwrap(), "hello from s1");

    client.disconnect().await;
    s1.shutdown.trigger();
    s2.shutdown.trigger();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn unregister_propagates_to_peers() {
    let redis = redis_url();
    common::start_mock_origin(28220, "short lived").await;

    let s1 = common::TestServer::start_distributed("s3", 28221, 28222, &redis).await;
    let s2 = common::TestServer::start_distributed("s4", 28223, 28224, &redis).await;

    let client = common::TestClient::connect(28222, 28220, Some("fleeting"), None).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    client.disconnect().await;
    // Bounded by cache TTL plus invalidation latency.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let hostname = "fleeting.localhost";
    let http = common::public_client(hostname, 28223);
    let response = http
        .get(format!("http://{}:28223/", hostname))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    s1.shutdown.trigger();
    s2.shutdown.trigger();
}
