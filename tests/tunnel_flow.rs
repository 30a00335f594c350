//! End-to-end tunnel tests against the in-memory registry variant.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as TgMessage;

use tungo::protocol::{ClientHello, ServerHello, ServerHelloType};

mod common;

#[tokio::test]
async fn happy_path_anonymous_client() {
    common::start_mock_origin(28110, "hello").await;
    let server = common::TestServer::start("s1", 28111, 28112).await;

    let client = common::TestClient::connect(28112, 28110, None, None).await;
    let sub = client.sub_domain.clone();
    assert_eq!(sub.len(), 8, "anonymous clients get an 8-char subdomain");

    let hostname = format!("{}.localhost", sub);
    let http = common::public_client(&hostname, 28111);
    let response = http
        .get(format!("http://{}:28111/", hostname))
        .send()
        .await
        .expect("public request failed");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-tungo-subdomain")
            .and_then(|v| v.to_str().ok()),
        Some(sub.as_str())
    );
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/plain")
    );
    let body = response.text().await.unwrap();
    assert_eq!(body, "hello");

    client.disconnect().await;
    server.shutdown.trigger();
}

#[tokio::test]
async fn subdomain_preserved_across_reconnect() {
    common::start_mock_origin(28120, "ok").await;
    let server = common::TestServer::start("s1", 28121, 28122).await;

    let client = common::TestClient::connect(28122, 28120, Some("demo"), None).await;
    assert_eq!(client.sub_domain, "demo");

    // Drop the control connection mid-life.
    let mut engine = client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The engine re-sends the remembered subdomain and the server grants it
    // again, because the previous tunnel entry was removed on close.
    engine.connect().await.expect("reconnect failed");
    assert_eq!(
        engine.server_info().and_then(|i| i.sub_domain.as_deref()),
        Some("demo")
    );

    server.shutdown.trigger();
}

#[tokio::test]
async fn subdomain_conflict_is_rejected() {
    common::start_mock_origin(28130, "ok").await;
    let server = common::TestServer::start("s1", 28131, 28132).await;

    let holder = common::TestClient::connect(28132, 28130, Some("shared"), None).await;
    assert_eq!(holder.sub_domain, "shared");

    // A second client asking for the same subdomain is turned away.
    let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:28132/ws")
        .await
        .expect("control dial failed");
    let hello = ClientHello::new(Some("shared".into()), None);
    ws.send(TgMessage::Text(
        serde_json::to_string(&hello).unwrap().into(),
    ))
    .await
    .unwrap();

    let reply = ws.next().await.expect("no server hello").unwrap();
    let TgMessage::Text(text) = reply else {
        panic!("expected text hello")
    };
    let server_hello: ServerHello = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(server_hello.hello_type, ServerHelloType::SubDomainInUse);

    holder.disconnect().await;
    server.shutdown.trigger();
}

#[tokio::test]
async fn invalid_subdomain_is_rejected() {
    let server = common::TestServer::start("s1", 28171, 28172).await;

    let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:28172/ws")
        .await
        .expect("control dial failed");
    let hello = ClientHello::new(Some("Not-Valid!".into()), None);
    ws.send(TgMessage::Text(
        serde_json::to_string(&hello).unwrap().into(),
    ))
    .await
    .unwrap();

    let reply = ws.next().await.expect("no server hello").unwrap();
    let TgMessage::Text(text) = reply else {
        panic!("expected text hello")
    };
    let server_hello: ServerHello = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(server_hello.hello_type, ServerHelloType::InvalidSubDomain);

    server.shutdown.trigger();
}

#[tokio::test]
async fn password_protected_tunnel() {
    common::start_mock_origin(28140, "secret content").await;
    let server = common::TestServer::start("s1", 28141, 28142).await;

    let client = common::TestClient::connect(28142, 28140, Some("secure"), Some("letmein")).await;
    assert_eq!(client.sub_domain, "secure");

    let hostname = "secure.localhost";
    let http = common::public_client(hostname, 28141);
    let base = format!("http://{}:28141/", hostname);

    // No credentials: password prompt.
    let response = http.get(&base).send().await.unwrap();
    assert_eq!(response.status(), 401);
    let body = response.text().await.unwrap();
    assert!(body.contains("Authentication Required"));

    // Wrong header password: JSON error.
    let response = http
        .get(&base)
        .header("x-tungo-password", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body = response.text().await.unwrap();
    assert!(body.contains("\"authenticated\": false"));

    // Correct header password: acknowledgement plus auth cookie.
    let response = http
        .get(&base)
        .header("x-tungo-password", "letmein")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let cookie = response
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .expect("no auth cookie set")
        .to_string();
    assert!(cookie.starts_with("tungo-auth-secure="));
    let body = response.text().await.unwrap();
    assert_eq!(body, r#"{"authenticated": true}"#);

    // The cookie alone unlocks the tunnel.
    let cookie_pair = cookie.split(';').next().unwrap();
    let response = http
        .get(&base)
        .header("cookie", cookie_pair)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "secret content");

    client.disconnect().await;
    server.shutdown.trigger();
}

#[tokio::test]
async fn burst_response_completes_on_idle_window() {
    common::start_burst_origin(28150, 9000).await;
    let server = common::TestServer::start("s1", 28151, 28152).await;

    let client = common::TestClient::connect(28152, 28150, Some("burst"), None).await;
    let hostname = "burst.localhost";
    let http = common::public_client(hostname, 28151);

    let started = Instant::now();
    let response = http
        .get(format!("http://{}:28151/", hostname))
        .send()
        .await
        .expect("public request failed");
    assert_eq!(response.status(), 200);
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), 9000);

    // The origin held the socket open; the idle window must have cut the
    // response loose long before any hard deadline.
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "response took {:?}",
        started.elapsed()
    );

    client.disconnect().await;
    server.shutdown.trigger();
}

#[tokio::test]
async fn unknown_host_and_missing_tunnel_pages() {
    let server = common::TestServer::start("s1", 28161, 28162).await;

    // Host not matching the domain template: 404.
    let http = common::public_client("example.com", 28161);
    let response = http
        .get("http://example.com:28161/")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert!(response.text().await.unwrap().contains("Tunnel Not Found"));

    // Matching host without a connected client: 503.
    let http = common::public_client("ghost.localhost", 28161);
    let response = http
        .get("http://ghost.localhost:28161/")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert!(response.text().await.unwrap().contains("Tunnel Not Active"));

    server.shutdown.trigger();
}
