//! End-to-end tests of the server lifecycle over a real TCP socket.

use axum::Router;
use axum::routing::get;
use podgate_api::listener;
use podgate_api::{ApiServer, AppState, ServerConfig, create_router};
use podgate_core::MemoryEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

fn config(idle_timeout: Duration) -> ServerConfig {
    ServerConfig {
        idle_timeout,
        header_read_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(10),
    }
}

async fn start(router: Router, config: ServerConfig) -> (String, podgate_api::ServerHandle, JoinHandle<podgate_api::Result<()>>) {
    let listener = listener::bind("tcp:127.0.0.1:0").await.unwrap();
    let server = ApiServer::new(listener, router, config).with_signal_handling(false);
    let addr = server
        .local_addr()
        .strip_prefix("tcp:")
        .unwrap()
        .to_string();
    let handle = server.handle();
    (addr, handle, tokio::spawn(server.serve()))
}

fn api_router() -> Router {
    create_router(AppState::new(Arc::new(MemoryEngine::with_demo_registry())))
}

/// Sends a bodyless request and returns the raw response.
async fn request(addr: &str, path: &str, headers: &[(&str, &str)]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut head = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or_default()
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response
        .lines()
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
}

async fn explode() -> &'static str {
    panic!("handler bug")
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_millis(500)).await;
    "done"
}

#[tokio::test]
async fn test_serves_ping_with_reference_id() {
    let (addr, handle, server) = start(api_router(), config(Duration::ZERO)).await;

    let response = request(&addr, "/_ping", &[]).await;
    assert!(status_line(&response).contains("200"), "{response}");
    assert!(response.ends_with("OK"));
    let generated = header(&response, "x-reference-id").unwrap();
    assert!(!generated.is_empty());

    let response = request(&addr, "/_ping", &[("X-Reference-Id", "trace-42")]).await;
    assert_eq!(header(&response, "x-reference-id"), Some("trace-42"));

    handle.shutdown();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_idle_timeout_stops_server() {
    let (addr, _handle, server) = start(api_router(), config(Duration::from_millis(200))).await;

    let response = request(&addr, "/_ping", &[]).await;
    assert!(status_line(&response).contains("200"));

    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop after idling")
        .unwrap()
        .unwrap();
    assert!(TcpStream::connect(&addr).await.is_err());
}

#[tokio::test]
async fn test_requests_keep_server_alive() {
    let (addr, handle, server) = start(api_router(), config(Duration::from_millis(300))).await;

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let response = request(&addr, "/_ping", &[]).await;
        assert!(status_line(&response).contains("200"));
    }
    assert!(!server.is_finished());

    handle.shutdown();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_zero_idle_timeout_serves_until_shutdown() {
    let (addr, handle, server) = start(api_router(), config(Duration::ZERO)).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let response = request(&addr, "/version", &[]).await;
    assert!(status_line(&response).contains("200"));
    assert!(!server.is_finished());
    assert!(!handle.is_shutting_down());

    handle.shutdown();
    assert!(handle.is_shutting_down());
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_in_flight_request_completes_after_idle_expiry() {
    let router = Router::new().route("/slow", get(slow));
    let (addr, _handle, server) = start(router, config(Duration::from_millis(100))).await;

    let response = request(&addr, "/slow", &[]).await;
    assert!(status_line(&response).contains("200"), "{response}");
    assert!(response.ends_with("done"));

    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_close_aborts_without_draining() {
    let router = Router::new().route("/slow", get(slow));
    let (addr, handle, server) = start(router, config(Duration::ZERO)).await;

    let client = tokio::spawn(async move {
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        stream
            .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        response
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.close();
    tokio::time::timeout(Duration::from_millis(400), server)
        .await
        .expect("close waited for the slow request")
        .unwrap()
        .unwrap();
    let response = client.await.unwrap();
    assert!(!String::from_utf8_lossy(&response).contains("done"));
}

#[tokio::test]
async fn test_panic_becomes_500_and_server_keeps_serving() {
    let router = Router::new()
        .route("/boom", get(explode))
        .route("/ok", get(|| async { "fine" }));
    let (addr, handle, server) = start(router, config(Duration::ZERO)).await;

    let response = request(&addr, "/boom", &[]).await;
    assert!(status_line(&response).contains("500"), "{response}");
    assert!(response.contains("\"response\":500"));

    let response = request(&addr, "/ok", &[]).await;
    assert!(status_line(&response).contains("200"));
    assert!(response.ends_with("fine"));

    handle.shutdown();
    server.await.unwrap().unwrap();
}
