//! RPC surface: routing, framing and handler dispatch over real sockets.

use instrument_server::server::rpc;
use instrument_server::server::ServerContext;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

/// Grab an ephemeral port that is almost certainly still free.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct Server {
    ctx: Arc<ServerContext>,
    port: u16,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Server {
    fn start() -> Self {
        let ctx = ServerContext::new().unwrap();
        let port = free_port();
        let serve_ctx = Arc::clone(&ctx);
        let handle = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime
                .block_on(rpc::serve(serve_ctx, port))
                .unwrap();
        });

        // Wait for the listener to come up.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "server never bound");
            std::thread::sleep(Duration::from_millis(10));
        }

        Self {
            ctx,
            port,
            handle: Some(handle),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.ctx.shutdown.notify_waiters();
        self.ctx.jobs.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn raw_request(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn list_round_trips_through_the_client() {
    let server = Server::start();
    let (status, body) =
        rpc::rpc_request(server.port, "list", &serde_json::json!({})).unwrap();
    assert_eq!(status, 200);
    assert_eq!(body["ok"], true);
    assert!(body["instruments"].as_array().unwrap().is_empty());
}

#[test]
fn unknown_command_maps_to_500() {
    let server = Server::start();
    let (status, body) =
        rpc::rpc_request(server.port, "frobnicate", &serde_json::json!({})).unwrap();
    assert_eq!(status, 500);
    assert_eq!(body["ok"], false);
}

#[test]
fn only_post_rpc_is_routed() {
    let server = Server::start();
    let response = raw_request(
        server.port,
        "GET /metrics HTTP/1.0\r\nConnection: close\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.0 404"));
    assert!(response.contains(r#""ok":false"#));
}

#[test]
fn malformed_json_body_maps_to_500() {
    let server = Server::start();
    let body = "{not json";
    let request = format!(
        "POST /rpc HTTP/1.0\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let response = raw_request(server.port, &request);
    assert!(response.starts_with("HTTP/1.0 500"));
    assert!(response.contains("malformed JSON"));
}

#[test]
fn jobs_are_reachable_over_rpc() {
    let server = Server::start();
    let (status, body) = rpc::rpc_request(
        server.port,
        "submit_job",
        &serde_json::json!({ "job_type": "sleep", "params": { "duration_ms": 10 } }),
    )
    .unwrap();
    assert_eq!(status, 200);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (_, status_body) = rpc::rpc_request(
            server.port,
            "job_status",
            &serde_json::json!({ "job_id": job_id }),
        )
        .unwrap();
        if status_body["status"] == "completed" {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "job never completed");
        std::thread::sleep(Duration::from_millis(10));
    }
}
