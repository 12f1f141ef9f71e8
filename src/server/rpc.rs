//! Loopback HTTP/1.0 RPC surface.
//!
//! One route: `POST /rpc` with a JSON body `{"command": …, "params": {…}}`.
//! The response body is the handler's JSON (`{"ok": bool, …}`); the HTTP
//! status is 200 when the handler reports success and 500 otherwise.
//! Everything that is not `POST /rpc` gets a 404 JSON body. Transport is
//! plain HTTP/1.0 with `Content-Length` and `Connection: close`.
//!
//! The accept loop is async; handlers are synchronous and run in
//! `spawn_blocking` so a slow instrument command never stalls the listener.

use crate::error::{ServerError, ServerResult};
use crate::server::handlers;
use crate::server::ServerContext;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Upper bound on request head + body we are willing to buffer.
const MAX_REQUEST_BYTES: usize = 1024 * 1024;
/// Client-side I/O timeout.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve `POST /rpc` on the loopback interface until shutdown is notified.
pub async fn serve(ctx: Arc<ServerContext>, port: u16) -> ServerResult<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Daemon(format!("bind {addr}: {e}")))?;
    info!(%addr, "RPC server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "RPC connection");
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, ctx).await {
                                warn!(error = %e, "RPC connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
            _ = ctx.shutdown.notified() => {
                info!("RPC server shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, ctx: Arc<ServerContext>) -> ServerResult<()> {
    let (head, mut body) = read_head(&mut stream).await?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    let content_length = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .next()
        .unwrap_or(0);

    if method != "POST" || path != "/rpc" {
        let body = serde_json::json!({ "ok": false, "error": "not found" });
        write_response(&mut stream, 404, &body).await?;
        return Ok(());
    }

    if content_length > MAX_REQUEST_BYTES {
        let body = serde_json::json!({ "ok": false, "error": "request too large" });
        write_response(&mut stream, 500, &body).await?;
        return Ok(());
    }
    while body.len() < content_length {
        let mut chunk = vec![0u8; content_length - body.len()];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ServerError::Daemon(format!("read body: {e}")))?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let request: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let body = serde_json::json!({ "ok": false, "error": format!("malformed JSON: {e}") });
            write_response(&mut stream, 500, &body).await?;
            return Ok(());
        }
    };
    let command = request
        .get("command")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();
    let params = request
        .get("params")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    debug!(command = %command, "RPC dispatch");
    let dispatch_ctx = Arc::clone(&ctx);
    let (rc, out) =
        tokio::task::spawn_blocking(move || handlers::dispatch(&dispatch_ctx, &command, &params))
            .await
            .unwrap_or_else(|e| {
                (
                    1,
                    serde_json::json!({ "ok": false, "error": format!("handler panicked: {e}") }),
                )
            });

    let status = if rc == 0 { 200 } else { 500 };
    write_response(&mut stream, status, &out).await
}

/// Read until the blank line; returns (head, any body bytes already read).
async fn read_head(stream: &mut TcpStream) -> ServerResult<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ServerError::Daemon(format!("read head: {e}")))?;
        if n == 0 {
            return Err(ServerError::Daemon("connection closed mid-request".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_blank_line(&buf) {
            let head = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let body = buf[pos + 4..].to_vec();
            return Ok((head, body));
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(ServerError::Daemon("request head too large".into()));
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    body: &serde_json::Value,
) -> ServerResult<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let body = body.to_string();
    let response = format!(
        "HTTP/1.0 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| ServerError::Daemon(format!("write response: {e}")))?;
    let _ = stream.shutdown().await;
    Ok(())
}

// =============================================================================
// Blocking client (used by the CLI)
// =============================================================================

/// Issue one RPC call against a daemon on the loopback interface.
///
/// Returns the HTTP status and the parsed JSON body.
pub fn rpc_request(
    port: u16,
    command: &str,
    params: &serde_json::Value,
) -> ServerResult<(u16, serde_json::Value)> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mut stream = std::net::TcpStream::connect_timeout(&addr, Duration::from_secs(3))
        .map_err(|e| {
            ServerError::Daemon(format!("cannot reach daemon on port {port}: {e} (is it running?)"))
        })?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;

    let body = serde_json::json!({ "command": command, "params": params }).to_string();
    let request = format!(
        "POST /rpc HTTP/1.0\r\nHost: 127.0.0.1:{port}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes())?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;

    let pos = find_blank_line(&response)
        .ok_or_else(|| ServerError::Daemon("malformed RPC response".into()))?;
    let head = String::from_utf8_lossy(&response[..pos]);
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ServerError::Daemon("malformed RPC status line".into()))?;
    let body: serde_json::Value = serde_json::from_slice(&response[pos + 4..])
        .map_err(|e| ServerError::Daemon(format!("malformed RPC body: {e}")))?;
    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_line_detection() {
        assert_eq!(find_blank_line(b"POST /rpc HTTP/1.0\r\n\r\n{}"), Some(20));
        assert_eq!(find_blank_line(b"partial head\r\n"), None);
    }
}
