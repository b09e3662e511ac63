//! Endpoint server for exposing metrics and health checks

use crate::metrics::metrics;
use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

fn response_for(request_line: &str) -> String {
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    match path {
        "/metrics" => match metrics().render() {
            Ok(body) => format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            ),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode metrics");
                "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_string()
            }
        },
        "/health" => "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok"
            .to_string(),
        _ => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string(),
    }
}

/// Serve `/metrics` and `/health` until `shutdown` flips to true
pub async fn endpoint_server(port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Metrics endpoint listening on {}", addr);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("Metrics endpoint stopping");
                    return Ok(());
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((mut socket, _peer)) => {
                    tokio::spawn(async move {
                        let mut buf = [0; 1024];
                        match socket.read(&mut buf).await {
                            Ok(n) => {
                                let request = String::from_utf8_lossy(&buf[..n]);
                                let first_line = request.lines().next().unwrap_or_default();
                                let response = response_for(first_line);
                                let _ = socket.write_all(response.as_bytes()).await;
                            }
                            Err(e) => {
                                tracing::error!("Failed to read from socket: {}", e);
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert!(response_for("GET /health HTTP/1.1").ends_with("ok"));
        assert!(response_for("GET /metrics HTTP/1.1").starts_with("HTTP/1.1 200"));
        assert!(response_for("GET /nope HTTP/1.1").starts_with("HTTP/1.1 404"));
    }
}
