//! Minimal worker for trying herd by hand.
//!
//! Serves a one-line HTTP response on `HERD_DEMO_ADDR` (default
//! `127.0.0.1:8080`). Every worker binds the same port with `SO_REUSEPORT`.
//! Prints `READY` once listening; on SIGTERM stops accepting, finishes open
//! connections and exits.
//!
//! ```text
//! cargo build --example demo_worker
//! herd --workers 3 -- target/debug/examples/demo_worker
//! kill -HUP <herd pid>   # rolling restart
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let addr: SocketAddr = std::env::var("HERD_DEMO_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;
    let worker_id = std::env::var("HERD_WORKER_ID").unwrap_or_else(|_| "?".to_string());
    let delay_ms: u64 = std::env::var("HERD_DEMO_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;

    let mut term = signal(SignalKind::terminate())?;
    println!("READY");
    eprintln!("worker {worker_id} listening on {addr}");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = term.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let worker_id = worker_id.clone();
                connections.spawn(serve(stream, worker_id, Duration::from_millis(delay_ms)));
            }
        }
    }

    drop(listener);
    eprintln!("worker {worker_id} draining {} connections", connections.len());
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn serve(mut stream: TcpStream, worker_id: String, delay: Duration) {
    let mut buf = [0u8; 1024];
    if stream.read(&mut buf).await.is_err() {
        return;
    }
    tokio::time::sleep(delay).await;

    let body = format!("hello from worker {worker_id} (pid {})\n", std::process::id());
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
}
