//! HTTP + WebSocket front ends: the monitoring dashboard and the GUI launcher.
//!
//! Both push `{event, data}` JSON envelopes to every connected socket from a
//! broadcast channel; REST endpoints are described with poem-openapi.

pub mod dashboard;
pub mod launcher;
pub mod models;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use poem::http::Method;
use poem::listener::{Acceptor, Listener, TcpAcceptor, TcpListener};
use poem::middleware::Cors;
use poem::web::websocket::{Message, WebSocketStream};
use poem::{Endpoint, EndpointExt, Server};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// A listener that is already bound, so callers know the real address
/// before serving.
pub struct BoundServer {
    acceptor: TcpAcceptor,
    pub addr: SocketAddr,
}

pub async fn bind(host: &str, port: u16) -> Result<BoundServer> {
    let acceptor = TcpListener::bind(format!("{}:{}", host, port))
        .into_acceptor()
        .await
        .with_context(|| format!("api: failed to bind {}:{}", host, port))?;
    let addr = acceptor
        .local_addr()
        .first()
        .and_then(|a| a.as_socket_addr().cloned())
        .with_context(|| format!("api: no socket address for {}:{}", host, port))?;
    Ok(BoundServer { acceptor, addr })
}

impl BoundServer {
    pub async fn run<E, F>(self, app: E, shutdown: F) -> Result<()>
    where
        E: Endpoint + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        Server::new_with_acceptor(self.acceptor)
            .run_with_graceful_shutdown(app, shutdown, Some(GRACEFUL_SHUTDOWN))
            .await
            .context("api: server error")
    }
}

pub fn cors() -> Cors {
    Cors::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(["Content-Type", "Authorization"])
        .allow_origin("*")
}

/// Resolves on SIGINT or SIGTERM. Failing to install a handler means the
/// server only stops when the process is killed.
pub async fn shutdown_signal() {
    match crate::startup::wait_for_signal().await {
        Ok(name) => tracing::info!(target: "viralcast::api", signal = name, "Shutting down server"),
        Err(e) => {
            tracing::warn!(target: "viralcast::api", error = %e, "No signal handler; serving until killed");
            std::future::pending::<()>().await
        }
    }
}

/// Streams `initial` and then every broadcast event to the socket as JSON
/// text frames. Incoming text frames go to `on_text`. Returns when either
/// side closes.
pub(crate) async fn pump_socket<E, F>(
    socket: WebSocketStream,
    mut events: broadcast::Receiver<E>,
    initial: Vec<E>,
    mut on_text: F,
) where
    E: Serialize + Clone + Send + 'static,
    F: FnMut(String) + Send,
{
    let (mut sink, mut stream) = socket.split();

    for event in initial {
        if let Ok(text) = serde_json::to_string(&event) {
            if sink.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(_) => continue,
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => on_text(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = sink.close().await;
}
