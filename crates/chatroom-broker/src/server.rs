//! `Broker`: axum HTTP + WebSocket front end over the message router.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use chatroom_core::ChannelTransport;
use chatroom_discovery::{Announcer, ServiceDirectory, ServiceInfo};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::BrokerConfig;
use crate::connection::{serve_connection, SocketTransport};
use crate::hub::ConnectionHub;
use crate::router::MessageRouter;
use crate::shutdown::ShutdownCoordinator;

/// Errors raised while starting a broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The listening socket could not be opened.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// `GET /health` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `healthy` while the server answers.
    pub status: String,
    /// Open connections.
    pub connections: usize,
    /// Registered paths.
    pub paths: usize,
}

/// Shared state accessible from axum handlers.
#[derive(Clone)]
struct AppState {
    router: Arc<MessageRouter>,
    shutdown: Arc<ShutdownCoordinator>,
}

/// A configured broker that has not started listening yet.
pub struct Broker {
    config: BrokerConfig,
    router: Arc<MessageRouter>,
    shutdown: Arc<ShutdownCoordinator>,
    announcer: Option<Arc<dyn Announcer>>,
}

impl Broker {
    /// Broker with an empty registry and no announcer.
    pub fn new(config: BrokerConfig) -> Self {
        let hub = Arc::new(ConnectionHub::new(config.max_send_queue));
        Self {
            config,
            router: Arc::new(MessageRouter::new(hub)),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            announcer: None,
        }
    }

    /// Announce through `announcer` once listening, withdraw on shutdown.
    pub fn with_announcer(mut self, announcer: Arc<dyn Announcer>) -> Self {
        self.announcer = Some(announcer);
        self
    }

    /// Announce to an in-process `directory`.
    pub fn with_directory(self, directory: ServiceDirectory) -> Self {
        self.with_announcer(Arc::new(directory))
    }

    /// Settings the broker was built with.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Router shared by every connection.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Open a connection that skips the network; see [`BrokerHandle::connect_in_memory`].
    pub fn connect_in_memory(&self) -> ChannelTransport {
        connect_in_memory(&self.router, &self.shutdown)
    }

    /// The axum app: `/ws` and `/health`.
    pub fn app(&self) -> axum::Router {
        build_app(AppState {
            router: Arc::clone(&self.router),
            shutdown: Arc::clone(&self.shutdown),
        })
    }

    /// Bind, serve, and announce.
    pub async fn start(self) -> Result<BrokerHandle, BrokerError> {
        let addr = self.config.bind_addr();
        let bind_err = |source| BrokerError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let app = self.app();
        let token = self.shutdown.token();
        let _ = self.shutdown.spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "broker server failed");
            }
        });

        let announced = self.announcer.as_ref().and_then(|announcer| {
            let host = if local_addr.ip().is_unspecified() {
                "127.0.0.1".to_string()
            } else {
                local_addr.ip().to_string()
            };
            let info = ServiceInfo::new(&self.config.name, host, local_addr.port())
                .with_property("version", env!("CARGO_PKG_VERSION"));
            match announcer.announce(&info) {
                Ok(()) => Some(info),
                Err(e) => {
                    warn!(error = %e, name = %self.config.name, "announcement failed, serving unannounced");
                    None
                }
            }
        });

        info!(addr = %local_addr, name = %self.config.name, "broker listening");

        Ok(BrokerHandle {
            local_addr,
            name: self.config.name,
            router: self.router,
            shutdown: self.shutdown,
            announcer: self.announcer,
            announced,
        })
    }
}

/// A running broker.
pub struct BrokerHandle {
    local_addr: SocketAddr,
    name: String,
    router: Arc<MessageRouter>,
    shutdown: Arc<ShutdownCoordinator>,
    announcer: Option<Arc<dyn Announcer>>,
    announced: Option<ServiceInfo>,
}

impl BrokerHandle {
    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port actually bound, useful after binding port 0.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Router shared by every connection.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// What was published to discovery, if announcing succeeded.
    pub fn announced(&self) -> Option<&ServiceInfo> {
        self.announced.as_ref()
    }

    /// Open a connection that skips the network. The returned transport is the
    /// client end; the broker end runs the same loop as a WebSocket peer.
    pub fn connect_in_memory(&self) -> ChannelTransport {
        connect_in_memory(&self.router, &self.shutdown)
    }

    /// Withdraw the announcement, stop accepting, and wait for connections.
    pub async fn shutdown(self, timeout: Option<Duration>) {
        if self.announced.is_some() {
            if let Some(announcer) = &self.announcer {
                announcer.withdraw(&self.name);
            }
        }
        self.shutdown.graceful_shutdown(timeout).await;
        info!(name = %self.name, "broker stopped");
    }
}

fn connect_in_memory(router: &Arc<MessageRouter>, shutdown: &ShutdownCoordinator) -> ChannelTransport {
    let (client_end, broker_end) = ChannelTransport::pair();
    let _ = shutdown.spawn(serve_connection(
        Arc::new(broker_end),
        Arc::clone(router),
        shutdown.token(),
    ));
    client_end
}

fn build_app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let transport = Arc::new(SocketTransport::new(socket));
        state
            .shutdown
            .track(serve_connection(transport, state.router, state.shutdown.token()))
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        connections: state.router.hub().count(),
        paths: state.router.registry().path_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chatroom_core::{Envelope, EventKind, Frame, Transport};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_counts() {
        let broker = Broker::new(BrokerConfig::default());
        let client = broker.connect_in_memory();
        let frame = Frame::with_body(
            EventKind::Register.as_str(),
            &Envelope::naming("svc.a").with_uid(chatroom_core::CorrelationId::new()),
        )
        .unwrap();
        client.send(frame).await.unwrap();
        let _ack = client.recv().await.unwrap().unwrap();

        let resp = broker
            .app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            health,
            HealthResponse {
                status: "healthy".into(),
                connections: 1,
                paths: 1
            }
        );
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let broker = Broker::new(BrokerConfig::default());
        let resp = broker
            .app()
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_announces_and_shutdown_withdraws() {
        let directory = ServiceDirectory::new();
        let config = BrokerConfig {
            name: "lab".into(),
            port: 0,
            ..BrokerConfig::default()
        };
        let handle = Broker::new(config)
            .with_directory(directory.clone())
            .start()
            .await
            .unwrap();

        let info = directory.get("lab").unwrap();
        assert_eq!(info.port, handle.port());
        assert_eq!(info.version(), Some(env!("CARGO_PKG_VERSION")));
        assert_eq!(handle.announced(), Some(&info));

        handle.shutdown(Some(Duration::from_secs(5))).await;
        assert!(directory.get("lab").is_none());
    }

    struct RefusingAnnouncer;

    impl Announcer for RefusingAnnouncer {
        fn announce(&self, _info: &ServiceInfo) -> Result<(), chatroom_discovery::DiscoveryError> {
            Err(chatroom_discovery::DiscoveryError::Mdns("no multicast route".into()))
        }

        fn withdraw(&self, _name: &str) {
            panic!("nothing was announced");
        }
    }

    #[tokio::test]
    async fn failed_announcement_still_serves() {
        let config = BrokerConfig {
            port: 0,
            ..BrokerConfig::default()
        };
        let handle = Broker::new(config)
            .with_announcer(Arc::new(RefusingAnnouncer))
            .start()
            .await
            .unwrap();
        assert!(handle.announced().is_none());
        let client = handle.connect_in_memory();
        let frame = Frame::with_body(
            EventKind::Register.as_str(),
            &Envelope::naming("svc.a").with_uid(chatroom_core::CorrelationId::new()),
        )
        .unwrap();
        client.send(frame).await.unwrap();
        assert!(client.recv().await.unwrap().is_some());
        handle.shutdown(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn in_memory_connection_is_cleaned_up_on_close() {
        let broker = Broker::new(BrokerConfig::default());
        let client = broker.connect_in_memory();
        let frame = Frame::with_body(
            EventKind::Register.as_str(),
            &Envelope::naming("gone").with_uid(chatroom_core::CorrelationId::new()),
        )
        .unwrap();
        client.send(frame).await.unwrap();
        let _ack = client.recv().await.unwrap().unwrap();
        assert_eq!(broker.router().registry().path_count(), 1);

        client.close().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.router().hub().count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(broker.router().registry().path_count(), 0);
    }
}
