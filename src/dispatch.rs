//! Upgrade dispatch
//!
//! Two cooperating pieces decide what a request becomes. The outer
//! [`UpgradeDispatchLayer`] wraps the whole router: it sniffs the upgrade
//! headers, refuses handshakes once shutdown has begun, and tags eligible
//! requests. The per-route [`DispatchGate`] then picks the mode: tagged
//! requests complete the handshake and hand the socket to the route's
//! [`SocketHandler`], everything else flows into the plain HTTP side.
//!
//! Tagged requests on routes without a socket handler still get a completed
//! handshake followed by an immediate close, so a websocket client pointed at
//! a plain route fails fast instead of hanging on a 200.

use crate::connection::{close_code, Connection};
use crate::errors::{BoxError, HubError, HubResult};
use crate::registry::SocketRegistry;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request};
use axum::http::{header, request::Parts, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use axum::Router;
use async_trait::async_trait;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, error, info};

/// Invoked when a route's socket handler returns an error. The default logs
/// and closes the connection with code 1011.
pub type SocketErrorHandler = Arc<dyn Fn(BoxError, Arc<Connection>) + Send + Sync>;

pub(crate) fn default_error_handler() -> SocketErrorHandler {
    Arc::new(|err, connection| {
        error!(id = %connection.id(), "socket handler failed: {}", err);
        connection.close(Some(close_code::ERROR), Some("handler error".to_string()));
    })
}

/// Immutable snapshot of the request that upgraded into a connection.
#[derive(Debug, Clone)]
pub struct ConnectContext {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
}

impl ConnectContext {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    fn from_parts(parts: &Parts) -> Self {
        Self::new(parts.method.clone(), parts.uri.clone(), parts.headers.clone())
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Route-level websocket handler, given the registered connection once the
/// handshake completes.
#[async_trait]
pub trait SocketHandler: Send + Sync + 'static {
    async fn handle(&self, connection: Arc<Connection>) -> Result<(), BoxError>;
}

/// Adapter turning an async closure into a [`SocketHandler`].
pub struct FnSocketHandler<F>(F);

impl<F> FnSocketHandler<F> {
    pub fn new(handler: F) -> Self {
        Self(handler)
    }
}

#[async_trait]
impl<F, Fut> SocketHandler for FnSocketHandler<F>
where
    F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn handle(&self, connection: Arc<Connection>) -> Result<(), BoxError> {
        (self.0)(connection).await
    }
}

/// State shared by the hub, the dispatch layer, and every route gate.
pub(crate) struct HubShared {
    pub(crate) registry: Arc<SocketRegistry>,
    pub(crate) transport: crate::config::TransportConfig,
    pub(crate) error_handler: SocketErrorHandler,
    pub(crate) closing: Arc<AtomicBool>,
}

impl HubShared {
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Post-handshake path: register the socket, run the route handler, and
    /// route handler faults into the error handler.
    async fn run_socket(
        self: Arc<Self>,
        socket: WebSocket,
        context: Arc<ConnectContext>,
        handler: Arc<dyn SocketHandler>,
    ) {
        let connection = match self.registry.create_connection(socket, context).await {
            Ok(connection) => connection,
            // the registry already closed the socket with "going away"
            Err(err) => {
                debug!("websocket connection refused: {}", err);
                return;
            }
        };
        if let Err(err) = handler.handle(connection.clone()).await {
            (self.error_handler)(err, connection);
        }
    }
}

/// Marker extension set by the dispatch layer on upgrade-eligible requests.
#[derive(Debug, Clone, Copy)]
struct UpgradeTag;

/// `Connection: upgrade` (token list) plus `Upgrade: websocket`, both
/// case-insensitive.
fn is_upgrade_request(req: &Request) -> bool {
    let connection_upgrades = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    let upgrade_is_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_upgrades && upgrade_is_websocket
}

#[derive(Clone)]
pub(crate) struct UpgradeDispatchLayer {
    pub(crate) shared: Arc<HubShared>,
}

impl<S> Layer<S> for UpgradeDispatchLayer {
    type Service = UpgradeDispatch<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UpgradeDispatch {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// Router-wide service tagging upgrade-eligible requests and refusing them
/// once shutdown has begun.
#[derive(Clone)]
pub(crate) struct UpgradeDispatch<S> {
    inner: S,
    shared: Arc<HubShared>,
}

impl<S> Service<Request> for UpgradeDispatch<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = self.shared.clone();
        Box::pin(async move {
            if is_upgrade_request(&req) {
                if shared.is_closing() {
                    return Ok(refuse_upgrade(req).await);
                }
                req.extensions_mut().insert(UpgradeTag);
            }
            inner.call(req).await
        })
    }
}

/// Shutdown-time refusal. When the handshake can still complete, it does, and
/// the socket is closed immediately with "going away"; otherwise a 503 is the
/// best the plain HTTP surface can say.
async fn refuse_upgrade(req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::GOING_AWAY,
                    reason: "server going away".into(),
                })))
                .await;
        }),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response(),
    }
}

/// Per-route service choosing between the socket side and the HTTP side.
#[derive(Clone)]
struct DispatchGate {
    shared: Arc<HubShared>,
    ws_handler: Option<Arc<dyn SocketHandler>>,
    http: MethodRouter,
}

impl Service<Request> for DispatchGate {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let gate = self.clone();
        Box::pin(async move { Ok(gate.dispatch(req).await) })
    }
}

impl DispatchGate {
    async fn dispatch(self, req: Request) -> Response {
        if req.extensions().get::<UpgradeTag>().is_none() {
            return match self.http.oneshot(req).await {
                Ok(response) => response,
                Err(err) => match err {},
            };
        }

        let (mut parts, _body) = req.into_parts();
        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => return rejection.into_response(),
        };
        let upgrade = apply_transport(upgrade, &self.shared.transport);
        let context = Arc::new(ConnectContext::from_parts(&parts));

        match self.ws_handler {
            Some(handler) => {
                let shared = self.shared.clone();
                upgrade.on_upgrade(move |socket| shared.run_socket(socket, context, handler))
            }
            None => upgrade.on_upgrade(move |mut socket| async move {
                info!(path = %context.path(), "closing websocket on route without a socket handler");
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "no websocket handler".into(),
                    })))
                    .await;
            }),
        }
    }
}

fn apply_transport(
    mut upgrade: WebSocketUpgrade,
    transport: &crate::config::TransportConfig,
) -> WebSocketUpgrade {
    if let Some(size) = transport.max_message_size {
        upgrade = upgrade.max_message_size(size);
    }
    if let Some(size) = transport.max_frame_size {
        upgrade = upgrade.max_frame_size(size);
    }
    if let Some(size) = transport.max_write_buffer_size {
        upgrade = upgrade.max_write_buffer_size(size);
    }
    upgrade
}

/// Route table builder. Every route goes through a [`DispatchGate`], so each
/// path declares independently whether it serves sockets, plain HTTP, or
/// both.
pub struct SocketRouter {
    inner: Router,
    shared: Arc<HubShared>,
}

impl SocketRouter {
    pub(crate) fn new(shared: Arc<HubShared>) -> Self {
        Self {
            inner: Router::new(),
            shared,
        }
    }

    /// Register a socket-only route. The handshake is served on GET; a plain
    /// HTTP request to the same path gets a 404.
    pub fn ws<H: SocketHandler>(self, path: &str, handler: H) -> Self {
        let http = get(|| async { StatusCode::NOT_FOUND });
        self.register(path, Some(Arc::new(handler)), http)
    }

    /// Method-checked variant of [`ws`](Self::ws). Handshakes only exist on
    /// GET, so any other method is a configuration error at registration
    /// time, not a silent dead route.
    pub fn ws_on<H: SocketHandler>(
        self,
        method: Method,
        path: &str,
        handler: H,
    ) -> HubResult<Self> {
        if method != Method::GET {
            return Err(HubError::config(format!(
                "websocket routes must use GET, got {}",
                method
            )));
        }
        Ok(self.ws(path, handler))
    }

    /// Register a route serving plain HTTP normally and sockets on upgrade.
    pub fn hybrid<H: SocketHandler>(
        self,
        path: &str,
        http: MethodRouter,
        handler: H,
    ) -> Self {
        self.register(path, Some(Arc::new(handler)), http)
    }

    /// Register a plain HTTP route. Upgrade requests against it still get a
    /// completed-then-closed handshake rather than a hung client.
    pub fn route(self, path: &str, http: MethodRouter) -> Self {
        self.register(path, None, http)
    }

    fn register(
        mut self,
        path: &str,
        ws_handler: Option<Arc<dyn SocketHandler>>,
        http: MethodRouter,
    ) -> Self {
        let gate = DispatchGate {
            shared: self.shared.clone(),
            ws_handler,
            http,
        };
        self.inner = self.inner.route_service(path, gate);
        self
    }

    pub(crate) fn into_axum(self) -> Router {
        let layer = UpgradeDispatchLayer {
            shared: self.shared.clone(),
        };
        self.inner.layer(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use axum::body::Body;

    fn test_shared() -> Arc<HubShared> {
        let config = HubConfig::default();
        Arc::new(HubShared {
            registry: SocketRegistry::new(&config),
            transport: config.transport,
            error_handler: default_error_handler(),
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    fn noop_handler() -> impl SocketHandler {
        FnSocketHandler::new(|_connection| std::future::ready(Ok::<(), BoxError>(())))
    }

    fn upgrade_request(uri: &str) -> Request {
        Request::builder()
            .uri(uri)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn upgrade_detection_requires_both_headers() {
        assert!(is_upgrade_request(&upgrade_request("/chat")));

        let missing_upgrade = Request::builder()
            .uri("/chat")
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .body(Body::empty())
            .unwrap();
        assert!(!is_upgrade_request(&missing_upgrade));

        let wrong_protocol = Request::builder()
            .uri("/chat")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "h2c")
            .body(Body::empty())
            .unwrap();
        assert!(!is_upgrade_request(&wrong_protocol));

        let plain = Request::builder().uri("/chat").body(Body::empty()).unwrap();
        assert!(!is_upgrade_request(&plain));
    }

    #[test]
    fn ws_routes_reject_non_get_methods() {
        let router = SocketRouter::new(test_shared());
        let result = router.ws_on(Method::POST, "/chat", noop_handler());
        assert!(matches!(result, Err(HubError::Config { .. })));

        let router = SocketRouter::new(test_shared());
        assert!(router.ws_on(Method::GET, "/chat", noop_handler()).is_ok());
    }

    #[tokio::test]
    async fn plain_http_on_a_socket_only_route_is_not_found() {
        let app = SocketRouter::new(test_shared())
            .ws("/chat", noop_handler())
            .into_axum();

        let response = app
            .oneshot(Request::builder().uri("/chat").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hybrid_route_serves_plain_http() {
        let app = SocketRouter::new(test_shared())
            .hybrid("/both", get(|| async { "http mode" }), noop_handler())
            .into_axum();

        let response = app
            .oneshot(Request::builder().uri("/both").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"http mode");
    }

    #[tokio::test]
    async fn plain_routes_pass_through_the_gate() {
        let app = SocketRouter::new(test_shared())
            .route("/health", get(|| async { "ok" }))
            .into_axum();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn upgrades_are_refused_once_shutdown_begins() {
        let shared = test_shared();
        shared.closing.store(true, Ordering::SeqCst);
        let app = SocketRouter::new(shared)
            .ws("/chat", noop_handler())
            .into_axum();

        // no hyper upgrade extension here, so the refusal falls back to 503
        let response = app.oneshot(upgrade_request("/chat")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn plain_requests_still_flow_during_shutdown() {
        let shared = test_shared();
        shared.closing.store(true, Ordering::SeqCst);
        let app = SocketRouter::new(shared)
            .route("/health", get(|| async { "ok" }))
            .into_axum();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
