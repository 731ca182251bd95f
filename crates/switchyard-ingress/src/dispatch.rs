//! HTTP request dispatcher
//!
//! For every request the dispatcher loads the active table once, looks up the
//! route for the request's host and path, picks a target and either answers
//! with a redirect, hands the connection to the WebSocket relay, or forwards
//! the request through the pooled upstream clients.
//!
//! Every forwarded request records its latency into the target's timer and
//! reports its outcome to the circuit breaker.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::header::{self, HeaderMap, HeaderValue};
use http::{Request, StatusCode, Uri};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body as HttpBody;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_core::Scheme;
use switchyard_egress::{EgressError, UpstreamClients};
use switchyard_observability::{Metrics, TimerRegistry};
use switchyard_routing::{BreakerHandle, Selector, SharedPublisher, Target, normalize_host};
use tracing::{debug, warn};

use crate::forward::{self, ForwardConfig};
use crate::shutdown::{ConnectionGuard, Drain};
use crate::websocket;

/// Request dispatch error
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No route for {host}{path}")]
    NoRoute { host: String, path: String },

    #[error("Failed to connect to upstream {dst}: {message}")]
    UpstreamDial { dst: String, message: String },

    #[error("Upstream {dst} failed: {message}")]
    UpstreamResponse { dst: String, message: String },

    #[error("Upstream {dst} timed out")]
    UpstreamTimeout { dst: String },

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::NoRoute { .. } => StatusCode::NOT_FOUND,
            DispatchError::UpstreamDial { .. } | DispatchError::UpstreamResponse { .. } => {
                StatusCode::BAD_GATEWAY
            }
            DispatchError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Label used for the upstream error metric
    fn kind(&self) -> &'static str {
        match self {
            DispatchError::UpstreamDial { .. } => "dial",
            DispatchError::UpstreamTimeout { .. } => "timeout",
            DispatchError::UpstreamResponse { .. } => "response",
            _ => "other",
        }
    }

    /// Whether the failure counts against the target's breaker
    fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            DispatchError::UpstreamDial { .. }
                | DispatchError::UpstreamResponse { .. }
                | DispatchError::UpstreamTimeout { .. }
        )
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, status.canonical_reason().unwrap_or_default()).into_response();
        if matches!(self, DispatchError::ShuttingDown) {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Status for requests without a route
    pub noroute_status: StatusCode,
    /// HTML body for requests without a route
    pub noroute_html: Option<String>,
    /// Largest accepted request body; `None` is unlimited
    pub max_body_bytes: Option<usize>,
    /// Count upstream 5xx responses as breaker failures
    pub breaker_on_5xx: bool,
    /// Connect deadline for WebSocket upstreams
    pub dial_timeout: Duration,
    pub forward: ForwardConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            noroute_status: StatusCode::NOT_FOUND,
            noroute_html: None,
            max_body_bytes: None,
            breaker_on_5xx: false,
            dial_timeout: Duration::from_secs(30),
            forward: ForwardConfig::default(),
        }
    }
}

/// Routes and forwards HTTP requests
#[derive(Clone)]
pub struct Dispatcher {
    publisher: SharedPublisher,
    selector: Arc<Selector>,
    clients: UpstreamClients,
    breaker: Option<BreakerHandle>,
    timers: Arc<TimerRegistry>,
    metrics: Option<Arc<Metrics>>,
    drain: Drain,
    config: Arc<DispatcherConfig>,
}

impl Dispatcher {
    pub fn new(
        publisher: SharedPublisher,
        selector: Arc<Selector>,
        clients: UpstreamClients,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            publisher,
            selector,
            clients,
            breaker: None,
            timers: Arc::new(TimerRegistry::new()),
            metrics: None,
            drain: Drain::new(),
            config: Arc::new(config),
        }
    }

    pub fn with_breaker(mut self, breaker: BreakerHandle) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_timers(mut self, timers: Arc<TimerRegistry>) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_drain(mut self, drain: Drain) -> Self {
        self.drain = drain;
        self
    }

    pub fn drain(&self) -> &Drain {
        &self.drain
    }

    pub fn timers(&self) -> &Arc<TimerRegistry> {
        &self.timers
    }

    pub fn breaker(&self) -> Option<&BreakerHandle> {
        self.breaker.as_ref()
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    /// Look up the route for `host` and `path` and pick a target
    ///
    /// Targets whose breaker is open are skipped.
    pub fn select_target(&self, host: &str, path: &str) -> Option<Target> {
        let table = self.publisher.load();
        let route = table.lookup(host, path)?;
        let breaker = self.breaker.as_ref();
        self.selector
            .select(route, |t| breaker.is_some_and(|b| b.is_tripped(t.dst())))
            .cloned()
    }

    /// Serve one request; never fails
    pub async fn handle(&self, req: Request<Body>, client_addr: SocketAddr) -> Response {
        let method = req.method().clone();
        let uri = req.uri().clone();
        match self.dispatch(req, client_addr).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    DispatchError::NoRoute { .. } => {
                        debug!(method = %method, uri = %uri, "no route");
                        if let Some(metrics) = &self.metrics {
                            metrics.record_no_route();
                        }
                        return self.noroute_response();
                    }
                    DispatchError::ShuttingDown | DispatchError::BadRequest(_) => {
                        debug!(method = %method, uri = %uri, error = %err, "request rejected");
                    }
                    _ => warn!(method = %method, uri = %uri, error = %err, "request failed"),
                }
                err.into_response()
            }
        }
    }

    fn noroute_response(&self) -> Response {
        let status = self.config.noroute_status;
        match &self.config.noroute_html {
            Some(html) => (
                status,
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                html.clone(),
            )
                .into_response(),
            None => status.into_response(),
        }
    }

    async fn dispatch(
        &self,
        mut req: Request<Body>,
        client_addr: SocketAddr,
    ) -> Result<Response, DispatchError> {
        if self.drain.is_draining() {
            return Err(DispatchError::ShuttingDown);
        }

        let host = request_host(&req).map(normalize_host).unwrap_or_default();
        let path = req.uri().path().to_string();
        let target = self
            .select_target(&host, &path)
            .ok_or_else(|| DispatchError::NoRoute {
                host: host.clone(),
                path: path.clone(),
            })?;

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        if let Some((code, location)) = target.redirect(&path_and_query) {
            debug!(host = %host, path = %path, location = %location, status = code, "redirect");
            return redirect_response(code, &location);
        }

        let scheme = target.upstream_scheme();
        if scheme == Scheme::Tcp {
            return Err(DispatchError::UpstreamResponse {
                dst: target.dst().to_string(),
                message: "tcp targets are served by tcp+sni listeners only".to_string(),
            });
        }

        if let Some(limit) = self.config.max_body_bytes
            && content_length(req.headers()).is_some_and(|len| len > limit)
        {
            return Err(DispatchError::PayloadTooLarge { limit });
        }

        let upstream_path = upstream_path(&target, req.uri());
        let upstream_host = upstream_host_header(&target, &req);
        debug!(
            service = %target.service,
            host = %host,
            path = %path,
            dst = %target.dst(),
            "route selected"
        );

        let started = Instant::now();
        let result = if websocket::is_upgrade_request(req.headers()) {
            let mut headers = req.headers().clone();
            forward::apply_forwarding_headers(&mut headers, client_addr.ip(), &self.config.forward);
            forward::apply_header_rules(&mut headers, &self.config.forward.header_rules);
            set_host(&mut headers, upstream_host.as_deref());
            let on_upgrade = hyper::upgrade::on(&mut req);
            let guard = req.extensions_mut().remove::<ConnectionGuard>();
            websocket::relay(
                req.method(),
                &upstream_path,
                &headers,
                &target,
                self.config.dial_timeout,
                on_upgrade,
                guard,
            )
            .await
        } else {
            self.forward(req, &target, &upstream_path, upstream_host, client_addr)
                .await
        };

        self.record(&target, started.elapsed(), &result);
        result
    }

    async fn forward(
        &self,
        req: Request<Body>,
        target: &Target,
        upstream_path: &str,
        upstream_host: Option<String>,
        client_addr: SocketAddr,
    ) -> Result<Response, DispatchError> {
        let scheme = target.upstream_scheme();
        let http_scheme = if scheme.is_tls() { "https" } else { "http" };
        let url = format!("{}://{}{}", http_scheme, target.authority(), upstream_path);
        let url = reqwest::Url::parse(&url).map_err(|e| DispatchError::BadRequest(e.to_string()))?;

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        // h2 and gRPC requests carry bodies without length or encoding headers
        let has_body = !HttpBody::is_end_stream(&body);

        forward::strip_hop_by_hop(&mut headers);
        forward::apply_forwarding_headers(&mut headers, client_addr.ip(), &self.config.forward);
        forward::apply_header_rules(&mut headers, &self.config.forward.header_rules);
        set_host(&mut headers, upstream_host.as_deref());

        let flavor = UpstreamClients::flavor(scheme, target.opts.tls_skip_verify);
        let mut builder = self
            .clients
            .client(flavor)
            .request(parts.method, url)
            .headers(headers);
        if has_body {
            builder = builder.body(match self.config.max_body_bytes {
                Some(limit) => reqwest::Body::wrap_stream(Limited::new(body, limit).into_data_stream()),
                None => reqwest::Body::wrap_stream(body.into_data_stream()),
            });
        }
        let request = builder.build().map_err(|e| DispatchError::BadRequest(e.to_string()))?;

        let upstream = self
            .clients
            .send(flavor, request)
            .await
            .map_err(|e| self.upstream_error(target, e))?;

        let response: http::Response<reqwest::Body> = upstream.into();
        let (mut parts, body) = response.into_parts();
        forward::strip_hop_by_hop(&mut parts.headers);
        parts.version = http::Version::default();
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    fn upstream_error(&self, target: &Target, err: EgressError) -> DispatchError {
        let dst = target.dst().to_string();
        if let Some(limit) = self.config.max_body_bytes
            && is_length_limit(&err)
        {
            return DispatchError::PayloadTooLarge { limit };
        }
        if err.is_timeout() {
            DispatchError::UpstreamTimeout { dst }
        } else if err.is_connect() {
            DispatchError::UpstreamDial {
                dst,
                message: err.to_string(),
            }
        } else {
            DispatchError::UpstreamResponse {
                dst,
                message: err.to_string(),
            }
        }
    }

    /// Feed the timer, metrics and breaker with a request outcome
    fn record(&self, target: &Target, elapsed: Duration, result: &Result<Response, DispatchError>) {
        self.timers.timer(target.key()).update(elapsed);

        let (status, failed) = match result {
            Ok(response) => {
                let status = response.status();
                (status, self.config.breaker_on_5xx && status.is_server_error())
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics
                    && err.is_upstream_failure()
                {
                    metrics.record_upstream_error(&target.service, err.kind());
                }
                (err.status(), err.is_upstream_failure())
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_request(&target.service, status.as_u16(), elapsed.as_secs_f64());
        }

        if let Some(breaker) = &self.breaker {
            if failed {
                breaker.fail(target.dst());
            } else {
                breaker.success(target.dst());
            }
        }

        debug!(
            service = %target.service,
            dst = %target.dst(),
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "request completed"
        );
    }
}

/// Host from the `Host` header, or the URI authority for HTTP/2
fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn is_length_limit(err: &EgressError) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Path and query sent upstream: the `strip` prefix removed, the target's
/// base path prepended
pub fn upstream_path(target: &Target, uri: &Uri) -> String {
    let mut path = uri.path();
    if let Some(strip) = &target.opts.strip
        && let Some(rest) = path.strip_prefix(strip.as_str())
    {
        path = rest;
    }

    let base = target.dst.path().trim_end_matches('/');
    let mut out = String::with_capacity(base.len() + path.len() + 1);
    out.push_str(base);
    if !path.starts_with('/') {
        out.push('/');
    }
    out.push_str(path);

    if let Some(query) = uri.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// `Host` to send upstream; `None` keeps the client's
fn upstream_host_header<B>(target: &Target, req: &Request<B>) -> Option<String> {
    match target.opts.host.as_deref() {
        Some("dst") => {
            let host = target.dst.host_str().unwrap_or_default();
            Some(match target.dst.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            })
        }
        Some(literal) => Some(literal.to_string()),
        None => request_host(req).map(str::to_string),
    }
}

fn set_host(headers: &mut HeaderMap, host: Option<&str>) {
    if let Some(host) = host
        && let Ok(value) = HeaderValue::from_str(host)
    {
        headers.insert(header::HOST, value);
    }
}

fn redirect_response(code: u16, location: &str) -> Result<Response, DispatchError> {
    let status = StatusCode::from_u16(code)
        .map_err(|_| DispatchError::BadRequest(format!("invalid redirect status {}", code)))?;
    let location = HeaderValue::from_str(location)
        .map_err(|_| DispatchError::BadRequest(format!("invalid redirect location {}", location)))?;
    let mut response = status.into_response();
    response.headers_mut().insert(header::LOCATION, location);
    Ok(response)
}
