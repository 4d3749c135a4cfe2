//! Nix binary-cache HTTP surface.
//!
//! `/nix-cache-info` is answered locally so substituters can probe any node.
//! Everything else streams from an upstream chosen per request: the root
//! forwards to the configured internet cache, everyone else forwards to its
//! parent's copy of this same server. Bodies are never buffered whole; NARs
//! can outweigh the node's entire RAM.

use crate::config::Config;
use crate::telemetry::Activity;
use crate::topology::{NodeRole, TopologyState};
use axum::body::Body;
use axum::error_handling::HandleErrorLayer;
use axum::extract::State;
use axum::http::header::{CONNECTION, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::TryStreamExt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::load_shed::error::Overloaded;
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

const NARINFO_CONTENT_TYPE: &str = "text/x-nix-narinfo";
const NAR_CONTENT_TYPE: &str = "application/x-nix-nar";
const CACHE_INFO_CONTENT_TYPE: &str = "text/x-nix-cache-info";

/// NAR downloads are long-lived on a slow mesh; the client timeout is the
/// last resort, not the pacing mechanism.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("not joined to the mesh yet")]
    NotReady,

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream certificate rejected: {0}")]
    BadCert(reqwest::Error),

    #[error("response assembly failed: {0}")]
    Internal(#[from] axum::http::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) | ProxyError::BadCert(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("proxy request failed: {self}");
        (status, format!("{self}\n")).into_response()
    }
}

/// Where a request should be forwarded, resolved from the current topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Use the operator-pinned certificate instead of the platform store.
    pub pinned_cert: bool,
}

/// Pick the upstream for one request. Roles shift as the tree heals, so
/// this runs fresh every time rather than being cached at startup.
pub fn route(topology: &TopologyState, config: &Config) -> Result<UpstreamTarget, ProxyError> {
    if !topology.connected {
        return Err(ProxyError::NotReady);
    }
    if topology.role == NodeRole::Root {
        let use_tls = config.cache.use_https;
        let port = config
            .cache
            .upstream_port
            .unwrap_or(if use_tls { 443 } else { 80 });
        return Ok(UpstreamTarget {
            host: config.cache.upstream.clone(),
            port,
            use_tls,
            pinned_cert: use_tls && config.cache.cert.is_some(),
        });
    }
    let gateway: Ipv4Addr = topology.parent_gateway.ok_or(ProxyError::NotReady)?;
    Ok(UpstreamTarget {
        host: gateway.to_string(),
        port: config.http_port,
        use_tls: false,
        pinned_cert: false,
    })
}

#[derive(Clone)]
pub struct ProxyState {
    topology: Arc<Mutex<TopologyState>>,
    config: Arc<Config>,
    activity: Activity,
    client: reqwest::Client,
}

impl ProxyState {
    pub fn new(
        topology: Arc<Mutex<TopologyState>>,
        config: Arc<Config>,
        activity: Activity,
    ) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(UPSTREAM_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ProxyError::Upstream)?;
        Ok(ProxyState {
            topology,
            config,
            activity,
            client,
        })
    }

    fn topology(&self) -> TopologyState {
        self.topology.lock().expect("topology mutex poisoned").clone()
    }

    /// Pinned-cert targets get a one-off client so a bad PEM poisons only
    /// the request that needed it.
    fn client_for(&self, target: &UpstreamTarget) -> Result<reqwest::Client, ProxyError> {
        if !target.pinned_cert {
            return Ok(self.client.clone());
        }
        let pem = self.config.cache.cert.as_deref().unwrap_or_default();
        let cert = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(ProxyError::BadCert)?;
        reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(cert)
            .timeout(UPSTREAM_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ProxyError::BadCert)
    }
}

pub fn router(state: ProxyState) -> Router {
    let limit = state.config.max_inflight_requests;
    Router::new()
        .route("/nix-cache-info", get(cache_info))
        .route("/node-status", get(node_status))
        .route("/nar/{*nar_path}", get(fetch_nar))
        // Narinfo paths look like /{hash}.narinfo, which axum's router
        // cannot pattern-match, so they land in the fallback.
        .fallback(fetch_narinfo)
        // Requests past the in-flight cap are refused, not queued; a mesh
        // hop that buffers load only starves its own children.
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(shed_response))
                .load_shed()
                .concurrency_limit(limit),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shed_response(err: BoxError) -> Response {
    if err.is::<Overloaded>() {
        warn!("request refused, in-flight cap reached");
        (StatusCode::SERVICE_UNAVAILABLE, "too many in-flight requests\n").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{err}\n")).into_response()
    }
}

/// GET /node-status, a JSON health view for operators poking at a badge.
async fn node_status(State(state): State<ProxyState>) -> impl IntoResponse {
    axum::Json(state.activity.snapshot())
}

/// GET /nix-cache-info, answered locally on every node.
async fn cache_info(State(state): State<ProxyState>) -> impl IntoResponse {
    let body = format!(
        "StoreDir: {}\nWantMassQuery: 1\nPriority: {}\n",
        state.config.cache.store, state.config.cache.priority
    );
    (
        StatusCode::OK,
        [(CONTENT_TYPE, CACHE_INFO_CONTENT_TYPE)],
        body,
    )
}

async fn fetch_nar(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Result<Response, ProxyError> {
    forward(&state, req, NAR_CONTENT_TYPE).await
}

async fn fetch_narinfo(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Result<Response, ProxyError> {
    if req.method() != Method::GET {
        return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response());
    }
    forward(&state, req, NARINFO_CONTENT_TYPE).await
}

/// Stream one request from the resolved upstream, relaying its headers and
/// stamping the Nix content type the substituter expects.
async fn forward(
    state: &ProxyState,
    req: Request<Body>,
    content_type: &'static str,
) -> Result<Response, ProxyError> {
    let target = route(&state.topology(), &state.config)?;
    let scheme = if target.use_tls { "https" } else { "http" };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{scheme}://{}:{}{path_and_query}", target.host, target.port);
    debug!(%url, "forwarding cache request");

    let upstream = state.client_for(&target)?.get(&url).send().await?;

    let mut response = Response::builder().status(upstream.status());
    if let Some(headers) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            // Hop-by-hop headers describe the upstream leg, not ours.
            if name == TRANSFER_ENCODING || name == CONNECTION {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }

    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    Ok(response.body(Body::from_stream(stream))?)
}
