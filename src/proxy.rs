//! Proxy engine implementation
//! One listener per mapping, forwarding to the mapped remote with host rewriting

use crate::body::{rewrite_encoded, BodyOutcome, BodyRewriter, LiteralBodyRewriter};
use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{ReproError, Result};
use crate::headers::{GenericHeaderRewriter, HeaderRewriter, INBOUND_HEADERS, OUTBOUND_HEADERS};
use crate::mapping::{Mapping, Scheme};
use crate::upstream::UpstreamConnector;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{self, HeaderName, HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Reserved prefix of diagnostic headers
pub const DIAGNOSTIC_PREFIX: &str = "x-repro-";
pub const TRACE_ID_HEADER: &str = "x-repro-trace-id";
pub const LOG_HEADERS_HEADER: &str = "x-repro-log-headers";
pub const LOG_BODY_HEADER: &str = "x-repro-log-body";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Content codings the body rewriter can decode and re-encode
const REWRITABLE_ENCODINGS: &[&str] = &["gzip", "deflate"];

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Aborts the upstream connection driver when dropped
struct ConnectionGuard(AbortHandle);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pin_project! {
    /// Upstream response body that tears the upstream connection down with it
    struct GuardedBody<B> {
        #[pin]
        inner: B,
        guard: ConnectionGuard,
    }
}

impl<B: Body> Body for GuardedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Proxy listener for one mapping
#[derive(Clone)]
pub struct ProxyEngine {
    config: Arc<Config>,
    mapping: Mapping,
    upstream: UpstreamConnector,
    header_rewriter: Arc<dyn HeaderRewriter>,
    body_rewriter: Arc<dyn BodyRewriter>,
}

impl ProxyEngine {
    /// Create an engine serving `mapping`, with the literal rewriters
    pub fn new(config: Arc<Config>, mapping: Mapping, upstream: UpstreamConnector) -> Self {
        Self {
            config,
            mapping,
            upstream,
            header_rewriter: Arc::new(GenericHeaderRewriter),
            body_rewriter: Arc::new(LiteralBodyRewriter),
        }
    }

    /// Replace the header rewrite strategy
    pub fn with_header_rewriter(mut self, rewriter: Arc<dyn HeaderRewriter>) -> Self {
        self.header_rewriter = rewriter;
        self
    }

    /// Replace the body rewrite strategy
    pub fn with_body_rewriter(mut self, rewriter: Arc<dyn BodyRewriter>) -> Self {
        self.body_rewriter = rewriter;
        self
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    /// Bind the local listener for this engine's mapping
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.mapping.bind_addr())
            .await
            .map_err(|source| ReproError::ListenerBindFailure {
                local: self.mapping.local().to_string(),
                source,
            })
    }

    /// Bind and serve until a fatal error
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let engine = Arc::new(self);

        match listener.local_addr() {
            Ok(addr) => info!(
                local = %engine.mapping.local(),
                remote = %format!("{}://{}", engine.mapping.scheme(), engine.mapping.remote()),
                "Listening on {}", addr
            ),
            Err(e) => warn!("Listener address unavailable: {}", e),
        }

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(local = %engine.mapping.local(), "Accept failed: {}", e);
                    continue;
                }
            };

            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.handle_connection(stream, remote_addr).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> std::result::Result<(), hyper::Error> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let engine = self.clone();
                    async move { engine.handle_request(req, remote_addr).await }
                }),
            )
            .await
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.process_request(req, remote_addr).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.status_code() == StatusCode::BAD_GATEWAY {
                    error!("{} {} from {}: {}", method, uri, remote_addr, e);
                } else {
                    warn!("{} {} from {}: {}", method, uri, remote_addr, e);
                }
                Ok(Self::error_response(e.status_code(), &e.to_string()))
            }
        }
    }

    /// Process request
    async fn process_request(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Result<Response<ProxyBody>> {
        let ctx = RequestContext::resolve(self.config.mappings(), req.headers(), req.uri())?;
        let mapping = ctx.mapping();
        let rewrite_body = req.method() != Method::HEAD && self.config.rewrite_rules().matches(req.uri().path());

        debug!(
            trace_id = %ctx.trace_id(),
            "{} {} from {} -> {}://{}",
            req.method(),
            req.uri().path(),
            remote_addr,
            mapping.scheme(),
            mapping.remote()
        );

        let upstream_req = self.build_upstream_request(req, &ctx, remote_addr, rewrite_body)?;

        let stream = self.upstream.connect_tcp(mapping).await?;
        let (mut sender, guard) = match mapping.scheme() {
            Scheme::Http => Self::handshake(stream, mapping).await?,
            Scheme::Https => {
                let stream = self.upstream.connect_tls(mapping, stream).await?;
                Self::handshake(stream, mapping).await?
            }
        };

        let response = sender
            .send_request(upstream_req)
            .await
            .map_err(|e| ReproError::Upstream(format!("failed to send request to {}: {}", mapping.remote(), e)))?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let mut rewritten_headers = Vec::new();
        for key in OUTBOUND_HEADERS.iter() {
            if self
                .header_rewriter
                .rewrite_outbound(std::slice::from_ref(key), &mut parts.headers, &ctx)
            {
                rewritten_headers.push(key.as_str());
            }
        }

        let (body, body_outcome) = if rewrite_body && response_has_body(parts.status) {
            let bytes = body
                .collect()
                .await
                .map_err(|e| ReproError::Upstream(format!("failed to read response body: {}", e)))?
                .to_bytes();
            drop(guard);

            let encoding = parts
                .headers
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let outcome = rewrite_encoded(self.body_rewriter.as_ref(), bytes, encoding.as_deref(), &ctx);

            match &outcome {
                BodyOutcome::Rewritten(_) => {
                    parts.headers.remove("content-md5");
                    parts.headers.remove("content-digest");
                }
                BodyOutcome::Skipped { reason, .. } => {
                    warn!(trace_id = %ctx.trace_id(), "Body rewrite skipped for {}: {}", mapping.local(), reason)
                }
                BodyOutcome::Unchanged(_) => {}
            }
            parts
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(outcome.body().len()));

            let description = outcome.describe();
            (Self::full_body(outcome.into_body()), Some(description))
        } else {
            (GuardedBody { inner: body, guard }.boxed(), None)
        };

        if !self.config.no_logging() {
            inject_diagnostics(&mut parts.headers, &ctx, &rewritten_headers, body_outcome.as_deref());
        }

        Ok(Response::from_parts(parts, body))
    }

    /// Build the request sent upstream: remote Host, inbound header rewrite, no hop-by-hop headers
    fn build_upstream_request(
        &self,
        req: Request<Incoming>,
        ctx: &RequestContext<'_>,
        remote_addr: SocketAddr,
        rewrite_body: bool,
    ) -> Result<Request<Incoming>> {
        let mapping = ctx.mapping();
        let (parts, body) = req.into_parts();

        let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let uri: Uri = path_and_query
            .parse()
            .map_err(|e| ReproError::Upstream(format!("invalid request URI {}: {}", path_and_query, e)))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        self.header_rewriter.rewrite_inbound(&INBOUND_HEADERS, &mut headers, ctx);

        let host = HeaderValue::from_str(mapping.remote())
            .map_err(|e| ReproError::Upstream(format!("invalid remote host {}: {}", mapping.remote(), e)))?;
        headers.insert(HOST, host);

        if let Ok(ip) = HeaderValue::from_str(&remote_addr.ip().to_string()) {
            headers.append("x-forwarded-for", ip);
        }

        if rewrite_body {
            if let Some(accepted) = narrow_accept_encoding(&headers) {
                headers.insert(header::ACCEPT_ENCODING, accepted);
            }
        }

        let mut upstream_req = Request::new(body);
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = uri;
        *upstream_req.version_mut() = Version::HTTP_11;
        *upstream_req.headers_mut() = headers;

        Ok(upstream_req)
    }

    /// HTTP/1.1 handshake; the connection driver lives until the guard drops
    async fn handshake<S>(stream: S, mapping: &Mapping) -> Result<(SendRequest<Incoming>, ConnectionGuard)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let (sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ReproError::Upstream(format!("handshake with {} failed: {}", mapping.remote(), e)))?;

        let remote = mapping.remote().to_string();
        let task = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection error ({}): {}", remote, e);
            }
        });

        Ok((sender, ConnectionGuard(task.abort_handle())))
    }

    /// Create error response
    fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(Self::full_body(Bytes::from(message.to_string())));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> ProxyBody {
        Full::new(bytes).map_err(|never| match never {}).boxed()
    }
}

fn response_has_body(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Restrict the client's `Accept-Encoding` to codings the body rewriter handles.
///
/// Returns `None` when the client sent no `Accept-Encoding`, and `identity`
/// when none of the client's acceptable codings can be rewritten.
fn narrow_accept_encoding(headers: &HeaderMap) -> Option<HeaderValue> {
    if !headers.contains_key(header::ACCEPT_ENCODING) {
        return None;
    }

    let mut offered: Vec<(String, bool)> = Vec::new();
    for value in headers.get_all(header::ACCEPT_ENCODING) {
        let Ok(value) = value.to_str() else { continue };

        for item in value.split(',') {
            let mut params = item.split(';');
            let coding = params.next().unwrap_or_default().trim().to_ascii_lowercase();
            if coding.is_empty() {
                continue;
            }

            let refused = params.any(|param| {
                let (key, q) = param.split_once('=').unwrap_or((param, ""));
                key.trim().eq_ignore_ascii_case("q") && q.trim().parse::<f32>().map_or(false, |q| q <= 0.0)
            });
            let coding = if coding == "x-gzip" { "gzip".to_string() } else { coding };
            offered.push((coding, !refused));
        }
    }

    let explicitly = |coding: &str| offered.iter().find(|(c, _)| c == coding).map(|(_, ok)| *ok);
    let wildcard = explicitly("*").unwrap_or(false);

    let accepted: Vec<&str> = REWRITABLE_ENCODINGS
        .iter()
        .copied()
        .filter(|coding| explicitly(*coding).unwrap_or(wildcard))
        .collect();

    if accepted.is_empty() {
        Some(HeaderValue::from_static("identity"))
    } else {
        HeaderValue::from_str(&accepted.join(", ")).ok()
    }
}

/// Add the diagnostic headers, never replacing a header the upstream already set
fn inject_diagnostics(
    headers: &mut HeaderMap,
    ctx: &RequestContext<'_>,
    rewritten_headers: &[&str],
    body_outcome: Option<&str>,
) {
    insert_diagnostic(headers, TRACE_ID_HEADER, &ctx.trace_id().to_string());

    if !rewritten_headers.is_empty() {
        insert_diagnostic(headers, LOG_HEADERS_HEADER, &rewritten_headers.join(", "));
    }

    if let Some(outcome) = body_outcome {
        insert_diagnostic(headers, LOG_BODY_HEADER, outcome);
    }
}

fn insert_diagnostic(headers: &mut HeaderMap, name: &'static str, value: &str) {
    debug_assert!(name.starts_with(DIAGNOSTIC_PREFIX));

    if headers.contains_key(name) {
        warn!("Upstream response already carries {}; diagnostic header not injected", name);
        return;
    }

    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(e) => debug!("Diagnostic header {} not injected: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingTable;

    fn table() -> MappingTable {
        let mut table = MappingTable::new();
        table.add_mapping("app.local", "http", "backend.internal:8080").unwrap();
        table
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn test_strip_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, X-Internal-Token"));
        headers.insert("x-internal-token", HeaderValue::from_static("secret"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key("x-internal-token"));
        assert!(!headers.contains_key(header::CONNECTION));
        assert!(headers.contains_key(header::ACCEPT));
    }

    fn narrowed(accept_encoding: Option<&'static str>) -> Option<HeaderValue> {
        let mut headers = HeaderMap::new();
        if let Some(value) = accept_encoding {
            headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static(value));
        }
        narrow_accept_encoding(&headers)
    }

    #[test]
    fn test_narrow_accept_encoding() {
        assert_eq!(narrowed(None), None);
        assert_eq!(narrowed(Some("br, zstd, gzip")).unwrap(), "gzip");
        assert_eq!(narrowed(Some("deflate, gzip;q=0.5, br")).unwrap(), "gzip, deflate");
        assert_eq!(narrowed(Some("x-gzip")).unwrap(), "gzip");
        assert_eq!(narrowed(Some("*")).unwrap(), "gzip, deflate");
        assert_eq!(narrowed(Some("*, gzip;q=0")).unwrap(), "deflate");
    }

    #[test]
    fn test_narrow_accept_encoding_falls_back_to_identity() {
        assert_eq!(narrowed(Some("identity")).unwrap(), "identity");
        assert_eq!(narrowed(Some("br")).unwrap(), "identity");
        assert_eq!(narrowed(Some("gzip;q=0, deflate;q=0.0")).unwrap(), "identity");
        assert_eq!(narrowed(Some("")).unwrap(), "identity");
    }

    #[test]
    fn test_inject_diagnostics() {
        let table = table();
        let ctx = RequestContext::new(&table, table.find("app.local").unwrap());
        let mut headers = HeaderMap::new();

        inject_diagnostics(&mut headers, &ctx, &["location", "link"], Some("rewritten"));

        assert_eq!(headers[TRACE_ID_HEADER], ctx.trace_id().to_string().as_str());
        assert_eq!(headers[LOG_HEADERS_HEADER], "location, link");
        assert_eq!(headers[LOG_BODY_HEADER], "rewritten");
    }

    #[test]
    fn test_diagnostics_omitted_when_nothing_to_report() {
        let table = table();
        let ctx = RequestContext::new(&table, table.find("app.local").unwrap());
        let mut headers = HeaderMap::new();

        inject_diagnostics(&mut headers, &ctx, &[], None);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(TRACE_ID_HEADER));
    }

    #[test]
    fn test_diagnostics_never_overwrite() {
        let table = table();
        let ctx = RequestContext::new(&table, table.find("app.local").unwrap());
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_ID_HEADER, HeaderValue::from_static("from-upstream"));

        inject_diagnostics(&mut headers, &ctx, &[], Some("unchanged"));

        assert_eq!(headers.get_all(TRACE_ID_HEADER).iter().count(), 1);
        assert_eq!(headers[TRACE_ID_HEADER], "from-upstream");
        assert_eq!(headers[LOG_BODY_HEADER], "unchanged");
    }

    #[test]
    fn test_error_response() {
        let response = ProxyEngine::error_response(StatusCode::NOT_FOUND, "unknown host: x");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    }
}
