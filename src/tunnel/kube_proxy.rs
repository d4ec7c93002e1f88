//! Forwards a tunnelled request to the Kubernetes API server.
//!
//! Every request gets its own connection. Nothing is pooled: once the
//! response arrives the connection may be taken over by an upgraded stream
//! (`kubectl exec`, `port-forward`, `attach`), and a pooled client would
//! never hand it back.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, AUTHORIZATION, HOST};
use hyper::http::uri::{Authority, Scheme};
use hyper::{Request, Response, Uri, Version};
use hyper_util::rt::TokioIo;
use kube::client::ConfigExt;
use secrecy::ExposeSecret;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::dial::{host_of, Dialer, TcpDialer, TlsDialer};
use crate::error::{Error, Result};

/// Where tunnelled requests are sent: scheme, authority and an optional
/// base path and query prefixed to every request.
#[derive(Debug, Clone)]
pub struct ApiTarget {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    query: Option<String>,
}

impl ApiTarget {
    pub fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::Config(format!("invalid API server URL {url:?}: {e}")))?;
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| Error::Config(format!("API server URL {url:?} has no scheme")))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| Error::Config(format!("API server URL {url:?} has no host")))?;
        Ok(Self {
            scheme,
            authority,
            base_path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
        })
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// `host:port`, with the scheme's default port filled in.
    pub fn dial_address(&self) -> String {
        let port = self
            .authority
            .port_u16()
            .unwrap_or(if self.is_https() { 443 } else { 80 });
        format!("{}:{port}", self.authority.host())
    }

    pub fn authority(&self) -> &str {
        self.authority.as_str()
    }

    /// Origin-form URI for `uri` on this target: base path joined with the
    /// request path, target query first.
    pub fn redirect(&self, uri: &Uri) -> Result<Uri> {
        let path = single_joining_slash(&self.base_path, uri.path());
        let target_query = self.query.as_deref().unwrap_or_default();
        let request_query = uri.query().unwrap_or_default();
        let query = if target_query.is_empty() || request_query.is_empty() {
            format!("{target_query}{request_query}")
        } else {
            format!("{target_query}&{request_query}")
        };
        let path_and_query = if query.is_empty() {
            path
        } else {
            format!("{path}?{query}")
        };
        path_and_query
            .parse()
            .map_err(|e| Error::InvalidRequest(format!("redirected URI: {e}")))
    }
}

impl fmt::Display for ApiTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.base_path)
    }
}

/// Join two URL paths. An empty or root side yields the other untouched;
/// otherwise the result is lexically cleaned.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    if a.is_empty() || a == "/" {
        return b.to_string();
    }
    if b.is_empty() || b == "/" {
        return a.to_string();
    }
    clean_path(&format!("{a}/{b}"))
}

/// Lexical path cleaning: collapse repeated slashes, drop `.` segments,
/// resolve `..`, strip any trailing slash.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }
    let joined = segments.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Bearer credential attached to requests that carry none of their own.
#[derive(Clone)]
pub enum BearerToken {
    Static(String),
    /// Re-read on every request so projected tokens can rotate.
    File(PathBuf),
}

impl BearerToken {
    async fn resolve(&self) -> Result<String> {
        match self {
            BearerToken::Static(token) => Ok(token.clone()),
            BearerToken::File(path) => Ok(tokio::fs::read_to_string(path).await?.trim().to_string()),
        }
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BearerToken::Static(_) => f.write_str("BearerToken::Static(<redacted>)"),
            BearerToken::File(path) => f.debug_tuple("BearerToken::File").field(path).finish(),
        }
    }
}

/// Keeps the upstream connection alive. Dropping it closes the connection.
pub struct UpstreamConnection(JoinHandle<()>);

impl Drop for UpstreamConnection {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Sends tunnelled requests to the API server.
pub struct KubernetesClientManager {
    target: ApiTarget,
    dialer: Arc<dyn Dialer>,
    bearer: Option<BearerToken>,
}

impl KubernetesClientManager {
    pub fn new(target: ApiTarget, dialer: Arc<dyn Dialer>, bearer: Option<BearerToken>) -> Self {
        Self {
            target,
            dialer,
            bearer,
        }
    }

    /// Build from client credentials. `api_server` overrides the URL in
    /// the config when set.
    pub fn from_kube_config(config: &kube::Config, api_server: Option<&str>) -> Result<Self> {
        let url = api_server.map_or_else(|| config.cluster_url.to_string(), str::to_string);
        let target = ApiTarget::parse(&url)?;

        let dialer: Arc<dyn Dialer> = if target.is_https() {
            let mut tls = config
                .rustls_client_config()
                .map_err(|e| Error::Tls(format!("API server TLS config: {e}")))?;
            // Upgrades need HTTP/1.1.
            tls.alpn_protocols = vec![b"http/1.1".to_vec()];
            let address = target.dial_address();
            let server_name = config
                .tls_server_name
                .clone()
                .unwrap_or_else(|| host_of(&address).to_string());
            Arc::new(TlsDialer::new(address, Arc::new(tls))?.with_server_name(&server_name)?)
        } else {
            Arc::new(TcpDialer::new(target.dial_address()))
        };

        let auth = &config.auth_info;
        let bearer = match (&auth.token, &auth.token_file) {
            (Some(token), _) => Some(BearerToken::Static(token.expose_secret().to_string())),
            (None, Some(file)) => Some(BearerToken::File(PathBuf::from(file))),
            (None, None) => None,
        };

        Ok(Self::new(target, dialer, bearer))
    }

    pub fn target(&self) -> &ApiTarget {
        &self.target
    }

    /// Rewrite a tunnelled request for the API server.
    pub async fn prepare(&self, request: Request<Bytes>) -> Result<Request<Full<Bytes>>> {
        let (mut parts, body) = request.into_parts();
        parts.uri = self.target.redirect(&parts.uri)?;
        parts.version = Version::HTTP_11;
        parts.headers.insert(
            HOST,
            HeaderValue::from_str(self.target.authority())
                .map_err(|e| Error::InvalidRequest(e.to_string()))?,
        );
        if !parts.headers.contains_key(AUTHORIZATION) {
            if let Some(bearer) = &self.bearer {
                let token = bearer.resolve().await?;
                let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| Error::Config(format!("bearer token: {e}")))?;
                value.set_sensitive(true);
                parts.headers.insert(AUTHORIZATION, value);
            }
        }
        Ok(Request::from_parts(parts, Full::new(body)))
    }

    /// Send `request` on a fresh connection and return the response head
    /// together with the connection it arrived on.
    pub async fn execute(
        &self,
        session_id: u16,
        request: Request<Bytes>,
    ) -> Result<(Response<Incoming>, UpstreamConnection)> {
        let request = self.prepare(request).await?;
        trace!(session_id, uri = %request.uri(), "sending redirected request to API server");

        let io = self.dialer.dial().await.map_err(|source| Error::Dial {
            addr: self.dialer.address().to_string(),
            source,
        })?;
        let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
            .title_case_headers(true)
            .handshake::<_, Full<Bytes>>(TokioIo::new(io))
            .await?;
        let guard = UpstreamConnection(tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                debug!(session_id, error = %e, "API server connection ended with error");
            }
        }));

        // On failure the guard drops here and closes the connection.
        let response = sender.send_request(request).await?;
        Ok((response, guard))
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_single_joining_slash() {
        assert_eq!(single_joining_slash("", "/api"), "/api");
        assert_eq!(single_joining_slash("/", "/api"), "/api");
        assert_eq!(single_joining_slash("/base", ""), "/base");
        assert_eq!(single_joining_slash("/base", "/"), "/base");
        assert_eq!(single_joining_slash("/base/", "/api/v1"), "/base/api/v1");
        assert_eq!(single_joining_slash("/base", "api//v1/"), "/base/api/v1");
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/a/./b/../c"), "/a/c");
        assert_eq!(clean_path("/../a"), "/a");
        assert_eq!(clean_path("a/../.."), "..");
        assert_eq!(clean_path(""), ".");
        assert_eq!(clean_path("//"), "/");
    }

    #[test]
    fn test_redirect_merges_query() {
        let t = ApiTarget::parse("https://10.96.0.1:443/prefix?a=1").unwrap();
        assert_eq!(
            t.redirect(&uri("/api/v1/pods?watch=true")).unwrap(),
            "/prefix/api/v1/pods?a=1&watch=true"
        );
        assert_eq!(t.redirect(&uri("/healthz")).unwrap(), "/prefix/healthz?a=1");

        let plain = ApiTarget::parse("https://kubernetes.default.svc").unwrap();
        assert_eq!(plain.redirect(&uri("/version?x=y")).unwrap(), "/version?x=y");
        assert_eq!(plain.redirect(&uri("/version")).unwrap(), "/version");
    }

    #[test]
    fn test_dial_address_defaults_port() {
        assert_eq!(
            ApiTarget::parse("https://kubernetes.default.svc").unwrap().dial_address(),
            "kubernetes.default.svc:443"
        );
        assert_eq!(
            ApiTarget::parse("http://127.0.0.1:8080").unwrap().dial_address(),
            "127.0.0.1:8080"
        );
        assert!(ApiTarget::parse("/no/scheme").is_err());
    }

    fn manager(url: &str, bearer: Option<BearerToken>) -> KubernetesClientManager {
        let target = ApiTarget::parse(url).unwrap();
        let dialer = Arc::new(TcpDialer::new(target.dial_address()));
        KubernetesClientManager::new(target, dialer, bearer)
    }

    #[tokio::test]
    async fn test_prepare_rewrites_host_and_adds_bearer() {
        let m = manager(
            "https://10.96.0.1:6443",
            Some(BearerToken::Static("s3cret".into())),
        );
        let req = Request::get("/api?x=1")
            .header("host", "relay.example.com")
            .body(Bytes::new())
            .unwrap();
        let out = m.prepare(req).await.unwrap();
        assert_eq!(out.headers()[HOST], "10.96.0.1:6443");
        assert_eq!(out.headers()[AUTHORIZATION], "Bearer s3cret");
        assert_eq!(out.uri(), "/api?x=1");
    }

    #[tokio::test]
    async fn test_prepare_keeps_caller_authorization() {
        let m = manager(
            "https://10.96.0.1:6443",
            Some(BearerToken::Static("s3cret".into())),
        );
        let req = Request::get("/api")
            .header("authorization", "Bearer user-token")
            .body(Bytes::new())
            .unwrap();
        let out = m.prepare(req).await.unwrap();
        assert_eq!(out.headers()[AUTHORIZATION], "Bearer user-token");
    }

    #[tokio::test]
    async fn test_token_file_is_reread() {
        let dir = std::env::temp_dir().join(format!("connector-token-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("token");
        std::fs::write(&path, "first\n").unwrap();
        let m = manager("http://127.0.0.1:1", Some(BearerToken::File(path.clone())));

        let out = m.prepare(Request::get("/").body(Bytes::new()).unwrap()).await.unwrap();
        assert_eq!(out.headers()[AUTHORIZATION], "Bearer first");

        std::fs::write(&path, "second").unwrap();
        let out = m.prepare(Request::get("/").body(Bytes::new()).unwrap()).await.unwrap();
        assert_eq!(out.headers()[AUTHORIZATION], "Bearer second");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_bearer_debug_redacts() {
        let s = format!("{:?}", BearerToken::Static("s3cret".into()));
        assert!(!s.contains("s3cret"));
    }

    async fn read_head(reader: &mut BufReader<tokio::net::TcpStream>) -> String {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            head.push_str(&line);
            if line == "\r\n" || line.is_empty() {
                return head;
            }
        }
    }

    #[tokio::test]
    async fn test_execute_plain_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(conn);
            let head = read_head(&mut reader).await;
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
            head
        });

        let m = manager(&format!("http://{addr}/base"), None);
        let req = Request::get("/api/v1/nodes")
            .header("x-tunnel-session-id", "3")
            .body(Bytes::new())
            .unwrap();
        let (response, _conn) = m.execute(3, req).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"hello");

        let head = server.await.unwrap();
        assert!(head.starts_with("GET /base/api/v1/nodes HTTP/1.1\r\n"), "{head}");
        assert!(head.contains(&format!("Host: {addr}\r\n")), "{head}");
    }

    #[tokio::test]
    async fn test_execute_upgrade_hands_over_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(conn);
            read_head(&mut reader).await;
            let mut conn = reader.into_inner();
            conn.write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\n\r\n",
            )
            .await
            .unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let m = manager(&format!("http://{addr}"), None);
        let req = Request::post("/api/v1/namespaces/default/pods/p/exec")
            .header("connection", "Upgrade")
            .header("upgrade", "SPDY/3.1")
            .body(Bytes::new())
            .unwrap();
        let (mut response, _conn) = m.execute(1, req).await.unwrap();
        assert_eq!(response.status(), 101);
        let upgraded = hyper::upgrade::on(&mut response).await.unwrap();
        let mut io = TokioIo::new(upgraded);
        io.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_execute_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let m = manager(&format!("http://{addr}"), None);
        let err = m
            .execute(1, Request::get("/").body(Bytes::new()).unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Dial { .. }));
    }
}
