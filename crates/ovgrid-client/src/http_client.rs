//! One-shot HTTP client.
//!
//! Each call dials the endpoint, performs an HTTP/1.1 handshake, sends one
//! request and lets the connection close once the response body has been
//! consumed. Holding no pooled connections means TLS sessions and file
//! descriptors are released after every request.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::tls::TlsOptions;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "ovgrid/0.1";

/// Parsed network location of an HTTP collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `tcp://host:port`, `http://host:port`, `https://host:port` or a
    /// bare `host:port`. Any path component is ignored.
    pub fn parse(url: &str) -> ClientResult<Self> {
        let url = url.trim();
        let (tls, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else if let Some(rest) = url.strip_prefix("tcp://") {
            (false, rest)
        } else if url.contains("://") {
            return Err(ClientError::InvalidEndpoint(format!(
                "unsupported scheme in {url}"
            )));
        } else {
            (false, url)
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ClientError::InvalidEndpoint(format!("bad port in {url}"))
                })?;
                (host, port)
            }
            None => (authority, if tls { 443 } else { 80 }),
        };

        if host.is_empty() {
            return Err(ClientError::InvalidEndpoint(format!("missing host in {url}")));
        }

        Ok(Self {
            tls,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port`, as used for dialing and the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL suitable for logs.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}", self.authority())
    }
}

/// A fully-read HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub body: Bytes,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Turn 4xx/5xx answers into `ClientError::Status`.
    pub fn error_for_status(self) -> ClientResult<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            return Err(ClientError::Status {
                status: self.status.as_u16(),
                body: self.text().trim().to_string(),
            });
        }
        Ok(self)
    }

    pub fn json<T: DeserializeOwned>(&self) -> ClientResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| ClientError::Decode(e.to_string()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A response whose body is consumed chunk by chunk (long-lived streams).
pub struct BodyStream {
    status: StatusCode,
    body: Incoming,
}

impl BodyStream {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Next data chunk, or `None` when the server closed the stream.
    pub async fn next_chunk(&mut self) -> Option<ClientResult<Bytes>> {
        loop {
            match self.body.frame().await {
                None => return None,
                Some(Err(e)) => return Some(Err(ClientError::Request(e.to_string()))),
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        return Some(Ok(data));
                    }
                    // Trailers carry nothing we use.
                }
            }
        }
    }
}

/// HTTP client bound to a single endpoint.
#[derive(Clone)]
pub struct HttpClient {
    endpoint: Endpoint,
    tls: Option<TlsConnector>,
    timeout: Duration,
}

impl HttpClient {
    /// Create a client for `url`. Passing TLS options forces TLS even for
    /// `tcp://` URLs; an `https://` URL without TLS options is rejected.
    pub fn new(url: &str, tls: Option<&TlsOptions>) -> ClientResult<Self> {
        let mut endpoint = Endpoint::parse(url)?;
        let tls = match tls {
            Some(opts) => {
                endpoint.tls = true;
                Some(TlsConnector::from(opts.client_config()?))
            }
            None if endpoint.tls => {
                return Err(ClientError::Tls(format!(
                    "{url} requires TLS options (CA file)"
                )));
            }
            None => None,
        };

        Ok(Self {
            endpoint,
            tls,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn get(&self, path: &str) -> ClientResult<Response> {
        self.send(Method::GET, path, None).await
    }

    pub async fn delete(&self, path: &str) -> ClientResult<Response> {
        self.send(Method::DELETE, path, None).await
    }

    /// POST with an optional JSON body.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&T>,
    ) -> ClientResult<Response> {
        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| ClientError::Request(format!("encode body: {e}")))?;
        self.send(Method::POST, path, body).await
    }

    /// Send one request and read the whole response within the timeout.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ClientResult<Response> {
        let exchange = async {
            let resp = self.open(method.clone(), path, body).await?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ClientError::Request(e.to_string()))?
                .to_bytes();
            Ok::<_, ClientError>(Response { status, body })
        };

        let resp = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;

        debug!(
            %method,
            endpoint = %self.endpoint.base_url(),
            %path,
            status = resp.status.as_u16(),
            "http request completed"
        );
        Ok(resp)
    }

    /// Send one request and hand back the body as a stream. Only the
    /// connection setup is bounded by the timeout.
    pub async fn stream(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ClientResult<BodyStream> {
        let resp = tokio::time::timeout(self.timeout, self.open(method, path, body))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        let status = resp.status();
        Ok(BodyStream {
            status,
            body: resp.into_body(),
        })
    }

    async fn open(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ClientResult<http::Response<Incoming>> {
        let addr = self.endpoint.authority();
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| ClientError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let request = self.build_request(method, path, body)?;

        match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.endpoint.host.clone())
                    .map_err(|e| ClientError::Tls(e.to_string()))?;
                let stream = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| ClientError::Connect {
                        addr: addr.clone(),
                        reason: format!("tls handshake: {e}"),
                    })?;
                exchange(stream, request).await
            }
            None => exchange(tcp, request).await,
        }
    }

    fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ClientResult<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("host", self.endpoint.authority())
            .header("user-agent", USER_AGENT);

        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }

        builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ClientError::Request(e.to_string()))
    }
}

async fn exchange<IO>(
    io: IO,
    request: Request<Full<Bytes>>,
) -> ClientResult<http::Response<Incoming>>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| ClientError::Request(format!("handshake: {e}")))?;

    // Drive the connection in the background; it ends with the response.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "http connection closed with error");
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| ClientError::Request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single canned response and return the raw request text.
    async fn one_shot_server(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if n == 0 || buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (addr, handle)
    }

    #[test]
    fn endpoint_parses_schemes() {
        let e = Endpoint::parse("tcp://10.0.0.1:2375").unwrap();
        assert_eq!(e, Endpoint { tls: false, host: "10.0.0.1".into(), port: 2375 });

        let e = Endpoint::parse("https://swarm.local:3376/").unwrap();
        assert!(e.tls);
        assert_eq!(e.authority(), "swarm.local:3376");

        let e = Endpoint::parse("http://ofc:8080/v1").unwrap();
        assert_eq!(e.port, 8080);
        assert_eq!(e.base_url(), "http://ofc:8080");
    }

    #[test]
    fn endpoint_defaults_port_from_scheme() {
        assert_eq!(Endpoint::parse("http://ofc").unwrap().port, 80);
        assert_eq!(Endpoint::parse("https://ofc").unwrap().port, 443);
    }

    #[test]
    fn endpoint_rejects_garbage() {
        assert!(Endpoint::parse("unix:///var/run/docker.sock").is_err());
        assert!(Endpoint::parse("http://:80").is_err());
        assert!(Endpoint::parse("http://host:port").is_err());
    }

    #[test]
    fn https_without_tls_options_is_rejected() {
        let err = HttpClient::new("https://engine:2376", None).err().unwrap();
        assert!(matches!(err, ClientError::Tls(_)));
    }

    #[tokio::test]
    async fn get_reads_full_body() {
        let (addr, server) =
            one_shot_server("HTTP/1.1 200 OK\r\ncontent-length: 11\r\n\r\n{\"ok\":true}").await;

        let client = HttpClient::new(&format!("http://{addr}"), None).unwrap();
        let resp = client.get("/containers/abc/json").await.unwrap();
        assert!(resp.is_success());

        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["ok"], true);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /containers/abc/json HTTP/1.1"));
        assert!(request.to_lowercase().contains(&format!("host: {addr}")));
    }

    #[tokio::test]
    async fn error_status_is_surfaced() {
        let (addr, _server) =
            one_shot_server("HTTP/1.1 404 Not Found\r\ncontent-length: 9\r\n\r\nno such c").await;

        let client = HttpClient::new(&addr, None).unwrap();
        let err = client
            .post_json::<()>("/v1/containers/abc", None)
            .await
            .unwrap()
            .error_for_status()
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        // Bind and drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClient::new(&format!("tcp://{addr}"), None).unwrap();
        let err = client.get("/").await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
