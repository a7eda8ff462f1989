//! ovgrid-client: one-shot HTTP/1.1 client for ovgrid collaborators.
//!
//! Every request opens its own connection (plain TCP or rustls), sends a
//! single request, reads the whole body and drops the connection. There is
//! no idle pool, so nothing lingers between control-plane requests.
//!
//! # Architecture
//!
//! ```text
//! HttpClient
//!   ├── Endpoint (scheme, host, port parsed from tcp:// | http:// | https://)
//!   ├── Option<TlsConnector> (built from PEM files by `tls`)
//!   └── send() → TcpStream → [TLS] → hyper http1 handshake → Response
//! ```

pub mod error;
pub mod http_client;
pub mod tls;

pub use error::{ClientError, ClientResult};
pub use http::{Method, StatusCode};
pub use http_client::{BodyStream, Endpoint, HttpClient, Response};
pub use tls::TlsOptions;
