// Shared HTTP client: one connection pool per engine, per-request header
// overlay, and classification of transport failures into stable error kinds.

use crate::config::HttpConfig;
use crate::error::{EngineError, NetworkErrorKind};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client};
use std::collections::HashMap;
use std::error::Error as _;
use tracing::warn;

/// Build the process-wide client. `pool_size` is the already-computed
/// `max(configured idle pool, concurrency cap)`.
pub fn create_client(config: &HttpConfig, pool_size: usize) -> Result<Client, EngineError> {
    Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.read_timeout)
        .redirect(redirect::Policy::limited(config.max_redirects))
        .pool_max_idle_per_host(pool_size.max(1))
        .user_agent(&config.user_agent)
        .use_rustls_tls()
        .build()
        .map_err(|e| EngineError::internal(format!("failed to build HTTP client: {e}")))
}

/// Validate caller-supplied headers into a `HeaderMap`.
///
/// Invalid names or values are skipped, not fatal: a bad UI-entered header
/// must not take the whole task down.
pub fn sanitize_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut valid = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                valid.insert(name, value);
            }
            (Err(_), _) => {
                warn!(header = %name, "Skipping invalid header name");
            }
            (_, Err(_)) => {
                warn!(header = %name, "Skipping invalid header value");
            }
        }
    }
    valid
}

/// A text response body together with its content type, which the manifest
/// parser inspects before trusting the body.
pub struct TextResponse {
    pub body: String,
    pub content_type: Option<String>,
}

pub async fn get_text(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
) -> Result<TextResponse, EngineError> {
    let response = client
        .get(url)
        .headers(headers.clone())
        .send()
        .await
        .map_err(|e| classify_reqwest_error(&e, url))?;

    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::Http {
            status,
            url: url.to_string(),
        });
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let body = response
        .text()
        .await
        .map_err(|e| classify_reqwest_error(&e, url))?;

    Ok(TextResponse { body, content_type })
}

pub async fn get_bytes(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
) -> Result<Bytes, EngineError> {
    let response = client
        .get(url)
        .headers(headers.clone())
        .send()
        .await
        .map_err(|e| classify_reqwest_error(&e, url))?;

    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::Http {
            status,
            url: url.to_string(),
        });
    }

    response
        .bytes()
        .await
        .map_err(|e| classify_reqwest_error(&e, url))
}

/// Map a `reqwest::Error` onto the engine's stable network error kinds by
/// walking its source chain.
pub(crate) fn classify_reqwest_error(err: &reqwest::Error, url: &str) -> EngineError {
    let kind = if err.is_timeout() {
        NetworkErrorKind::Timeout
    } else {
        classify_source_chain(err)
    };
    EngineError::Network {
        kind,
        url: url.to_string(),
    }
}

fn classify_source_chain(err: &reqwest::Error) -> NetworkErrorKind {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => return NetworkErrorKind::ConnectionReset,
                std::io::ErrorKind::TimedOut => return NetworkErrorKind::Timeout,
                _ => {}
            }
        }
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("dns") || text.contains("resolve") || text.contains("lookup") {
            return NetworkErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return NetworkErrorKind::Tls;
        }
        source = inner.source();
    }
    NetworkErrorKind::Aborted
}
