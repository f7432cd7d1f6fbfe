//! Minimal HTTP client over a Unix domain socket.
//!
//! Firecracker serves its management API on a Unix socket, which reqwest
//! cannot dial, so requests go through hyper's HTTP/1 connection API on a
//! tokio `UnixStream`.

use std::path::Path;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::UnixStream;

use crate::VmmError;

/// `PUT` `body` as JSON to `uri_path` on the API socket.
///
/// # Errors
/// Returns [`VmmError::Api`] on connection or HTTP errors, including any
/// non-2xx status (the response body is included in the message).
pub(crate) async fn put_json<T: Serialize + ?Sized>(
    socket_path: &Path,
    uri_path: &str,
    body: &T,
) -> Result<String, VmmError> {
    let body = serde_json::to_vec(body)
        .map_err(|e| VmmError::Api(format!("encode {uri_path} body: {e}")))?;
    api_request(socket_path, Method::PUT, uri_path, Bytes::from(body)).await
}

async fn api_request(
    socket_path: &Path,
    method: Method,
    uri_path: &str,
    body: Bytes,
) -> Result<String, VmmError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| VmmError::Api(format!("connect to {}: {e}", socket_path.display())))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| VmmError::Api(format!("HTTP handshake: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("Firecracker API connection closed: {e}");
        }
    });

    let uri: Uri = uri_path
        .parse()
        .map_err(|e| VmmError::Api(format!("invalid URI path {uri_path}: {e}")))?;

    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("Host", "localhost")
        .header("Accept", "application/json")
        .header("Content-Type", "application/json")
        .header("Content-Length", body.len().to_string())
        .body(Full::new(body))
        .map_err(|e| VmmError::Api(format!("build request: {e}")))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| VmmError::Api(format!("send request: {e}")))?;

    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| VmmError::Api(format!("read response body: {e}")))?
        .to_bytes();
    let text = String::from_utf8_lossy(&bytes).into_owned();

    if !status.is_success() {
        return Err(VmmError::Api(format!("HTTP {status} from {uri_path}: {text}")));
    }
    Ok(text)
}
