use std::fmt::Display;
use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::serve::ListenerExt as _;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type BoxRequestError = Box<dyn RequestError>;

/// An error a request handler surfaces to the caller.
///
/// Rendered as the API's uniform error body: `{"status": <int>, "error":
/// <string>}`.
pub trait RequestError: Display + Send + Sync + 'static {
    fn status_code(&self) -> StatusCode;
}

impl IntoResponse for BoxRequestError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let res = json!({
            "status": status.as_u16(),
            "error": self.to_string(),
        });

        (status, res.to_string()).into_response()
    }
}

impl<E: RequestError> From<E> for BoxRequestError {
    fn from(e: E) -> Self {
        Box::new(e)
    }
}

pub async fn serve_at(
    addr: SocketAddr,
    router: axum::Router,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), BoxError> {
    let listener = TcpListener::bind(addr)
        .await?
        .tap_io(|tcp_stream| tcp_stream.set_nodelay(true).unwrap());
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
        })
        .await?;
    Ok(())
}
