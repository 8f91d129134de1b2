use std::time::Instant;

use tracing::{error, info, warn};

use super::{MiddlewareFn, Next, from_fn};
use crate::request::Request;

/// Logs one line per completed request: method, path, status and latency.
///
/// Requests dispatched by an [`App`](crate::App) already run inside their
/// request span, so the line carries the request id and trace id with it.
pub fn trace() -> MiddlewareFn {
    from_fn(|req: Request, next: Next| async move {
        let method = req.method().clone();
        let path = req.path().to_owned();
        let started = Instant::now();

        let res = next.run(req).await;

        let status = res.status_code().as_u16();
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if res.status_code().is_server_error() {
            error!(%method, %path, status, elapsed_ms, "request failed");
        } else if res.status_code().is_client_error() {
            warn!(%method, %path, status, elapsed_ms, "request rejected");
        } else {
            info!(%method, %path, status, elapsed_ms, "request completed");
        }
        res
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::middleware::compose;
    use bytes::Bytes;
    use http::StatusCode;

    #[tokio::test]
    async fn passes_response_through() {
        let handler = (|_req: Request| async { (StatusCode::CREATED, "made") }).into_boxed_handler();
        let composed = compose(&[trace()], handler);

        let req: Request = http::Request::post("/things").body(Bytes::new()).unwrap().into();
        let res = composed.call(req).await;
        assert_eq!(res.status_code(), StatusCode::CREATED);
        assert_eq!(res.body(), b"made");
    }
}
