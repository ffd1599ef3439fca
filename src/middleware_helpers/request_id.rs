use crate::tracing::RequestId;
use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

/// Header name for the request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Accepts an inbound `x-request-id` (or generates one), exposes it as an
/// extension and task-local, and echoes it on the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let inbound = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .and_then(|v| HeaderValue::from_str(v).ok().map(|hv| (RequestId::new(v), hv)));

    let (request_id, header_value) = match inbound {
        Some(pair) => pair,
        None => {
            let generated = RequestId::default();
            match HeaderValue::from_str(generated.as_str()) {
                Ok(hv) => (generated, hv),
                // uuid strings are always valid header values
                Err(_) => (generated, HeaderValue::from_static("unknown")),
            }
        }
    };

    request.headers_mut().insert(
        HeaderName::from_static(REQUEST_ID_HEADER),
        header_value.clone(),
    );
    request.extensions_mut().insert(request_id.clone());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id.as_str(),
        method = %request.method(),
        uri = %request.uri(),
    );

    let mut response = crate::tracing::scope_request_id(request_id, next.run(request))
        .instrument(span)
        .await;

    response
        .headers_mut()
        .insert(HeaderName::from_static(REQUEST_ID_HEADER), header_value);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        extract::Extension,
        http::{Request as HttpRequest, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn extension_handler(
        Extension(request_id): Extension<RequestId>,
    ) -> (StatusCode, String) {
        (
            StatusCode::OK,
            format!("request-id:{}", request_id.as_str()),
        )
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(extension_handler))
            .layer(axum::middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn generates_request_id_when_absent() {
        let response = app()
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let header = response.headers().get(REQUEST_ID_HEADER).cloned();
        assert!(header.is_some());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body_str = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(
            body_str,
            format!("request-id:{}", header.unwrap().to_str().unwrap())
        );
    }

    #[tokio::test]
    async fn echoes_inbound_request_id() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "checkout-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).unwrap(),
            "checkout-42"
        );
    }
}
