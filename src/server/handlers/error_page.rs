use std::sync::Arc;

use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    HeaderValue, StatusCode,
};
use hyper::body::Body;
use log::error;

use crate::{server::virtual_host::Handler, PorticoBody, PorticoBodyExt, Request, Response};

/// Small HTML page describing `status`.
pub fn error_page(status: StatusCode) -> String {
    format!(
        "<html><head><title>Error</title></head><body>{} - {}</body></html>",
        status.as_u16(),
        status
            .canonical_reason()
            .unwrap_or("Unknown")
    )
}

/// An error response carrying the page for `status`.
pub fn error_response(status: StatusCode) -> Response {
    let mut response = Response::builder()
        .status(status)
        .empty();
    render_into(&mut response);
    response
}

fn render_into(response: &mut Response) {
    let page = error_page(response.status());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=UTF-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(page.len()));
    *response.body_mut() = PorticoBody::body_from_text(&page);
}

fn has_empty_body(response: &Response) -> bool {
    response
        .body()
        .size_hint()
        .exact()
        == Some(0)
}

/// Renders error pages for bodiless error responses.
///
/// A response with status 400 or above and an empty body gets an HTML page;
/// a handler failure is logged and answered with a 500 page.
pub fn error_page_handler(next: Handler) -> Handler {
    Arc::new(move |request: Request| {
        let next = next.clone();
        Box::pin(async move {
            match next(request).await {
                Ok(mut response) => {
                    if response.status().as_u16() >= 400 && has_empty_body(&response) {
                        render_into(&mut response);
                    }
                    Ok(response)
                }
                Err(e) => {
                    error!("Request handler failed: {}", e);
                    Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR))
                }
            }
        })
    })
}
