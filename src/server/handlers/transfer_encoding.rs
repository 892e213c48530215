use std::sync::Arc;

use http::{
    header::{CONTENT_LENGTH, TRANSFER_ENCODING},
    HeaderValue, Method,
};
use hyper::body::Body;
use log::debug;

use crate::{server::virtual_host::Handler, Request, Response};

/// Brings response framing headers in line with the body the HTTP codec is
/// about to write.
///
/// `Transfer-Encoding` is owned by the codec and always removed. When the
/// body size is known exactly, `Content-Length` is set to it; a
/// `Content-Length` that contradicts the body is dropped so the codec falls
/// back to chunked encoding. Responses to `HEAD` keep the handler's
/// `Content-Length`, and 1xx/204 responses never carry one.
pub fn transfer_encoding_handler(next: Handler) -> Handler {
    Arc::new(move |request: Request| {
        let next = next.clone();
        let head = *request.method() == Method::HEAD;
        Box::pin(async move {
            let mut response = next(request).await?;
            normalize(&mut response, head);
            Ok(response)
        })
    })
}

fn normalize(response: &mut Response, head: bool) {
    let status = response.status();
    let hint = response
        .body()
        .size_hint();
    let headers = response.headers_mut();

    if headers
        .remove(TRANSFER_ENCODING)
        .is_some()
    {
        debug!("Dropped handler supplied Transfer-Encoding");
    }

    if status.is_informational() || status == http::StatusCode::NO_CONTENT {
        headers.remove(CONTENT_LENGTH);
        return;
    }

    if head {
        return;
    }

    if let Some(exact) = hint.exact() {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(exact));
        return;
    }

    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());

    if let Some(declared) = declared {
        let too_small = declared < hint.lower();
        let too_large = hint
            .upper()
            .is_some_and(|upper| declared > upper);
        if too_small || too_large {
            debug!("Dropped Content-Length {} contradicting the body", declared);
            headers.remove(CONTENT_LENGTH);
        }
    } else if headers.contains_key(CONTENT_LENGTH) {
        headers.remove(CONTENT_LENGTH);
    }
}
