use std::sync::Arc;

use http::{header::CONTENT_TYPE, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use log::debug;

use crate::{
    server::{handlers::error_page::error_response, virtual_host::Handler},
    PorticoBody, PorticoBodyExt, Request,
};

/// Largest url-encoded body decoded into [`FormData`].
pub const MAX_FORM_SIZE: usize = 2 * 1024 * 1024;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Fields of an `application/x-www-form-urlencoded` request body, in the
/// order they were sent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FormData {
    fields: Vec<(String, String)>,
}

impl FormData {
    pub fn parse(body: &[u8]) -> Self {
        let fields = url::form_urlencoded::parse(body)
            .into_owned()
            .collect();
        Self { fields }
    }

    /// First value sent for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields
            .is_empty()
    }
}

fn is_form_urlencoded(request: &Request) -> bool {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_URLENCODED))
}

/// Decodes url-encoded request bodies into a [`FormData`] extension.
///
/// The body is buffered and handed downstream unchanged. Other requests pass
/// through untouched.
pub fn form_handler(next: Handler) -> Handler {
    Arc::new(move |request: Request| {
        let next = next.clone();
        Box::pin(async move {
            if !is_form_urlencoded(&request) {
                return next(request).await;
            }

            let (parts, body) = request.into_parts();
            let collected = Limited::new(body, MAX_FORM_SIZE)
                .collect()
                .await;

            let bytes = match collected {
                Ok(collected) => collected.to_bytes(),
                Err(e) if e.is::<LengthLimitError>() => {
                    return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE));
                }
                Err(e) => {
                    debug!("Cannot read form body: {}", e);
                    return Ok(error_response(StatusCode::BAD_REQUEST));
                }
            };

            let mut request = Request::from_parts(parts, PorticoBody::body_from_bytes(bytes.clone()));
            request
                .extensions_mut()
                .insert(FormData::parse(&bytes));

            next(request).await
        })
    })
}
