use std::{collections::HashMap, fmt, sync::Arc};

use http::{
    header::{COOKIE, SET_COOKIE},
    HeaderMap, HeaderValue,
};
use log::warn;

use crate::{server::virtual_host::Handler, Request};

/// Cookies sent by the client, keyed by name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RequestCookies {
    cookies: HashMap<String, String>,
}

impl RequestCookies {
    /// Parses every `Cookie` header. Pairs without `=` are ignored; when a
    /// name repeats, the first value wins.
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut cookies = HashMap::new();

        for value in headers.get_all(COOKIE) {
            let Ok(value) = value.to_str() else {
                continue;
            };

            for pair in value.split(';') {
                let Some((name, value)) = pair.split_once('=') else {
                    continue;
                };
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);

                cookies
                    .entry(name.to_string())
                    .or_insert_with(|| value.to_string());
            }
        }

        Self { cookies }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .get(name)
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies
            .is_empty()
    }
}

/// A cookie to send back to the client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cookie {
    name: String,
    value: String,
    path: Option<String>,
    domain: Option<String>,
    max_age: Option<i64>,
    secure: bool,
    http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            secure: false,
            http_only: false,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(path) = &self.path {
            write!(f, "; Path={}", path)?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={}", domain)?;
        }
        if let Some(max_age) = self.max_age {
            write!(f, "; Max-Age={}", max_age)?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        Ok(())
    }
}

/// Cookies a handler wants to set, stored in the response extensions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResponseCookies {
    cookies: Vec<Cookie>,
}

impl ResponseCookies {
    pub fn add(&mut self, cookie: Cookie) {
        self.cookies
            .push(cookie);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.iter()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies
            .is_empty()
    }
}

/// Parses request cookies into a [`RequestCookies`] extension and writes
/// every [`ResponseCookies`] entry as a `Set-Cookie` header.
pub fn cookie_handler(next: Handler) -> Handler {
    Arc::new(move |mut request: Request| {
        let next = next.clone();
        Box::pin(async move {
            let cookies = RequestCookies::parse(request.headers());
            request
                .extensions_mut()
                .insert(cookies);

            let mut response = next(request).await?;

            let cookies = response
                .extensions_mut()
                .remove::<ResponseCookies>();
            if let Some(cookies) = cookies {
                for cookie in cookies.iter() {
                    match HeaderValue::from_str(&cookie.to_string()) {
                        Ok(value) => {
                            response
                                .headers_mut()
                                .append(SET_COOKIE, value);
                        }
                        Err(_) => warn!("Dropping cookie with invalid value: {}", cookie.name()),
                    }
                }
            }

            Ok(response)
        })
    })
}
