mod handler_tests {
    use std::error::Error;

    use bytes::Bytes;
    use http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, SET_COOKIE, TRANSFER_ENCODING},
        HeaderValue, StatusCode,
    };

    use crate::{
        errors::PorticoError,
        server::{
            handlers::{
                cookie_handler, error_page, error_page_handler, form_handler,
                transfer_encoding_handler, Cookie, RequestCookies, MAX_FORM_SIZE,
            },
            virtual_host::handler_fn,
        },
        tests::{body_text, request},
        PorticoBody, PorticoBodyExt, Request, Response,
    };

    fn form_request(body: Bytes) -> Result<Request, Box<dyn Error>> {
        let request = http::Request::builder()
            .method("POST")
            .uri("/submit")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded; charset=UTF-8")
            .body(PorticoBody::body_from_bytes(body))?;
        Ok(Request::from(request))
    }

    #[test]
    fn test_cookie_parsing() -> Result<(), Box<dyn Error>> {
        let mut headers = http::HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("session=abc; theme=\"dark\""));
        headers.append(COOKIE, HeaderValue::from_static("session=ignored; flag"));

        let cookies = RequestCookies::parse(&headers);

        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("session"), Some("abc"));
        assert_eq!(cookies.get("theme"), Some("dark"));
        assert_eq!(cookies.get("flag"), None);

        Ok(())
    }

    #[test]
    fn test_cookie_format() {
        let cookie = Cookie::new("session", "abc")
            .path("/")
            .max_age(3600)
            .secure(true)
            .http_only(true);

        assert_eq!(cookie.to_string(), "session=abc; Path=/; Max-Age=3600; Secure; HttpOnly");
    }

    #[tokio::test]
    async fn test_cookie_handler() -> Result<(), Box<dyn Error>> {
        let handler = cookie_handler(handler_fn(|request| async move {
            let theme = request
                .cookies()
                .and_then(|cookies| cookies.get("theme"))
                .unwrap_or("none")
                .to_string();

            let mut response = Response::builder().text(&theme);
            response.add_cookie(Cookie::new("seen", "1"));
            response.add_cookie(Cookie::new("theme", "light").path("/"));
            Ok(response)
        }));

        let mut request = request("GET", None, "/")?;
        request
            .headers_mut()
            .insert(COOKIE, HeaderValue::from_static("theme=dark"));

        let response = handler(request).await?;
        let set_cookies: Vec<_> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();

        assert_eq!(set_cookies, vec!["seen=1".to_string(), "theme=light; Path=/".to_string()]);
        assert_eq!(body_text(response).await?, "dark");

        Ok(())
    }

    #[tokio::test]
    async fn test_form_handler() -> Result<(), Box<dyn Error>> {
        let handler = form_handler(handler_fn(|request| async move {
            let form = request
                .form_data()
                .cloned()
                .unwrap_or_default();
            let tags: Vec<&str> = form
                .get_all("tag")
                .collect();

            let text = format!(
                "{} {} {}",
                form.get("name")
                    .unwrap_or_default(),
                tags.join(","),
                body_len(request).await
            );
            Ok(Response::builder().text(&text))
        }));

        let body = Bytes::from_static(b"name=port+ico&tag=a&tag=b%21");
        let response = handler(form_request(body)?).await?;

        assert_eq!(body_text(response).await?, "port ico a,b! 28");

        Ok(())
    }

    async fn body_len(request: Request) -> usize {
        use http_body_util::BodyExt;

        let (_, body) = request.into_parts();
        body.collect()
            .await
            .map(|collected| {
                collected
                    .to_bytes()
                    .len()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_form_too_large() -> Result<(), Box<dyn Error>> {
        let handler = form_handler(handler_fn(|_request| async move {
            Ok(Response::builder().text("unreachable"))
        }));

        let body = Bytes::from(vec![b'a'; MAX_FORM_SIZE + 1]);
        let response = handler(form_request(body)?).await?;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        Ok(())
    }

    #[tokio::test]
    async fn test_form_handler_skips_other_bodies() -> Result<(), Box<dyn Error>> {
        let handler = form_handler(handler_fn(|request| async move {
            let decoded = request
                .form_data()
                .is_some();
            Ok(Response::builder().text(&decoded.to_string()))
        }));

        let response = handler(request("GET", None, "/")?).await?;
        assert_eq!(body_text(response).await?, "false");

        Ok(())
    }

    #[test]
    fn test_error_page() {
        assert_eq!(
            error_page(StatusCode::NOT_FOUND),
            "<html><head><title>Error</title></head><body>404 - Not Found</body></html>"
        );
    }

    #[tokio::test]
    async fn test_error_page_handler() -> Result<(), Box<dyn Error>> {
        let empty_404 = error_page_handler(handler_fn(|_request| async move {
            Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .empty())
        }));
        let response = empty_404(request("GET", None, "/")?).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response
                .headers()
                .get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/html; charset=UTF-8"))
        );
        assert_eq!(body_text(response).await?, error_page(StatusCode::NOT_FOUND));

        let custom_body = error_page_handler(handler_fn(|_request| async move {
            Ok(Response::builder()
                .status(StatusCode::FORBIDDEN)
                .text("go away"))
        }));
        let response = custom_body(request("GET", None, "/")?).await?;
        assert_eq!(body_text(response).await?, "go away");

        let failing = error_page_handler(handler_fn(|_request| async move {
            Err(PorticoError::Handler("boom".to_string()))
        }));
        let response = failing(request("GET", None, "/")?).await?;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await?, error_page(StatusCode::INTERNAL_SERVER_ERROR));

        Ok(())
    }

    #[tokio::test]
    async fn test_transfer_encoding() -> Result<(), Box<dyn Error>> {
        let handler = transfer_encoding_handler(handler_fn(|_request| async move {
            Ok(Response::builder()
                .header(TRANSFER_ENCODING, HeaderValue::from_static("chunked"))
                .header(CONTENT_LENGTH, HeaderValue::from_static("99"))
                .text("hello"))
        }));

        let response = handler(request("GET", None, "/")?).await?;
        assert!(response
            .headers()
            .get(TRANSFER_ENCODING)
            .is_none());
        assert_eq!(
            response
                .headers()
                .get(CONTENT_LENGTH),
            Some(&HeaderValue::from(5u64))
        );

        let no_content = transfer_encoding_handler(handler_fn(|_request| async move {
            Ok(Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header(CONTENT_LENGTH, HeaderValue::from_static("0"))
                .empty())
        }));
        let response = no_content(request("GET", None, "/")?).await?;
        assert!(response
            .headers()
            .get(CONTENT_LENGTH)
            .is_none());

        let head = transfer_encoding_handler(handler_fn(|_request| async move {
            Ok(Response::builder()
                .header(CONTENT_LENGTH, HeaderValue::from_static("1234"))
                .empty())
        }));
        let response = head(request("HEAD", None, "/")?).await?;
        assert_eq!(
            response
                .headers()
                .get(CONTENT_LENGTH),
            Some(&HeaderValue::from_static("1234"))
        );

        Ok(())
    }
}
