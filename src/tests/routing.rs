mod routing_tests {
    use std::{
        error::Error,
        sync::{Arc, Mutex},
    };

    use http::StatusCode;

    use crate::{
        server::{
            chain::{build_handler_chain, NameVirtualHostRouter},
            path::PathRouter,
            virtual_host::{handler_fn, not_found_handler, wrapper_fn, Handler, HostRegistry},
        },
        tests::{body_text, request},
        Request, Response,
    };

    fn reply(text: &'static str) -> Handler {
        handler_fn(move |_request| async move { Ok(Response::builder().text(text)) })
    }

    fn echo_path() -> Handler {
        handler_fn(|request| async move {
            let resolved = request
                .resolved_path()
                .map(|resolved| format!("{}|{}", resolved.prefix(), resolved.relative()))
                .unwrap_or_default();
            Ok(Response::builder().text(&resolved))
        })
    }

    #[test]
    fn test_longest_prefix() {
        let mut router = PathRouter::new(not_found_handler());
        router.add_path("/api", reply("api"));
        router.add_path("/api/v1/", reply("v1"));
        router.add_path("/", reply("root"));

        let prefix = |path: &str| {
            router
                .resolve(path)
                .map(|(prefix, _)| prefix.to_string())
        };

        assert_eq!(prefix("/api/v1/users"), Some("/api/v1".to_string()));
        assert_eq!(prefix("/api/v1"), Some("/api/v1".to_string()));
        assert_eq!(prefix("/api/v2"), Some("/api".to_string()));
        assert_eq!(prefix("/apix"), Some("/".to_string()));
        assert_eq!(prefix("/"), Some("/".to_string()));
    }

    #[test]
    fn test_no_match_without_root() {
        let mut router = PathRouter::new(not_found_handler());
        router.add_path("/static", reply("static"));

        assert!(router
            .resolve("/dynamic")
            .is_none());
        assert!(router
            .resolve("/staticfiles")
            .is_none());
    }

    #[test]
    fn test_multibyte_prefix() {
        let mut router = PathRouter::new(not_found_handler());
        router.add_path("/café", reply("cafe"));

        assert!(router
            .resolve("/caféx")
            .is_none());

        router.add_path("/", reply("root"));
        let prefix = |path: &str| {
            router
                .resolve(path)
                .map(|(prefix, _)| prefix.to_string())
        };

        assert_eq!(prefix("/caféx"), Some("/".to_string()));
        assert_eq!(prefix("/café/menu"), Some("/café".to_string()));
        assert_eq!(prefix("/cafébar/é"), Some("/".to_string()));
    }

    #[tokio::test]
    async fn test_resolved_path() -> Result<(), Box<dyn Error>> {
        let mut router = PathRouter::new(not_found_handler());
        router.add_path("/files", echo_path());
        let handler = router.into_handler();

        let response = handler(request("GET", None, "/files/a/b.txt")?).await?;
        assert_eq!(body_text(response).await?, "/files|/a/b.txt");

        let response = handler(request("GET", None, "/files")?).await?;
        assert_eq!(body_text(response).await?, "/files|/");

        Ok(())
    }

    #[tokio::test]
    async fn test_host_router() -> Result<(), Box<dyn Error>> {
        let mut router = NameVirtualHostRouter::new();
        router.add_host("Example.COM", reply("example"));
        router.set_default_handler(reply("default"));
        let handler = router.into_handler();

        let response = handler(request("GET", Some("example.com:8080"), "/")?).await?;
        assert_eq!(body_text(response).await?, "example");

        let response = handler(request("GET", Some("EXAMPLE.com"), "/")?).await?;
        assert_eq!(body_text(response).await?, "example");

        let response = handler(request("GET", Some("other.test"), "/")?).await?;
        assert_eq!(body_text(response).await?, "default");

        let response = handler(request("GET", None, "/")?).await?;
        assert_eq!(body_text(response).await?, "default");

        let response = handler(request("GET", None, "http://example.com/x")?).await?;
        assert_eq!(body_text(response).await?, "example");

        Ok(())
    }

    #[tokio::test]
    async fn test_wrapper_order() -> Result<(), Box<dyn Error>> {
        let calls = Arc::new(Mutex::new(Vec::new()));

        let recording = |name: &'static str, calls: Arc<Mutex<Vec<&'static str>>>| {
            wrapper_fn(move |inner: Handler| -> Handler {
                let calls = calls.clone();
                Arc::new(move |request: Request| {
                    calls
                        .lock()
                        .map(|mut calls| calls.push(name))
                        .ok();
                    inner(request)
                })
            })
        };

        let base_calls = calls.clone();
        let base = handler_fn(move |_request| {
            let calls = base_calls.clone();
            async move {
                calls
                    .lock()
                    .map(|mut calls| calls.push("base"))
                    .ok();
                Ok(Response::builder().text("done"))
            }
        });

        let mut registry = HostRegistry::new();
        registry
            .default_host_mut()
            .add_path_handler("/", base)
            .add_handler_wrapper(recording("w1", calls.clone()))
            .add_handler_wrapper(recording("w2", calls.clone()));

        let handler = build_handler_chain(&registry)?;
        let response = handler(request("GET", None, "/")?).await?;
        assert_eq!(body_text(response).await?, "done");

        let recorded = calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default();
        assert_eq!(recorded, vec!["w1", "w2", "base"]);

        Ok(())
    }

    #[tokio::test]
    async fn test_virtual_hosts() -> Result<(), Box<dyn Error>> {
        let mut registry = HostRegistry::new();
        registry
            .default_host_mut()
            .add_path_handler("/", reply("default root"));
        registry
            .add_virtual_host("api.example.com")
            .add_host_name("API.internal")
            .add_path_handler("/v1", reply("api v1"));

        let handler = build_handler_chain(&registry)?;

        let response = handler(request("GET", Some("api.example.com"), "/v1/users")?).await?;
        assert_eq!(body_text(response).await?, "api v1");

        let response = handler(request("GET", Some("api.internal:9000"), "/v1")?).await?;
        assert_eq!(body_text(response).await?, "api v1");

        let response = handler(request("GET", Some("unknown.example.com"), "/v1")?).await?;
        assert_eq!(body_text(response).await?, "default root");

        // No fallback to the default host's paths.
        let response = handler(request("GET", Some("api.example.com"), "/other")?).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        Ok(())
    }

    #[tokio::test]
    async fn test_host_default_handler() -> Result<(), Box<dyn Error>> {
        let mut registry = HostRegistry::new();
        registry
            .add_virtual_host("shop.test")
            .set_default_handler(reply("shop fallback"));

        let handler = build_handler_chain(&registry)?;

        let response = handler(request("GET", Some("shop.test"), "/anything")?).await?;
        assert_eq!(body_text(response).await?, "shop fallback");

        Ok(())
    }

    #[tokio::test]
    async fn test_last_registration_wins() -> Result<(), Box<dyn Error>> {
        let mut registry = HostRegistry::new();
        registry
            .default_host_mut()
            .add_path_handler("/page", reply("first"))
            .add_path_handler("/page", reply("second"));

        let handler = build_handler_chain(&registry)?;

        let response = handler(request("GET", None, "/page")?).await?;
        assert_eq!(body_text(response).await?, "second");

        let mut registry = HostRegistry::new();
        registry
            .default_host_mut()
            .add_path_handler("/api", reply("first"))
            .add_path_handler("/api/", reply("second"))
            .add_path_handler("/other", reply("other"))
            .add_path_handler("api", reply("third"));

        for _ in 0..16 {
            let handler = build_handler_chain(&registry)?;
            let response = handler(request("GET", None, "/api/users")?).await?;
            assert_eq!(body_text(response).await?, "third");
        }

        assert_eq!(
            registry
                .default_host()
                .path_handlers()
                .map(|(path, _)| path)
                .collect::<Vec<_>>(),
            vec!["/api", "/other"]
        );

        Ok(())
    }
}
