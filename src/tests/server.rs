mod server_tests {
    use std::error::Error;

    use futures_util::future::BoxFuture;
    use http::{header::TRANSFER_ENCODING, HeaderValue};
    use http_body_util::BodyExt;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use crate::{
        config::{ListenerProtocol, ServerConfigBuilder},
        errors::PorticoError,
        server::{
            buffer_pool::BufferPool,
            conn::{CodecFactory, Connection, OpenListener},
            virtual_host::{handler_fn, not_found_handler, Handler},
        },
        tests::{exchange, http_get},
        Portico, PorticoBody, PorticoBodyExt, Request, Response,
    };

    fn local_builder() -> ServerConfigBuilder {
        let mut builder = Portico::builder();
        builder
            .set_io_threads(2)
            .set_worker_threads(4);
        builder
    }

    #[tokio::test]
    async fn test_http_round_trip() -> Result<(), Box<dyn Error>> {
        let mut builder = local_builder();
        builder
            .add_listener(0, "127.0.0.1")
            .add_path_handler(
                "/hello",
                handler_fn(|request| async move {
                    let peer = request
                        .peer_addr()
                        .map(|addr| addr.ip().to_string())
                        .unwrap_or_default();
                    Ok(Response::builder().text(&format!("Hello {}", peer)))
                }),
            );
        builder
            .add_virtual_host("api.localhost")
            .add_path_handler(
                "/v1",
                handler_fn(|_request| async move { Ok(Response::builder().text("api v1")) }),
            );

        let server = builder.build()?;
        server.start()?;
        let addr = server.listening_addresses()[0];

        let response = http_get(addr, "localhost", "/hello").await?;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response
            .to_ascii_lowercase()
            .contains("content-length: 15"));
        assert!(response.ends_with("Hello 127.0.0.1"));

        let response = http_get(addr, "API.localhost", "/v1/items").await?;
        assert!(response.ends_with("api v1"));

        let response = http_get(addr, "api.localhost", "/hello").await?;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
        assert!(response.contains("404 - Not Found"));

        server.stop()?;

        Ok(())
    }

    #[tokio::test]
    async fn test_pipelined_requests() -> Result<(), Box<dyn Error>> {
        let mut builder = local_builder();
        builder
            .add_listener(0, "127.0.0.1")
            .set_default_handler(handler_fn(|request| async move {
                Ok(Response::builder().text(request.uri().path()))
            }));

        let server = builder.build()?;
        server.start()?;
        let addr = server.listening_addresses()[0];

        let stream = TcpStream::connect(addr).await?;
        let response = exchange(
            stream,
            "GET /one HTTP/1.1\r\nHost: localhost\r\n\r\nGET /two HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await?;

        assert_eq!(
            response
                .matches("HTTP/1.1 200 OK")
                .count(),
            2
        );
        let one = response
            .find("/one")
            .unwrap_or(usize::MAX);
        let two = response
            .find("/two")
            .unwrap_or(0);
        assert!(one < two);

        server.stop()?;

        Ok(())
    }

    #[tokio::test]
    async fn test_form_post() -> Result<(), Box<dyn Error>> {
        let mut builder = local_builder();
        builder
            .add_listener(0, "127.0.0.1")
            .add_path_handler(
                "/form",
                handler_fn(|request| async move {
                    let name = request
                        .form_data()
                        .and_then(|form| form.get("name"))
                        .unwrap_or("missing")
                        .to_string();
                    Ok(Response::builder().text(&name))
                }),
            );

        let server = builder.build()?;
        server.start()?;
        let addr = server.listening_addresses()[0];

        let stream = TcpStream::connect(addr).await?;
        let response = exchange(
            stream,
            "POST /form HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 12\r\nConnection: close\r\n\r\nname=portico",
        )
        .await?;
        assert!(response.ends_with("portico"));

        server.stop()?;

        Ok(())
    }

    struct LineCodec {
        root: Handler,
    }

    impl OpenListener for LineCodec {
        fn set_root_handler(&mut self, handler: Handler) {
            self.root = handler;
        }

        fn handle_connection(&self, connection: Connection) -> BoxFuture<'static, Result<(), PorticoError>> {
            let root = self
                .root
                .clone();
            Box::pin(async move {
                let codec_error = |e: std::io::Error| PorticoError::Codec(e.to_string());
                let (mut io, _info) = connection.into_parts();

                let mut line = Vec::new();
                let mut byte = [0u8; 1];
                while io
                    .read(&mut byte)
                    .await
                    .map_err(codec_error)?
                    == 1
                    && byte[0] != b'\n'
                {
                    line.push(byte[0]);
                }

                let path = String::from_utf8_lossy(&line)
                    .trim()
                    .to_string();
                let request = http::Request::builder()
                    .uri(path)
                    .body(PorticoBody::empty())
                    .map_err(|e| PorticoError::Codec(e.to_string()))?;

                let response = root(Request::from(request)).await?;
                let framed = response
                    .headers()
                    .contains_key(TRANSFER_ENCODING);
                let body = response
                    .into_inner()
                    .into_body()
                    .collect()
                    .await
                    .map_err(|e| PorticoError::Codec(e.to_string()))?
                    .to_bytes();

                io.write_all(format!("{} ", framed).as_bytes())
                    .await
                    .map_err(codec_error)?;
                io.write_all(&body)
                    .await
                    .map_err(codec_error)?;
                io.shutdown()
                    .await
                    .map_err(codec_error)
            })
        }
    }

    struct LineCodecFactory;

    impl CodecFactory for LineCodecFactory {
        fn create(&self, _pool: BufferPool, _buffer_size: usize) -> Box<dyn OpenListener> {
            Box::new(LineCodec { root: not_found_handler() })
        }
    }

    #[tokio::test]
    async fn test_ajp_listener_with_registered_codec() -> Result<(), Box<dyn Error>> {
        let mut builder = local_builder();
        builder
            .add_ajp_listener(0, "127.0.0.1")
            .register_codec(ListenerProtocol::Ajp, LineCodecFactory)
            .add_path_handler(
                "/app",
                handler_fn(|_request| async move {
                    Ok(Response::builder()
                        .header(TRANSFER_ENCODING, HeaderValue::from_static("chunked"))
                        .text("from ajp"))
                }),
            );

        let server = builder.build()?;
        server.start()?;
        let addr = server.listening_addresses()[0];

        let stream = TcpStream::connect(addr).await?;
        let response = exchange(stream, "/app/index\n").await?;

        // Framing headers reach the codec untouched.
        assert_eq!(response, "true from ajp");

        server.stop()?;

        Ok(())
    }

    #[tokio::test]
    async fn test_http_and_ajp_share_handlers() -> Result<(), Box<dyn Error>> {
        let mut builder = local_builder();
        builder
            .add_listener(0, "127.0.0.1")
            .add_ajp_listener(0, "127.0.0.1")
            .register_codec(ListenerProtocol::Ajp, LineCodecFactory)
            .set_default_handler(handler_fn(|_request| async move {
                Ok(Response::builder().text("shared"))
            }));

        let server = builder.build()?;
        server.start()?;
        let addresses = server.listening_addresses();
        assert_eq!(addresses.len(), 2);

        let response = http_get(addresses[0], "localhost", "/").await?;
        assert!(response.ends_with("shared"));

        let stream = TcpStream::connect(addresses[1]).await?;
        let response = exchange(stream, "/\n").await?;
        assert_eq!(response, "false shared");

        server.stop()?;

        Ok(())
    }

    #[cfg(feature = "tokio-rust-tls")]
    mod https {
        use std::{error::Error, sync::Arc};

        use rcgen::{
            BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose,
            IsCa, KeyPair, KeyUsagePurpose,
        };
        use tokio::net::TcpStream;
        use tokio_rustls::{
            rustls::{
                self,
                pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
                ClientConfig, RootCertStore,
            },
            TlsConnector,
        };

        use crate::{
            config::{ClientAuth, SecurityConfig},
            server::virtual_host::handler_fn,
            tests::exchange,
            Portico, Response,
        };

        struct Pki {
            ca: Certificate,
            server: Certificate,
            server_key: KeyPair,
            client: Certificate,
            client_key: KeyPair,
        }

        fn pki() -> Result<Pki, Box<dyn Error>> {
            let ca_key = KeyPair::generate()?;
            let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
            ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            ca_params
                .distinguished_name
                .push(DnType::CommonName, "Portico Test CA");
            ca_params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
            let ca = ca_params.self_signed(&ca_key)?;

            let server_key = KeyPair::generate()?;
            let mut server_params = CertificateParams::new(vec!["localhost".to_string()])?;
            server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
            let server = server_params.signed_by(&server_key, &ca, &ca_key)?;

            let client_key = KeyPair::generate()?;
            let mut client_params = CertificateParams::new(Vec::<String>::new())?;
            client_params
                .distinguished_name
                .push(DnType::CommonName, "portico-client");
            client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
            let client = client_params.signed_by(&client_key, &ca, &ca_key)?;

            Ok(Pki { ca, server, server_key, client, client_key })
        }

        fn connector(pki: &Pki, with_client_cert: bool) -> Result<TlsConnector, Box<dyn Error>> {
            let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

            let mut roots = RootCertStore::empty();
            roots.add(
                pki.ca
                    .der()
                    .clone(),
            )?;

            let builder = ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()?
                .with_root_certificates(roots);

            let config = if with_client_cert {
                let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                    pki.client_key
                        .serialize_der(),
                ));
                builder.with_client_auth_cert(
                    vec![pki
                        .client
                        .der()
                        .clone()],
                    key,
                )?
            } else {
                builder.with_no_client_auth()
            };

            Ok(TlsConnector::from(Arc::new(config)))
        }

        fn https_server(pki: &Pki, client_auth: ClientAuth) -> Result<Portico, Box<dyn Error>> {
            let security = SecurityConfig::builder()
                .cert_from_bytes(
                    pki.server
                        .pem()
                        .into_bytes(),
                )
                .key_from_bytes(
                    pki.server_key
                        .serialize_pem()
                        .into_bytes(),
                )
                .ca_cert_from_bytes(
                    pki.ca
                        .der()
                        .to_vec(),
                )
                .client_auth(client_auth)
                .build()?;

            let mut builder = Portico::builder();
            builder
                .set_io_threads(2)
                .set_worker_threads(4)
                .add_https_listener(0, "127.0.0.1", security)
                .add_path_handler(
                    "/whoami",
                    handler_fn(|request| async move {
                        let session = request.ssl_session();
                        let subject = session
                            .as_ref()
                            .and_then(|session| {
                                session
                                    .peer_certificate_chain()
                                    .ok()
                            })
                            .and_then(|chain| {
                                chain
                                    .first()
                                    .map(|certificate| certificate.subject().to_string())
                            })
                            .unwrap_or_else(|| "anonymous".to_string());
                        let id_len = session
                            .map(|session| {
                                session
                                    .session_id()
                                    .len()
                            })
                            .unwrap_or_default();
                        Ok(Response::builder().text(&format!("{} {}", subject, id_len)))
                    }),
                );

            Ok(builder.build()?)
        }

        const WHOAMI: &str = "GET /whoami HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";

        #[tokio::test]
        async fn test_https_client_certificate() -> Result<(), Box<dyn Error>> {
            let pki = pki()?;
            let server = https_server(&pki, ClientAuth::Required)?;
            server.start()?;
            let addr = server.listening_addresses()[0];

            let stream = TcpStream::connect(addr).await?;
            let tls = connector(&pki, true)?
                .connect(ServerName::try_from("localhost")?, stream)
                .await?;
            let response = exchange(tls, WHOAMI).await?;

            assert!(response.starts_with("HTTP/1.1 200 OK"));
            assert!(response.ends_with("CN=portico-client 32"));

            server.stop()?;

            Ok(())
        }

        #[tokio::test]
        async fn test_https_without_client_certificate() -> Result<(), Box<dyn Error>> {
            let pki = pki()?;
            let server = https_server(&pki, ClientAuth::Requested)?;
            server.start()?;
            let addr = server.listening_addresses()[0];

            let stream = TcpStream::connect(addr).await?;
            let tls = connector(&pki, false)?
                .connect(ServerName::try_from("localhost")?, stream)
                .await?;
            let response = exchange(tls, WHOAMI).await?;

            assert!(response.ends_with("anonymous 32"));

            server.stop()?;

            Ok(())
        }
    }
}
