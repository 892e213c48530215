use std::convert::Infallible;

use futures_util::future::BoxFuture;
use http::StatusCode;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use log::error;

use crate::{
    errors::PorticoError,
    server::{
        buffer_pool::{BufferPool, PooledIo},
        conn::{CodecFactory, Connection, OpenListener},
        handlers::error_response,
        virtual_host::{not_found_handler, Handler},
    },
    Request,
};

/// HTTP/1.1 codec backed by hyper.
///
/// Connections are read through one pooled buffer each. Pipelined responses
/// are flushed together, and with corking on, response head and body are
/// coalesced into a single write.
pub struct HttpOpenListener {
    pool: BufferPool,
    cork: bool,
    root_handler: Handler,
}

impl HttpOpenListener {
    pub fn new(pool: BufferPool) -> Self {
        Self { pool, cork: true, root_handler: not_found_handler() }
    }

    pub fn with_cork(mut self, cork: bool) -> Self {
        self.cork = cork;
        self
    }
}

impl OpenListener for HttpOpenListener {
    fn set_root_handler(&mut self, handler: Handler) {
        self.root_handler = handler;
    }

    fn handle_connection(&self, connection: Connection) -> BoxFuture<'static, Result<(), PorticoError>> {
        let handler = self
            .root_handler
            .clone();
        let buffer = self
            .pool
            .allocate();
        let cork = self.cork;

        Box::pin(async move {
            let (io, info) = connection.into_parts();
            let peer_addr = info.peer_addr();
            let io = TokioIo::new(PooledIo::new(io, buffer));

            let service = service_fn(move |req: http::Request<Incoming>| {
                let handler = handler.clone();
                let info = info.clone();
                async move {
                    let mut request = Request::from_http(req);
                    request
                        .extensions_mut()
                        .insert(info);

                    let response = match handler(request).await {
                        Ok(response) => response,
                        Err(e) => {
                            error!("Unhandled request failure: {}", e);
                            error_response(StatusCode::INTERNAL_SERVER_ERROR)
                        }
                    };

                    Ok::<_, Infallible>(response.into_inner())
                }
            });

            let mut builder = http1::Builder::new();
            builder
                .pipeline_flush(true)
                .writev(!cork);

            builder
                .serve_connection(io, service)
                .await
                .map_err(|e| PorticoError::Codec(format!("{}: {}", peer_addr, e)))
        })
    }
}

/// Factory for [`HttpOpenListener`]s, used by HTTP and HTTPS listeners unless
/// another codec is registered.
#[derive(Clone, Debug)]
pub struct HttpCodecFactory {
    cork: bool,
}

impl HttpCodecFactory {
    pub fn new() -> Self {
        Self { cork: true }
    }

    pub fn with_cork(mut self, cork: bool) -> Self {
        self.cork = cork;
        self
    }
}

impl Default for HttpCodecFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecFactory for HttpCodecFactory {
    /// Pooled buffers already carry the configured size.
    fn create(&self, pool: BufferPool, _buffer_size: usize) -> Box<dyn OpenListener> {
        Box::new(HttpOpenListener::new(pool).with_cork(self.cork))
    }
}
