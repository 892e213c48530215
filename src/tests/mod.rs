mod handlers;
mod routing;
mod server;

use std::{error::Error, net::SocketAddr};

use http_body_util::BodyExt;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::{PorticoBody, PorticoBodyExt, Request, Response};

pub(crate) fn request(method: &str, host: Option<&str>, uri: &str) -> Result<Request, Box<dyn Error>> {
    let mut builder = http::Request::builder()
        .method(method)
        .uri(uri);
    if let Some(host) = host {
        builder = builder.header(http::header::HOST, host);
    }
    Ok(Request::from(builder.body(PorticoBody::empty())?))
}

pub(crate) async fn body_text(response: Response) -> Result<String, Box<dyn Error>> {
    let bytes = response
        .into_inner()
        .into_body()
        .collect()
        .await
        .map_err(|e| e as Box<dyn Error>)?
        .to_bytes();
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Sends `request` and reads until the server closes the connection.
pub(crate) async fn exchange<S>(mut stream: S, request: &str) -> Result<String, Box<dyn Error>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(request.as_bytes())
        .await?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream
            .read(&mut chunk)
            .await
        {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&chunk[..n]),
            Err(e) if !response.is_empty() => {
                log::debug!("Read ended with {}", e);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(String::from_utf8_lossy(&response).into_owned())
}

pub(crate) async fn http_get(addr: SocketAddr, host: &str, path: &str) -> Result<String, Box<dyn Error>> {
    let stream = TcpStream::connect(addr).await?;
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, host);
    exchange(stream, &request).await
}
