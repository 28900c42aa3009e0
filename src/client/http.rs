/*!
HTTP transport based on `hyper` and `tokio`.

Each endpoint keeps a single HTTP1 connection open, re-establishing it whenever a request fails.
*/

use std::{
    convert::Infallible,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use http::{Method, Request};
use hyper::{
    body::{self, Body, Frame, SizeHint},
    client::conn::http1,
};

use crate::{
    client::{BatchClient, BatchResponse},
    data::EncodedPayload,
    internal_metrics::InternalMetrics,
    Error,
};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

async fn connect(metrics: &InternalMetrics, uri: &HttpUri) -> Result<HttpSender, Error> {
    let io = tokio::net::TcpStream::connect((uri.host(), uri.port()))
        .await
        .map_err(|e| {
            metrics.transport_conn_failed.increment();

            Error::new("failed to connect TCP stream", e)
        })?;

    metrics.transport_conn_established.increment();

    if uri.is_https() {
        #[cfg(feature = "tls")]
        {
            let io = tls_handshake(metrics, io, uri).await?;

            http_handshake(metrics, io).await
        }
        #[cfg(not(feature = "tls"))]
        {
            return Err(Error::msg("https support requires the `tls` Cargo feature"));
        }
    } else {
        http_handshake(metrics, io).await
    }
}

/*
TLS using the native platform
*/
#[cfg(all(feature = "tls", feature = "tls-native"))]
async fn tls_handshake(
    metrics: &InternalMetrics,
    io: tokio::net::TcpStream,
    uri: &HttpUri,
) -> Result<impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Sync + Unpin + 'static, Error>
{
    use tokio_native_tls::{native_tls, TlsConnector};

    let connector = TlsConnector::from(native_tls::TlsConnector::new().map_err(|e| {
        metrics.transport_conn_tls_failed.increment();

        Error::new("failed to create TLS connector", e)
    })?);

    let io = connector.connect(uri.host(), io).await.map_err(|e| {
        metrics.transport_conn_tls_failed.increment();

        Error::new("failed to perform TLS handshake", e)
    })?;

    metrics.transport_conn_tls_handshake.increment();

    Ok(io)
}

/*
TLS using `rustls`
*/
#[cfg(all(feature = "tls", not(feature = "tls-native")))]
async fn tls_handshake(
    metrics: &InternalMetrics,
    io: tokio::net::TcpStream,
    uri: &HttpUri,
) -> Result<impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Sync + Unpin + 'static, Error>
{
    use tokio_rustls::{rustls, TlsConnector};

    let domain = rustls::pki_types::ServerName::try_from(uri.host().to_owned()).map_err(|e| {
        metrics.transport_conn_tls_failed.increment();

        Error::new(format_args!("could not extract a DNS name from {uri}"), e)
    })?;

    let tls = {
        let mut root_store = rustls::RootCertStore::empty();

        let certs = rustls_native_certs::load_native_certs();

        if !certs.errors.is_empty() {
            metrics.transport_conn_tls_failed.increment();

            for err in certs.errors {
                emit::warn!(rt: emit::runtime::internal(), "failed to load native certificate: {err}");
            }
        }

        for cert in certs.certs {
            let _ = root_store.add(cert);
        }

        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        )
    };

    let conn = TlsConnector::from(tls);

    let io = conn.connect(domain, io).await.map_err(|e| {
        metrics.transport_conn_tls_failed.increment();

        Error::new("failed to connect TLS stream", e)
    })?;

    metrics.transport_conn_tls_handshake.increment();

    Ok(io)
}

async fn http_handshake(
    metrics: &InternalMetrics,
    io: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Sync + Unpin + 'static,
) -> Result<HttpSender, Error> {
    let (sender, conn) = http1::handshake(HttpIo(io)).await.map_err(|e| {
        metrics.transport_conn_failed.increment();

        Error::new("failed to perform HTTP1 handshake", e)
    })?;

    tokio::task::spawn(async move {
        let _ = conn.await;
    });

    Ok(sender)
}

type HttpSender = http1::SendRequest<HttpContent>;

/**
A parsed `http` or `https` endpoint.
*/
#[derive(Debug, Clone)]
pub(crate) struct HttpUri(hyper::Uri);

impl fmt::Display for HttpUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl HttpUri {
    pub fn new(uri: &str) -> Result<Self, Error> {
        let uri: hyper::Uri = uri
            .parse()
            .map_err(|e| Error::new(format_args!("failed to parse {uri}"), e))?;

        match uri.scheme_str() {
            Some("http") | Some("https") => (),
            _ => {
                return Err(Error::msg(format_args!(
                    "{uri} must use the `http` or `https` scheme"
                )))
            }
        }

        if uri.host().map(|host| host.is_empty()).unwrap_or(true) {
            return Err(Error::msg(format_args!("{uri} is missing a host")));
        }

        Ok(HttpUri(uri))
    }

    pub fn is_https(&self) -> bool {
        self.0.scheme_str() == Some("https")
    }

    pub fn host(&self) -> &str {
        self.0.host().unwrap_or("")
    }

    pub fn port(&self) -> u16 {
        self.0
            .port_u16()
            .unwrap_or_else(|| if self.is_https() { 443 } else { 80 })
    }

    pub fn authority(&self) -> &str {
        self.0
            .authority()
            .map(|authority| authority.as_str())
            .unwrap_or("")
    }
}

/**
A request body, compressed if the connection allows it.
*/
pub(crate) struct HttpContent {
    content_encoding: Option<&'static str>,
    payload: Option<Bytes>,
}

impl HttpContent {
    fn new(
        allow_compression: bool,
        metrics: &InternalMetrics,
        payload: EncodedPayload,
    ) -> Result<Self, Error> {
        #[cfg(feature = "gzip")]
        {
            if allow_compression {
                return Self::gzip(payload).map_err(|e| {
                    metrics.transport_request_compress_failed.increment();

                    e
                });
            }
        }
        #[cfg(not(feature = "gzip"))]
        {
            let _ = (allow_compression, metrics);
        }

        Ok(Self::raw(payload))
    }

    fn raw(payload: EncodedPayload) -> Self {
        HttpContent {
            content_encoding: None,
            payload: Some(Bytes::from(payload.into_bytes())),
        }
    }

    #[cfg(feature = "gzip")]
    fn gzip(payload: EncodedPayload) -> Result<Self, Error> {
        use std::io::Write as _;

        let mut enc = flate2::write::GzEncoder::new(
            Vec::with_capacity(payload.len()),
            flate2::Compression::fast(),
        );

        enc.write_all(payload.as_bytes())
            .map_err(|e| Error::new("failed to compress a chunk of bytes", e))?;

        let buf = enc
            .finish()
            .map_err(|e| Error::new("failed to finalize compression", e))?;

        Ok(HttpContent {
            content_encoding: Some("gzip"),
            payload: Some(Bytes::from(buf)),
        })
    }

    fn content_len(&self) -> usize {
        self.payload
            .as_ref()
            .map(|payload| payload.len())
            .unwrap_or(0)
    }
}

impl Body for HttpContent {
    type Data = Bytes;

    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(self.get_mut().payload.take().map(|payload| Ok(Frame::data(payload))))
    }

    fn is_end_stream(&self) -> bool {
        self.payload.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.content_len() as u64)
    }
}

/**
A connection to one of New Relic's ingest APIs.
*/
pub(crate) struct HttpConnection {
    metrics: Arc<InternalMetrics>,
    uri: HttpUri,
    allow_compression: bool,
    timeout: Duration,
    headers: Vec<(String, String)>,
    sender: Mutex<Option<HttpSender>>,
}

impl HttpConnection {
    pub fn new(
        metrics: Arc<InternalMetrics>,
        url: impl AsRef<str>,
        allow_compression: bool,
        timeout: Duration,
        headers: impl Into<Vec<(String, String)>>,
    ) -> Result<Self, Error> {
        Ok(HttpConnection {
            uri: HttpUri::new(url.as_ref())?,
            allow_compression,
            timeout,
            headers: headers.into(),
            sender: Mutex::new(None),
            metrics,
        })
    }

    fn poison(&self) -> Option<HttpSender> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .filter(|sender| !sender.is_closed())
    }

    fn unpoison(&self, sender: HttpSender) {
        *self.sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
    }

    pub async fn send(&self, payload: EncodedPayload) -> Result<BatchResponse, Error> {
        tokio::time::timeout(self.timeout, async {
            let mut sender = match self.poison() {
                Some(sender) => sender,
                None => connect(&self.metrics, &self.uri).await?,
            };

            let content = HttpContent::new(self.allow_compression, &self.metrics, payload)?;

            let req = self.request(content)?;

            let mut res = sender.send_request(req).await.map_err(|e| {
                self.metrics.transport_request_failed.increment();

                Error::new("failed to send HTTP request", e)
            })?;

            self.metrics.transport_request_sent.increment();

            let status = res.status().as_u16();

            // The body needs to be read before the connection can be reused
            drain(res.body_mut()).await?;

            self.unpoison(sender);

            Ok::<BatchResponse, Error>(BatchResponse::new(status))
        })
        .await
        .map_err(|e| Error::new("failed to send request within its timeout", e))?
    }

    fn request(&self, content: HttpContent) -> Result<Request<HttpContent>, Error> {
        let mut req = Request::builder()
            .uri(&self.uri.0)
            .method(Method::POST)
            .header("host", self.uri.authority())
            .header("user-agent", USER_AGENT)
            .header("content-type", "application/json");

        if let Some(content_encoding) = content.content_encoding {
            req = req.header("content-encoding", content_encoding);
        }

        for (k, v) in &self.headers {
            req = req.header(&**k, &**v);
        }

        req.body(content).map_err(|e| {
            self.metrics.transport_request_failed.increment();

            Error::new("failed to build HTTP request", e)
        })
    }
}

impl BatchClient for HttpConnection {
    fn send_batch(
        &self,
        payload: EncodedPayload,
    ) -> impl Future<Output = Result<BatchResponse, Error>> + Send {
        self.send(payload)
    }
}

async fn drain(body: &mut body::Incoming) -> Result<(), Error> {
    while let Some(frame) =
        std::future::poll_fn(|cx| Pin::new(&mut *body).poll_frame(cx)).await
    {
        frame.map_err(|e| Error::new("failed to read HTTP response body", e))?;
    }

    Ok(())
}

struct HttpIo<T>(T);

impl<T: tokio::io::AsyncRead> hyper::rt::Read for HttpIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        // SAFETY: `io` inherits the pinning requirements of `self`
        let io = unsafe { self.map_unchecked_mut(|io| &mut io.0) };

        // SAFETY: `io` does not uninitialize any bytes
        let mut read_buf = tokio::io::ReadBuf::uninit(unsafe { buf.as_mut() });

        match tokio::io::AsyncRead::poll_read(io, cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let read = read_buf.filled().len();

                // SAFETY: The bytes being advanced have been initialized by `read_buf`
                unsafe { buf.advance(read) };

                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: tokio::io::AsyncWrite> hyper::rt::Write for HttpIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        // SAFETY: `io` inherits the pinning requirements of `self`
        let io = unsafe { self.map_unchecked_mut(|io| &mut io.0) };

        tokio::io::AsyncWrite::poll_write(io, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        // SAFETY: `io` inherits the pinning requirements of `self`
        let io = unsafe { self.map_unchecked_mut(|io| &mut io.0) };

        tokio::io::AsyncWrite::poll_flush(io, cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        // SAFETY: `io` inherits the pinning requirements of `self`
        let io = unsafe { self.map_unchecked_mut(|io| &mut io.0) };

        tokio::io::AsyncWrite::poll_shutdown(io, cx)
    }
}
