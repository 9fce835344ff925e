use futures_util::future::BoxFuture;

use crate::error::Error;
use crate::request::Request;
use crate::response::{Response, StreamingResponse};

/// Sends one request and buffers the whole response. Called once per attempt;
/// retries, timeouts and admission control live above it.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, Error>>;
}

/// Sends one request and hands back the body as it arrives.
pub trait StreamingTransport: Send + Sync {
    fn send_streaming<'a>(
        &'a self,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<StreamingResponse, Error>>;
}

#[cfg(feature = "hyper-transport")]
pub use self::hyper_transport::{HyperTransport, HyperTransportOptions};

#[cfg(feature = "hyper-transport")]
mod hyper_transport {
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::StreamExt;
    use futures_util::future::BoxFuture;
    use http::Uri;
    use http_body_util::{BodyDataStream, BodyExt, Full};
    use hyper::body::Incoming;
    use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
    use hyper_util::client::legacy::Client;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::rt::TokioExecutor;
    use tracing::debug;

    use super::{StreamingTransport, Transport};
    use crate::error::Error;
    use crate::request::Request;
    use crate::response::{Response, StreamingResponse};
    use crate::util::redact_uri_for_logs;

    type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

    #[derive(Clone, Debug)]
    pub struct HyperTransportOptions {
        pub pool_idle_timeout: Duration,
        pub pool_max_idle_per_host: usize,
        pub http2_only: bool,
    }

    impl Default for HyperTransportOptions {
        fn default() -> Self {
            Self {
                pool_idle_timeout: Duration::from_secs(90),
                pool_max_idle_per_host: 8,
                http2_only: false,
            }
        }
    }

    /// HTTP/1.1 and HTTP/2 over rustls (ring provider, webpki roots).
    #[derive(Clone, Debug)]
    pub struct HyperTransport {
        client: HttpsClient,
    }

    impl HyperTransport {
        pub fn new() -> Result<Self, Error> {
            Self::with_options(HyperTransportOptions::default())
        }

        pub fn with_options(options: HyperTransportOptions) -> Result<Self, Error> {
            let https = HttpsConnectorBuilder::new()
                .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
                .map_err(|source| Error::TlsBackendInit {
                    message: source.to_string(),
                })?
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build();
            let client = Client::builder(TokioExecutor::new())
                .pool_idle_timeout(options.pool_idle_timeout)
                .pool_max_idle_per_host(options.pool_max_idle_per_host)
                .http2_only(options.http2_only)
                .build(https);
            Ok(Self { client })
        }

        async fn dispatch(&self, request: &Request) -> Result<http::Response<Incoming>, Error> {
            let uri: Uri = request.url().parse().map_err(|_| Error::InvalidUri {
                uri: redact_uri_for_logs(request.url()),
            })?;
            let mut builder = http::Request::builder()
                .method(request.method().clone())
                .uri(uri);
            for (name, value) in request.headers() {
                builder = builder.header(name, value);
            }
            let http_request = builder
                .body(Full::new(request.body().clone()))
                .map_err(|source| Error::Internal {
                    message: format!("failed to build http request: {source}"),
                })?;

            debug!(
                method = %request.method(),
                uri = %redact_uri_for_logs(request.url()),
                body_bytes = request.body().len(),
                "sending http request"
            );
            self.client
                .request(http_request)
                .await
                .map_err(|source| Error::Connection {
                    method: request.method().clone(),
                    uri: redact_uri_for_logs(request.url()),
                    source: Box::new(source),
                })
        }
    }

    impl Transport for HyperTransport {
        fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, Error>> {
            Box::pin(async move {
                let (parts, body) = self.dispatch(request).await?.into_parts();
                let body = body
                    .collect()
                    .await
                    .map_err(|source| Error::ReadBody {
                        source: Box::new(source),
                    })?
                    .to_bytes();
                Ok(Response::new(parts.status, parts.headers, body))
            })
        }
    }

    impl StreamingTransport for HyperTransport {
        fn send_streaming<'a>(
            &'a self,
            request: &'a Request,
        ) -> BoxFuture<'a, Result<StreamingResponse, Error>> {
            Box::pin(async move {
                let (parts, body) = self.dispatch(request).await?.into_parts();
                let chunks = BodyDataStream::new(body)
                    .map(|chunk| {
                        chunk.map_err(|source| Error::ReadBody {
                            source: Box::new(source),
                        })
                    })
                    .boxed();
                Ok(StreamingResponse::new(parts.status, parts.headers, chunks))
            })
        }
    }
}
