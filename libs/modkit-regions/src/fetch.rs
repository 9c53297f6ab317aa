//! Account topology fetch.
//!
//! [`TopologyFetcher`] is the seam the endpoint manager talks to;
//! [`HttpTopologyFetcher`] is the production implementation over hyper with
//! rustls (webpki roots, aws-lc-rs provider).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::ACCEPT;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use url::Url;

use crate::config::{FetchConfig, RegionsConfig};
use crate::error::FetchError;
use crate::topology::{AccountTopology, AccountTopologyDocument};

/// Longest error body kept in [`FetchError::HttpStatus`].
const BODY_PREVIEW_LIMIT: usize = 256;

/// Source of account topology documents.
#[async_trait]
pub trait TopologyFetcher: Send + Sync {
    /// Fetch the current topology through `endpoint`.
    ///
    /// # Errors
    /// Returns [`FetchError`] if the endpoint is unreachable or the document is invalid.
    async fn fetch_account_topology(&self, endpoint: &Url) -> Result<AccountTopology, FetchError>;
}

/// `GET {endpoint}{account_path}` decoded as an [`AccountTopologyDocument`].
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct HttpTopologyFetcher {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    default_endpoint: Url,
    config: FetchConfig,
}

impl std::fmt::Debug for HttpTopologyFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTopologyFetcher")
            .field("default_endpoint", &self.default_endpoint.as_str())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpTopologyFetcher {
    /// Build a fetcher for the account behind `config.default_endpoint`.
    ///
    /// # Errors
    /// Returns [`FetchError::Tls`] if the TLS connector cannot be initialised.
    pub fn new(config: &RegionsConfig) -> Result<Self, FetchError> {
        let fetch = config.fetch.clone();
        if fetch.allow_insecure_http {
            tracing::warn!(
                "insecure HTTP enabled for topology fetch; use only for testing with mock servers"
            );
        }

        let https = build_https_connector(fetch.allow_insecure_http)?;
        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_timer(TokioTimer::new());
        let client = builder.build::<_, Full<Bytes>>(https);

        Ok(Self {
            client,
            default_endpoint: config.default_endpoint.clone(),
            config: fetch,
        })
    }

    fn account_url(&self, endpoint: &Url) -> Result<Url, FetchError> {
        match endpoint.scheme() {
            "https" => {}
            "http" if self.config.allow_insecure_http => {}
            other => return Err(FetchError::InsecureScheme(other.to_owned())),
        }
        endpoint
            .join(&self.config.account_path)
            .map_err(|source| FetchError::InvalidUrl {
                url: format!("{endpoint}{}", self.config.account_path),
                source,
            })
    }
}

#[async_trait]
impl TopologyFetcher for HttpTopologyFetcher {
    async fn fetch_account_topology(&self, endpoint: &Url) -> Result<AccountTopology, FetchError> {
        let url = self.account_url(endpoint)?;
        let request = http::Request::get(url.as_str())
            .header(ACCEPT, "application/json")
            .body(Full::new(Bytes::new()))?;

        tracing::debug!(url = %url, "fetching account topology");

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, FetchError>((status, body))
        };
        let timeout = self.config.timeout;
        let (status, body) = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| FetchError::Timeout(timeout))??;

        if !status.is_success() {
            let preview = &body[..body.len().min(BODY_PREVIEW_LIMIT)];
            return Err(FetchError::HttpStatus {
                status,
                body_preview: String::from_utf8_lossy(preview).into_owned(),
            });
        }

        let document: AccountTopologyDocument = serde_json::from_slice(&body)?;
        document.into_topology(self.default_endpoint.clone())
    }
}

fn build_https_connector(allow_http: bool) -> Result<HttpsConnector<HttpConnector>, FetchError> {
    let provider = crypto_provider();
    let builder = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(provider)
        .map_err(|e| FetchError::Tls(Box::new(e)))?;
    let connector = if allow_http {
        builder.https_or_http().enable_all_versions().build()
    } else {
        builder.https_only().enable_all_versions().build()
    };
    Ok(connector)
}

/// Installed default provider if any, otherwise a fresh aws-lc-rs one. Never
/// installs a global default.
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn fetcher_for(server: &MockServer) -> (HttpTopologyFetcher, Url) {
        let endpoint = Url::parse(&server.url("/")).unwrap();
        let mut config = RegionsConfig::new(Url::parse("https://acct.example/").unwrap());
        config.fetch.allow_insecure_http = true;
        config.fetch.timeout = Duration::from_secs(2);
        (HttpTopologyFetcher::new(&config).unwrap(), endpoint)
    }

    fn topology_json() -> &'static str {
        r#"{
            "id": "acct",
            "writableLocations": [
                {"name": "West US", "databaseAccountEndpoint": "https://acct-westus.example/"}
            ],
            "readableLocations": [
                {"name": "West US", "databaseAccountEndpoint": "https://acct-westus.example/"},
                {"name": "East US", "databaseAccountEndpoint": "https://acct-eastus.example/"}
            ],
            "enableMultipleWriteLocations": false
        }"#
    }

    #[tokio::test]
    async fn fetches_and_decodes_topology() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/").header("accept", "application/json");
            then.status(200)
                .header("content-type", "application/json")
                .body(topology_json());
        });

        let (fetcher, endpoint) = fetcher_for(&server);
        let topology = fetcher.fetch_account_topology(&endpoint).await.unwrap();

        mock.assert();
        assert_eq!(topology.default_endpoint.as_str(), "https://acct.example/");
        assert_eq!(topology.readable.len(), 2);
        assert_eq!(topology.writable[0].region(), "West US");
        assert!(!topology.multiple_write_locations_enabled);
    }

    #[tokio::test]
    async fn custom_account_path_is_joined() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/account");
            then.status(200).body(topology_json());
        });

        let endpoint = Url::parse(&server.url("/")).unwrap();
        let mut config = RegionsConfig::new(Url::parse("https://acct.example/").unwrap());
        config.fetch.allow_insecure_http = true;
        config.fetch.account_path = "/account".to_owned();
        let fetcher = HttpTopologyFetcher::new(&config).unwrap();

        fetcher.fetch_account_topology(&endpoint).await.unwrap();
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn non_success_status_carries_body_preview() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/");
            then.status(503).body("region offline");
        });

        let (fetcher, endpoint) = fetcher_for(&server);
        let err = fetcher.fetch_account_topology(&endpoint).await.unwrap_err();
        match err {
            FetchError::HttpStatus {
                status,
                body_preview,
            } => {
                assert_eq!(status, http::StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body_preview, "region offline");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_document_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/");
            then.status(200).body("{not json");
        });

        let (fetcher, endpoint) = fetcher_for(&server);
        let err = fetcher.fetch_account_topology(&endpoint).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/");
            then.status(200)
                .delay(Duration::from_millis(500))
                .body(topology_json());
        });

        let endpoint = Url::parse(&server.url("/")).unwrap();
        let mut config = RegionsConfig::new(Url::parse("https://acct.example/").unwrap());
        config.fetch.allow_insecure_http = true;
        config.fetch.timeout = Duration::from_millis(50);
        let fetcher = HttpTopologyFetcher::new(&config).unwrap();

        let err = fetcher.fetch_account_topology(&endpoint).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[tokio::test]
    async fn plain_http_rejected_without_opt_in() {
        let config = RegionsConfig::new(Url::parse("https://acct.example/").unwrap());
        let fetcher = HttpTopologyFetcher::new(&config).unwrap();
        let err = fetcher
            .fetch_account_topology(&Url::parse("http://acct.example/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InsecureScheme(scheme) if scheme == "http"));
    }

    #[test]
    fn insecure_http_opt_in_logs_warning() {
        use std::sync::{Arc, Mutex};
        use tracing_subscriber::layer::SubscriberExt;

        #[derive(Clone, Default)]
        struct WarningCapture {
            warnings: Arc<Mutex<Vec<String>>>,
        }

        impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCapture {
            fn on_event(
                &self,
                event: &tracing::Event<'_>,
                _ctx: tracing_subscriber::layer::Context<'_, S>,
            ) {
                if *event.metadata().level() == tracing::Level::WARN {
                    let mut visitor = MessageVisitor(String::new());
                    event.record(&mut visitor);
                    self.warnings.lock().unwrap().push(visitor.0);
                }
            }
        }

        struct MessageVisitor(String);
        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }

        let capture = WarningCapture::default();
        let warnings = capture.warnings.clone();
        let subscriber = tracing_subscriber::registry().with(capture);

        let mut insecure = RegionsConfig::new(Url::parse("https://acct.example/").unwrap());
        insecure.fetch.allow_insecure_http = true;
        let secure = RegionsConfig::new(Url::parse("https://acct.example/").unwrap());

        tracing::subscriber::with_default(subscriber, || {
            _ = HttpTopologyFetcher::new(&secure).unwrap();
            assert!(warnings.lock().unwrap().is_empty());
            _ = HttpTopologyFetcher::new(&insecure).unwrap();
        });

        let captured = warnings.lock().unwrap();
        assert_eq!(captured.len(), 1, "{:?}", *captured);
        assert!(captured[0].contains("insecure HTTP"));
    }
}
