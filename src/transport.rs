//! The seam between virtual users and the protocol that carries their requests.
//!
//! Stampede never speaks HTTP itself: every [`Action`](../workload/struct.Action.html)
//! is handed to a [`Transport`], which returns the response status, how long the
//! exchange took, and the response body. [`ReqwestTransport`] is the default
//! implementation, built on [`reqwest`](https://docs.rs/reqwest/). Tests and
//! alternative protocols provide their own implementation of the trait.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{fmt, time};
use url::Url;

use crate::workload::Method;
use crate::StampedeError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// What a [`Transport`] observed while performing one request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The status code returned by the server.
    pub status: u16,
    /// How long the exchange took, as measured by the transport.
    pub latency: time::Duration,
    /// The response body.
    pub body: String,
}
impl Response {
    /// Convenience constructor for a response without a body.
    pub fn new(status: u16, latency: time::Duration) -> Self {
        Response {
            status,
            latency,
            body: String::new(),
        }
    }

    /// Attach a body to the response.
    pub fn set_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }
}

/// A request could not be completed: connection refused, timeout, malformed
/// response, and so on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportError {
    /// Human readable description of what went wrong.
    pub detail: String,
}
impl TransportError {
    pub fn new(detail: &str) -> Self {
        TransportError {
            detail: detail.to_string(),
        }
    }
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "transport error: {}", self.detail)
    }
}
impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> TransportError {
        TransportError::new(&err.to_string())
    }
}

/// Performs one request on behalf of a virtual user.
///
/// Implementations are shared by every virtual user in a load test, so they must
/// be `Send + Sync` and should be cheap to call concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue `method` against `url` and report what happened.
    async fn execute(&self, method: Method, url: &Url) -> Result<Response, TransportError>;
}

/// The default [`Transport`], backed by a single pooled [`reqwest::Client`].
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: Client,
}
impl ReqwestTransport {
    /// Build a transport with no request timeout.
    pub fn new() -> Result<Self, StampedeError> {
        ReqwestTransport::with_timeout(None)
    }

    /// Build a transport that gives up on requests after `timeout`.
    pub fn with_timeout(timeout: Option<time::Duration>) -> Result<Self, StampedeError> {
        let mut builder = Client::builder().user_agent(APP_USER_AGENT).gzip(true);
        if let Some(timeout) = timeout {
            trace!("request timeout set to {:?}", timeout);
            builder = builder.timeout(timeout);
        }
        Ok(ReqwestTransport {
            client: builder.build()?,
        })
    }

    /// Wrap an already configured client.
    pub fn from_client(client: Client) -> Self {
        ReqwestTransport { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, method: Method, url: &Url) -> Result<Response, TransportError> {
        let started = time::Instant::now();
        let response = self
            .client
            .request(method.into(), url.clone())
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(Response {
            status,
            latency: started.elapsed(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, Method::POST, MockServer};

    #[tokio::test]
    async fn reqwest_transport_reports_status_and_body() {
        let server = MockServer::start();
        let index = server.mock(|when, then| {
            when.method(GET).path("/");
            then.status(200).body("welcome");
        });
        let missing = server.mock(|when, then| {
            when.method(POST).path("/missing");
            then.status(404);
        });

        let transport = ReqwestTransport::new().unwrap();

        let url = Url::parse(&server.url("/")).unwrap();
        let response = transport.execute(Method::Get, &url).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "welcome");

        let url = Url::parse(&server.url("/missing")).unwrap();
        let response = transport.execute(Method::Post, &url).await.unwrap();
        assert_eq!(response.status, 404);

        assert_eq!(index.hits(), 1);
        assert_eq!(missing.hits(), 1);
    }

    #[tokio::test]
    async fn reqwest_transport_surfaces_connection_errors() {
        let transport =
            ReqwestTransport::with_timeout(Some(time::Duration::from_secs(2))).unwrap();
        // Nothing listens on port 1.
        let url = Url::parse("http://127.0.0.1:1/").unwrap();
        let error = transport.execute(Method::Get, &url).await.unwrap_err();
        assert!(!error.detail.is_empty());
    }
}
