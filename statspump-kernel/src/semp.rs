//! SEMP over HTTP: POST an `<rpc>` document to `/SEMP`, get the reply body.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, trace};

use crate::appliance::PhysicalAppliance;
use crate::error::{PumpError, Result};

#[async_trait]
pub trait SempTransport: Send + Sync {
    /// Sends one request and returns the complete reply body.
    async fn post(&self, node: &PhysicalAppliance, request: &str) -> Result<Bytes>;
}

pub struct HttpSempTransport {
    client: reqwest::Client,
}

impl HttpSempTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .user_agent(concat!("statspump/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PumpError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SempTransport for HttpSempTransport {
    async fn post(&self, node: &PhysicalAppliance, request: &str) -> Result<Bytes> {
        let url = node.semp_url();
        trace!("POST {} {}", url, request);
        let http_error = |source| PumpError::Http { host: node.host.clone(), source };

        let response = self
            .client
            .post(&url)
            .basic_auth(&node.credentials.username, Some(&node.credentials.password))
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(request.to_string())
            .send()
            .await
            .map_err(http_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(PumpError::HttpStatus { host: node.host.clone(), status: status.as_u16() });
        }

        let body = response.bytes().await.map_err(http_error)?;
        debug!("SEMP reply from {}: {} bytes", node.host, body.len());
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::{Credentials, Role};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;

    async fn semp(headers: HeaderMap, body: String) -> std::result::Result<String, StatusCode> {
        // admin:admin
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Basic YWRtaW46YWRtaW4=");
        if !authorized {
            return Err(StatusCode::UNAUTHORIZED);
        }
        Ok(format!("<rpc-reply><echo>{}</echo></rpc-reply>", body.len()))
    }

    async fn appliance(password: &str) -> PhysicalAppliance {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/SEMP", post(semp))).await.unwrap();
        });
        let credentials = Credentials { username: "admin".into(), password: password.into() };
        PhysicalAppliance::new(addr.to_string(), credentials, Role::Primary, false)
    }

    fn transport() -> HttpSempTransport {
        HttpSempTransport::new(Duration::from_secs(2), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn posts_request_with_basic_auth() {
        let node = appliance("admin").await;
        let body = transport().post(&node, "<rpc/>").await.unwrap();
        assert_eq!(&body[..], b"<rpc-reply><echo>6</echo></rpc-reply>");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let node = appliance("wrong").await;
        let err = transport().post(&node, "<rpc/>").await.unwrap_err();
        assert!(matches!(err, PumpError::HttpStatus { status: 401, .. }));
        assert!(!err.is_unreachable());
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let credentials = Credentials { username: "admin".into(), password: "admin".into() };
        let node = PhysicalAppliance::new(addr.to_string(), credentials, Role::Primary, false);
        let err = transport().post(&node, "<rpc/>").await.unwrap_err();
        assert!(err.is_unreachable(), "{err}");
    }
}
