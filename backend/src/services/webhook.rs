use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::{debug, warn};

use super::{CollaboratorError, CollaboratorResult, HttpCaller, HttpRequest, HttpResponse};
use crate::workflows::steps::HttpMethod;

const SERVICE: &str = "webhook";

/// Outbound webhook calls over reqwest
#[derive(Debug, Clone)]
pub struct ReqwestHttpCaller {
    client: Client,
}

impl ReqwestHttpCaller {
    pub fn new(timeout: Duration) -> CollaboratorResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CollaboratorError::unavailable(SERVICE, e.to_string()))?;
        Ok(Self { client })
    }
}

fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl HttpCaller for ReqwestHttpCaller {
    async fn call(&self, request: &HttpRequest) -> CollaboratorResult<HttpResponse> {
        let mut builder = self.client.request(to_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(url = %request.url, "Webhook request failed: {}", e);
            CollaboratorError::unavailable(SERVICE, e.to_string())
        })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        debug!(url = %request.url, status = status.as_u16(), "Webhook responded");

        if status.is_server_error() {
            return Err(CollaboratorError::unavailable(SERVICE, format!("{} returned {}", request.url, status)));
        }
        if !status.is_success() {
            return Err(CollaboratorError::rejected(SERVICE, format!("{} returned {}", request.url, status)));
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            body: serde_json::from_str(&text).ok(),
        })
    }
}
