//! HTTP seam between the rate limiter and the network.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::StatusCode;
use url::Url;

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: StatusCode,
  pub body: Vec<u8>,
}

/// Issues plain GET requests.
pub trait Transport: Send + Sync {
  fn get(&self, url: Url) -> BoxFuture<'static, Result<HttpResponse>>;
}

/// Transport backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("drivecrawl/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Transport for ReqwestTransport {
  fn get(&self, url: Url) -> BoxFuture<'static, Result<HttpResponse>> {
    let client = self.client.clone();
    Box::pin(async move {
      let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| eyre!("Request failed: {}", e))?;
      let status = response.status();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response body: {}", e))?;

      Ok(HttpResponse {
        status,
        body: body.to_vec(),
      })
    })
  }
}
