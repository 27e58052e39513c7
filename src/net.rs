use color_eyre::{eyre::eyre, Result};

use crate::http::{Network, Request, Response};

/// Network backed by a shared `reqwest` client.
///
/// The client carries no timeouts of its own. Only network-first bounds its
/// wait, in the strategy executor.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!(
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION")
      ))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let reply = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = reply.status().as_u16();
    let headers: Vec<(String, String)> = reply
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = reply
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    let mut response = Response::new(status, body.to_vec());
    for (name, value) in &headers {
      response = response.with_header(name, value);
    }
    Ok(response)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  #[tokio::test]
  async fn test_unreachable_host_is_an_error() {
    let network = HttpNetwork::new().unwrap();
    // Port 9 on loopback has no listener
    let request = Request::get(Url::parse("http://127.0.0.1:9/app.js").unwrap());

    let err = network.fetch(&request).await.unwrap_err();
    assert!(err.to_string().contains("Failed to fetch"));
  }
}
