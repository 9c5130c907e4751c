use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{FeatureFlag, FlagError};
use crate::http::{fetch_with_timeout, Destination, Fetcher, Method, Request};

/// Where the full flag set comes from.
#[async_trait]
pub trait FlagSource: Send + Sync {
  async fn fetch_flags(&self) -> Result<Vec<FeatureFlag>, FlagError>;
}

#[derive(Deserialize)]
struct FlagsResponse {
  flags: Vec<FeatureFlag>,
}

/// `GET <endpoint>?user_id=..&group_id=..` returning `{ "flags": [...] }`.
pub struct HttpFlagSource {
  fetcher: Arc<dyn Fetcher>,
  endpoint: Url,
  user_id: Option<String>,
  group_id: Option<String>,
  timeout: Duration,
}

impl HttpFlagSource {
  pub fn new(fetcher: Arc<dyn Fetcher>, endpoint: Url, timeout: Duration) -> Self {
    Self {
      fetcher,
      endpoint,
      user_id: None,
      group_id: None,
      timeout,
    }
  }

  pub fn with_user(mut self, user_id: Option<String>, group_id: Option<String>) -> Self {
    self.user_id = user_id;
    self.group_id = group_id;
    self
  }

  fn request_url(&self) -> Url {
    let mut url = self.endpoint.clone();
    {
      let mut query = url.query_pairs_mut();
      if let Some(user_id) = &self.user_id {
        query.append_pair("user_id", user_id);
      }
      if let Some(group_id) = &self.group_id {
        query.append_pair("group_id", group_id);
      }
    }
    // An empty query would leave a dangling '?'
    if url.query() == Some("") {
      url.set_query(None);
    }
    url
  }
}

#[async_trait]
impl FlagSource for HttpFlagSource {
  async fn fetch_flags(&self) -> Result<Vec<FeatureFlag>, FlagError> {
    let request = Request {
      method: Method::Get,
      url: self.request_url(),
      headers: vec![("accept".to_string(), "application/json".to_string())],
      body: Vec::new(),
      destination: Destination::Empty,
    };

    let response = fetch_with_timeout(self.fetcher.as_ref(), &request, self.timeout).await?;
    if !response.is_success() {
      return Err(FlagError::Status(response.status));
    }

    let parsed: FlagsResponse =
      serde_json::from_slice(&response.body).map_err(|e| FlagError::Decode(e.to_string()))?;
    Ok(parsed.flags)
  }
}
