use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::api_types::{ApiListResponse, JobStatusResponse, ModificationRecord};
use super::{CollectionSource, ContentResolver, JobService, Ledger, WriteSink};
use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::jobs::types::ReportParameters;
use crate::queue::QueueItem;

/// HTTP adapter for the attendance backend
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, token: Option<String>) -> Result<Self> {
    let mut base = Url::parse(&config.url)
      .map_err(|e| Error::Network(format!("Invalid remote url {}: {}", config.url, e)))?;
    // Url::join treats a base without trailing slash as a file
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }

    let client = Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| Error::Network(format!("Invalid endpoint {}: {}", path, e)))
  }

  fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  async fn send(&self, builder: RequestBuilder) -> Result<Response> {
    let response = self.authorized(builder).send().await?;
    Ok(response.error_for_status()?)
  }

  async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
    debug!(%url, "GET");
    let response = self.send(self.client.get(url)).await?;
    Ok(response.json().await?)
  }
}

#[async_trait]
impl CollectionSource for HttpRemote {
  async fn fetch_all(&self, table: &str) -> Result<Vec<Value>> {
    let url = self.endpoint(&format!("api/{}", table))?;
    let list: ApiListResponse = self.get_json(url).await?;
    Ok(list.into_items())
  }

  async fn fetch_scoped(&self, table: &str, params: &[(String, String)]) -> Result<Vec<Value>> {
    let mut url = self.endpoint(&format!("api/{}", table))?;
    url
      .query_pairs_mut()
      .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let list: ApiListResponse = self.get_json(url).await?;
    Ok(list.into_items())
  }
}

#[async_trait]
impl Ledger for HttpRemote {
  async fn last_modified(&self, table: &str) -> Result<Option<ModificationRecord>> {
    let url = self.endpoint(&format!("api/ledger/{}", table))?;
    match self.get_json(url).await {
      Ok(record) => Ok(Some(record)),
      Err(Error::NotFound(_)) => Ok(None),
      Err(e) => Err(e),
    }
  }
}

#[async_trait]
impl WriteSink for HttpRemote {
  async fn submit(&self, item: &QueueItem) -> Result<()> {
    let url = self.endpoint(&format!("api/writes/{}", item.kind))?;
    let mut builder = self.client.post(url).json(&item.payload);
    if let Some(correlation) = &item.correlation {
      // Lets the server collapse redelivered writes
      builder = builder.header("Idempotency-Key", correlation);
    }

    // A 409 surfaces as Error::StaleWrite through the status mapping
    self.send(builder).await?;
    Ok(())
  }
}

#[async_trait]
impl JobService for HttpRemote {
  async fn create_job(&self, key: &str, params: &ReportParameters) -> Result<JobStatusResponse> {
    let url = self.endpoint("api/reports/jobs")?;
    let body = serde_json::json!({ "key": key, "parameters": params });
    let response = self.send(self.client.post(url).json(&body)).await?;
    Ok(response.json().await?)
  }

  async fn job_status(&self, key: &str) -> Result<JobStatusResponse> {
    let url = self.endpoint(&format!("api/reports/jobs/{}", key))?;
    self.get_json(url).await
  }
}

#[async_trait]
impl ContentResolver for HttpRemote {
  async fn resolve(&self, locator: &str) -> Result<Value> {
    let mut url = self.endpoint("api/content")?;
    url.query_pairs_mut().append_pair("locator", locator);
    self.get_json(url).await
  }
}
