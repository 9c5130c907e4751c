//! Core types for the response cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::http::{Headers, Response};

/// Version used for cache names before any version has been installed.
pub const UNVERSIONED: &str = "0";

/// The named caches responses are partitioned into.
///
/// Shell and asset caches are precached per deployable version and are named
/// `<prefix>-<version>`. The API cache is filled at runtime and survives
/// version changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  Shell,
  Api,
  Asset,
}

impl Partition {
  pub fn prefix(&self) -> &'static str {
    match self {
      Self::Shell => "shell",
      Self::Api => "api",
      Self::Asset => "assets",
    }
  }

  pub fn is_versioned(&self) -> bool {
    !matches!(self, Self::Api)
  }

  /// Cache name for this partition under `version`.
  pub fn cache_name(&self, version: Option<&str>) -> String {
    if self.is_versioned() {
      format!("{}-{}", self.prefix(), version.unwrap_or(UNVERSIONED))
    } else {
      format!("{}-runtime", self.prefix())
    }
  }

  /// Split a versioned cache name back into partition and version.
  pub fn parse_versioned(cache_name: &str) -> Option<(Partition, &str)> {
    let (prefix, version) = cache_name.split_once('-')?;
    match prefix {
      "shell" => Some((Self::Shell, version)),
      "assets" => Some((Self::Asset, version)),
      _ => None,
    }
  }
}

/// How a response was obtained and stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  NetworkFirst,
  StaleWhileRevalidate,
  Precache,
}

impl Strategy {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::NetworkFirst => "network_first",
      Self::StaleWhileRevalidate => "stale_while_revalidate",
      Self::Precache => "precache",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "network_first" => Some(Self::NetworkFirst),
      "stale_while_revalidate" => Some(Self::StaleWhileRevalidate),
      "precache" => Some(Self::Precache),
      _ => None,
    }
  }
}

/// A response as stored in a cache partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub url: String,
  pub strategy: Strategy,
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CachedResponse {
  pub fn from_response(
    url: &str,
    strategy: Strategy,
    response: &Response,
    stored_at: DateTime<Utc>,
  ) -> Self {
    Self {
      url: url.to_string(),
      strategy,
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at,
    }
  }

  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Cached copy served first while a refresh runs in the background.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheRevalidating,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cached copy, network refresh running in the background
  CacheRevalidating,
  /// Network failed or timed out, serving the cached copy
  Offline,
}
