//! Deployable versions: precache, wait, activate, clean up.
//!
//! The first version installed becomes active immediately. Any later version
//! is precached alongside the active one and waits until the UI asks for it
//! through the [`ActivationHandle`] carried by `UpdateAvailable`.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, Partition};
use crate::clock::Clock;
use crate::db::Database;
use crate::http::{fetch_with_timeout, Request, Response};
use crate::signal::{ActivationHandle, ControlMessage, Signal, SignalBus};

const ACTIVE_VERSION_SLOT: &str = "active_version";

/// URLs precached for one deployable version, relative to the origin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrecacheManifest {
  pub version: String,
  #[serde(default)]
  pub shell: Vec<String>,
  #[serde(default)]
  pub assets: Vec<String>,
}

impl PrecacheManifest {
  /// Read a manifest file (YAML or JSON).
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read manifest {}: {}", path.display(), e))?;
    let manifest: Self = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse manifest {}: {}", path.display(), e))?;
    if manifest.version.trim().is_empty() {
      return Err(eyre!("Manifest {} has an empty version", path.display()));
    }
    Ok(manifest)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
  /// No version was active; this one took over
  Activated,
  /// Precached and waiting for the UI to activate it
  Waiting,
  /// The version is already active
  AlreadyActive,
}

pub struct Lifecycle<S: CacheStorage> {
  layer: CacheLayer<S>,
  db: Arc<Database>,
  clock: Arc<dyn Clock>,
  bus: SignalBus,
  control: mpsc::UnboundedSender<ControlMessage>,
  origin: Url,
  fetch_timeout: Duration,
  active: watch::Sender<Option<String>>,
  waiting: Mutex<Option<String>>,
}

impl<S: CacheStorage> Lifecycle<S> {
  /// Restore the active version persisted by a previous run, if any.
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    layer: CacheLayer<S>,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    bus: SignalBus,
    control: mpsc::UnboundedSender<ControlMessage>,
    origin: Url,
    fetch_timeout: Duration,
  ) -> Result<Self> {
    let restored = db.get_slot(ACTIVE_VERSION_SLOT)?.map(|(version, _)| version);
    if let Some(version) = &restored {
      info!(version = %version, "Restored active version");
    }
    let (active, _) = watch::channel(restored);

    Ok(Self {
      layer,
      db,
      clock,
      bus,
      control,
      origin,
      fetch_timeout,
      active,
      waiting: Mutex::new(None),
    })
  }

  pub fn active_version(&self) -> Option<String> {
    self.active.borrow().clone()
  }

  pub fn waiting_version(&self) -> Option<String> {
    self.waiting.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Follows the active version; the router names its caches from it.
  pub fn subscribe_active(&self) -> watch::Receiver<Option<String>> {
    self.active.subscribe()
  }

  /// Precache `manifest` and either activate it or park it as waiting.
  ///
  /// All-or-nothing: if any URL cannot be fetched with a 2xx the version's
  /// partitions are dropped and the install fails.
  pub async fn install(&self, manifest: &PrecacheManifest) -> Result<InstallOutcome> {
    let version = manifest.version.as_str();
    if self.active_version().as_deref() == Some(version) {
      debug!(version, "Version already active");
      return Ok(InstallOutcome::AlreadyActive);
    }

    info!(
      version,
      shell = manifest.shell.len(),
      assets = manifest.assets.len(),
      "Installing version"
    );

    if let Err(e) = self.precache(manifest).await {
      self.drop_version(version);
      return Err(e);
    }

    if self.active_version().is_none() {
      self.set_active(version)?;
      self.cleanup_other_versions(version);
      info!(version, "First version active, offline ready");
      self.bus.emit(Signal::OfflineReady {
        version: version.to_string(),
      });
      return Ok(InstallOutcome::Activated);
    }

    *self.waiting.lock().unwrap_or_else(|e| e.into_inner()) = Some(version.to_string());
    info!(version, "Update waiting for activation");
    self.bus.emit(Signal::UpdateAvailable {
      version: version.to_string(),
      activation: ActivationHandle::new(version, self.control.clone()),
    });
    Ok(InstallOutcome::Waiting)
  }

  /// Make the waiting `version` active and delete every other version's
  /// caches. A version that is not waiting is ignored.
  pub fn activate_pending(&self, version: &str) -> Result<bool> {
    {
      let mut waiting = self.waiting.lock().unwrap_or_else(|e| e.into_inner());
      if waiting.as_deref() != Some(version) {
        warn!(
          version,
          waiting = ?*waiting,
          "Activation requested for a version that is not waiting"
        );
        return Ok(false);
      }
      *waiting = None;
    }

    self.set_active(version)?;
    self.cleanup_other_versions(version);
    info!(version, "Activated version");
    Ok(true)
  }

  async fn precache(&self, manifest: &PrecacheManifest) -> Result<()> {
    let version = Some(manifest.version.as_str());
    let shell_cache = Partition::Shell.cache_name(version);
    let asset_cache = Partition::Asset.cache_name(version);

    // Fetch everything before writing anything
    let mut fetched: Vec<(&str, Url, Response)> = Vec::new();
    let targets = manifest
      .shell
      .iter()
      .map(|path| (shell_cache.as_str(), path))
      .chain(manifest.assets.iter().map(|path| (asset_cache.as_str(), path)));

    for (cache_name, path) in targets {
      let url = self
        .origin
        .join(path)
        .map_err(|e| eyre!("Invalid precache path {}: {}", path, e))?;
      let request = Request::get(url.as_str())?;
      let response = fetch_with_timeout(self.layer.fetcher().as_ref(), &request, self.fetch_timeout)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to precache {}: HTTP {}",
          url,
          response.status
        ));
      }
      fetched.push((cache_name, url, response));
    }

    for (cache_name, url, response) in &fetched {
      self.layer.precache(cache_name, url.as_str(), response)?;
    }
    debug!(version = %manifest.version, entries = fetched.len(), "Precache complete");
    Ok(())
  }

  fn set_active(&self, version: &str) -> Result<()> {
    self
      .db
      .put_slot(ACTIVE_VERSION_SLOT, version, self.clock.now())?;
    self.active.send_replace(Some(version.to_string()));
    Ok(())
  }

  fn drop_version(&self, version: &str) {
    for partition in [Partition::Shell, Partition::Asset] {
      let name = partition.cache_name(Some(version));
      if let Err(e) = self.layer.storage().delete_cache(&name) {
        warn!(cache = %name, error = %e, "Failed to drop partial precache");
      }
    }
  }

  fn cleanup_other_versions(&self, keep: &str) {
    let names = match self.layer.storage().cache_names() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "Failed to list caches for cleanup");
        return;
      }
    };

    for name in names {
      match Partition::parse_versioned(&name) {
        Some((_, version)) if version != keep => {
          match self.layer.storage().delete_cache(&name) {
            Ok(removed) => info!(cache = %name, removed, "Deleted outdated cache"),
            Err(e) => warn!(cache = %name, error = %e, "Failed to delete outdated cache"),
          }
        }
        _ => {}
      }
    }
  }
}
