//! Factory - Locate-or-create for every managed resource kind
//!
//! `ensure` never modifies a resource it finds. It only decides whether the
//! resource exists and creates it when it does not, at most once per logical
//! name for the lifetime of the factory.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use log::{info, warn};

use crate::error::CoreError;
use crate::locator::Locator;
use crate::provider::{CloudProvider, CreatedResource, LaunchRequest, ProviderError, ProviderErrorKind};
use crate::resource::{FoundResource, NAME_TAG, ResourceFilter, ResourceId, ResourceKind, ResourceSpec};
use crate::sequencer::wait_failed;
use crate::waiter::{Probe, RetryPolicy, Waiter};

/// Result of an ensure call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured {
    /// Provider-assigned identifier
    pub id: String,
    /// Whether this call created the resource
    pub created: bool,
    /// Attributes reported by the provider; empty for resources created in this run
    pub attributes: BTreeMap<String, String>,
}

impl Ensured {
    fn found(resource: FoundResource) -> Self {
        Self {
            id: resource.id,
            created: false,
            attributes: resource.attributes,
        }
    }

    fn new(id: String, created: bool) -> Self {
        Self {
            id,
            created,
            attributes: BTreeMap::new(),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn list_attribute(&self, key: &str) -> Vec<&str> {
        self.attribute(key)
            .map(|v| v.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

pub struct ResourceFactory<'a> {
    provider: &'a dyn CloudProvider,
    waiter: &'a Waiter,
    /// Identifiers of resources created by this factory
    created: HashMap<ResourceId, String>,
    created_order: Vec<ResourceId>,
}

impl<'a> ResourceFactory<'a> {
    pub fn new(provider: &'a dyn CloudProvider, waiter: &'a Waiter) -> Self {
        Self {
            provider,
            waiter,
            created: HashMap::new(),
            created_order: Vec::new(),
        }
    }

    fn locator(&self) -> Locator<'a> {
        Locator::new(self.provider, self.waiter)
    }

    /// Resources created so far, in creation order
    pub fn created(&self) -> &[ResourceId] {
        &self.created_order
    }

    fn remember(&mut self, id: ResourceId, provider_id: &str) {
        self.created.insert(id.clone(), provider_id.to_string());
        self.created_order.push(id);
    }

    fn already_created(&self, id: &ResourceId) -> Option<Ensured> {
        self.created
            .get(id)
            .map(|provider_id| Ensured::new(provider_id.clone(), false))
    }

    /// Return the existing resource for `spec`, or create it
    pub async fn ensure(&mut self, spec: &ResourceSpec) -> Result<Ensured, CoreError> {
        let id = spec.id();
        if let Some(ensured) = self.already_created(&id) {
            return Ok(ensured);
        }

        if let Some(existing) = self.locator().locate(&spec.filter()).await? {
            info!("Using existing {}: {}", id, existing.id);
            return Ok(Ensured::found(existing));
        }

        let created = self.create(spec).await?;
        info!("Created {}: {}", id, created.id);
        self.remember(id, &created.id);
        Ok(Ensured::new(created.id, true))
    }

    /// Ensure the key pair and keep the local private-key file in step with it
    ///
    /// The private key is only available at creation time, so it is written
    /// exactly once. A local file without a matching key pair is never
    /// overwritten.
    pub async fn ensure_key_pair(
        &mut self,
        spec: &ResourceSpec,
        key_path: &Path,
    ) -> Result<Ensured, CoreError> {
        let id = spec.id();
        if let Some(ensured) = self.already_created(&id) {
            return Ok(ensured);
        }

        if let Some(existing) = self.locator().locate(&spec.filter()).await? {
            if !key_path.exists() {
                warn!(
                    "Key pair {} exists but {} is missing; SSH access needs the original private key",
                    existing.id,
                    key_path.display()
                );
            } else {
                info!("Using existing {}: {}", id, existing.id);
            }
            return Ok(Ensured::found(existing));
        }

        if key_path.exists() {
            return Err(CoreError::KeyMaterial {
                path: key_path.to_path_buf(),
                message: format!(
                    "file exists but key pair '{}' does not; move the file away before creating a new key",
                    spec.logical_name()
                ),
            });
        }

        // Claim the file first so a key pair is never created with nowhere to keep its key
        let file = open_private_key(key_path)?;
        let created = match self.create(spec).await {
            Ok(created) => created,
            Err(e) => {
                drop(file);
                discard_private_key(key_path);
                return Err(e);
            }
        };

        let written = created
            .key_material
            .as_deref()
            .ok_or_else(|| CoreError::KeyMaterial {
                path: key_path.to_path_buf(),
                message: format!("provider returned no private key for '{}'", created.id),
            })
            .and_then(|material| write_private_key(file, key_path, material));
        if let Err(e) = written {
            discard_private_key(key_path);
            self.remove_key_pair(&created.id).await;
            return Err(e);
        }

        info!("Created {}: {} (private key saved to {})", id, created.id, key_path.display());
        self.remember(id, &created.id);
        Ok(Ensured::new(created.id, true))
    }

    /// A key pair whose private key was lost cannot be used; drop it so the next run recreates it
    async fn remove_key_pair(&self, key_name: &str) {
        let provider = self.provider;
        let resource = FoundResource::new(key_name);
        let removed = self
            .waiter
            .retry_throttled(&RetryPolicy::throttle(), || {
                provider.delete_resource(ResourceKind::KeyPair, &resource)
            })
            .await;
        match removed {
            Ok(()) => warn!("Deleted key pair {} after its private key could not be saved", key_name),
            Err(e) => warn!("Key pair {} has no saved private key and could not be deleted: {}", key_name, e),
        }
    }

    /// Return the live instance tagged with the request's name, or launch one
    ///
    /// A launch rejected as not ready (the instance profile is not yet visible
    /// to EC2) is retried under `readiness`; every other error ends the call.
    pub async fn ensure_instance(
        &mut self,
        request: &LaunchRequest,
        readiness: &RetryPolicy,
    ) -> Result<Ensured, CoreError> {
        let id = ResourceId::new(ResourceKind::Instance, &request.name);
        if let Some(ensured) = self.already_created(&id) {
            return Ok(ensured);
        }

        let filter = ResourceFilter::new(ResourceKind::Instance).with_tag(NAME_TAG, &request.name);
        if let Some(existing) = self.locator().locate(&filter).await? {
            info!("Using existing {}: {}", id, existing.id);
            return Ok(Ensured::found(existing));
        }

        let provider = self.provider;
        let waiter = self.waiter;
        let launched = waiter
            .wait_until(&format!("launch of {}", id), readiness, move |_| async move {
                let result = waiter
                    .retry_throttled(&RetryPolicy::throttle(), || provider.launch_instance(request))
                    .await;
                match result {
                    Err(e) if e.kind == ProviderErrorKind::NotReady => Ok(Probe::Pending(e.to_string())),
                    // Any other outcome ends the wait, errors the waiter would poll through included
                    other => Ok(Probe::Ready(other)),
                }
            })
            .await
            .map_err(|e| wait_failed(e, ResourceKind::Instance, &request.name))?;
        let instance_id = launched.map_err(|cause| creation_error(&id, &request.name, cause))?;

        info!("Launched {}: {}", id, instance_id);
        self.remember(id, &instance_id);
        Ok(Ensured::new(instance_id, true))
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<CreatedResource, CoreError> {
        let provider = self.provider;
        self.waiter
            .retry_throttled(&RetryPolicy::throttle(), || provider.create_resource(spec))
            .await
            .map_err(|cause| {
                let name = match spec {
                    ResourceSpec::Bucket(bucket) => bucket.bucket_name.as_str(),
                    _ => spec.logical_name(),
                };
                creation_error(&spec.id(), name, cause)
            })
    }
}

fn creation_error(id: &ResourceId, name: &str, cause: ProviderError) -> CoreError {
    match cause.kind {
        ProviderErrorKind::Conflict => CoreError::NameConflict {
            kind: id.kind,
            name: name.to_string(),
            cause,
        },
        ProviderErrorKind::NotReady => CoreError::DependencyNotReady {
            resource: id.to_string(),
            attempts: 1,
            last_error: cause.to_string(),
        },
        _ => CoreError::ProvisioningFailed {
            kind: id.kind,
            name: name.to_string(),
            cause,
        },
    }
}

/// Create the private-key file with owner-only permissions, refusing to overwrite
fn open_private_key(path: &Path) -> Result<File, CoreError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(|e| key_error(path, e))
}

fn write_private_key(mut file: File, path: &Path, material: &str) -> Result<(), CoreError> {
    file.write_all(material.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|e| key_error(path, e))
}

fn discard_private_key(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Could not remove {}: {}", path.display(), e);
    }
}

fn key_error(path: &Path, e: std::io::Error) -> CoreError {
    CoreError::KeyMaterial {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}
