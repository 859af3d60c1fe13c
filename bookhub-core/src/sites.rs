//! Site registry operations.
//!
//! [`SiteDirectory`] wraps a [`SiteRegistry`] with the checks every inbound
//! call needs: resolving a bearer API key to an active site, looking up
//! handoff destinations, and the administrative register/rotate/deactivate
//! operations that hand out new credentials.

use std::sync::Arc;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::model::{Site, SiteId, normalize_domain};
use crate::secret::{Secret, generate_site_api_key, mask_credential};
use crate::store::{SiteRegistry, StoreError};

/// Error type for site lookups and administration.
#[derive(Debug, Error)]
pub enum SiteAuthError {
    /// No active site holds this API key.
    #[error("invalid site credential")]
    InvalidCredential,

    /// No active site is registered for this domain.
    #[error("unknown or inactive site: {domain}")]
    UnknownSite { domain: String },

    /// Error from the underlying registry.
    #[error("registry error: {0}")]
    Store(#[from] StoreError),
}

impl Classify for SiteAuthError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCredential => ErrorKind::AuthenticationFailure,
            Self::UnknownSite { .. } => ErrorKind::NotFound,
            Self::Store(e) => e.kind(),
        }
    }
}

/// Site lookups and credential management over a [`SiteRegistry`].
#[derive(Clone)]
pub struct SiteDirectory {
    registry: Arc<dyn SiteRegistry>,
}

impl SiteDirectory {
    pub fn new(registry: Arc<dyn SiteRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve a bearer API key to the active site that owns it.
    ///
    /// Unknown and inactive keys fail identically.
    pub async fn authenticate(&self, api_key: &str) -> Result<Site, SiteAuthError> {
        if api_key.is_empty() {
            return Err(SiteAuthError::InvalidCredential);
        }

        match self.registry.find_site_by_api_key(api_key).await? {
            Some(site) if site.active => Ok(site),
            Some(site) => {
                tracing::debug!(
                    "Rejected key {} for inactive site {}",
                    mask_credential(api_key),
                    site.domain
                );
                Err(SiteAuthError::InvalidCredential)
            }
            None => {
                tracing::debug!("Rejected unknown site key {}", mask_credential(api_key));
                Err(SiteAuthError::InvalidCredential)
            }
        }
    }

    /// Find an active site by domain.
    pub async fn active_by_domain(&self, domain: &str) -> Result<Site, SiteAuthError> {
        let domain = normalize_domain(domain);
        match self.registry.find_site_by_domain(&domain).await? {
            Some(site) if site.active => Ok(site),
            _ => Err(SiteAuthError::UnknownSite { domain }),
        }
    }

    /// Look up a site by domain regardless of its active flag.
    pub async fn find_by_domain(&self, domain: &str) -> Result<Option<Site>, SiteAuthError> {
        Ok(self.registry.find_site_by_domain(domain).await?)
    }

    /// Look up a site by id regardless of its active flag.
    pub async fn get(&self, id: &SiteId) -> Result<Option<Site>, SiteAuthError> {
        Ok(self.registry.get_site(id).await?)
    }

    /// All active sites, ordered by domain.
    pub async fn list_active(&self) -> Result<Vec<Site>, SiteAuthError> {
        let mut sites: Vec<Site> = self
            .registry
            .list_sites()
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect();
        sites.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(sites)
    }

    /// Register a new site and return it with its freshly generated key.
    ///
    /// The returned [`Secret`] is the only time the key leaves the hub.
    pub async fn register(&self, name: &str, domain: &str) -> Result<(Site, Secret), SiteAuthError> {
        self.register_with_key(name, domain, generate_site_api_key())
            .await
    }

    /// Register a site with a caller-supplied key.
    pub async fn register_with_key(
        &self,
        name: &str,
        domain: &str,
        api_key: Secret,
    ) -> Result<(Site, Secret), SiteAuthError> {
        let site = self
            .registry
            .register_site(Site::new(name, domain, api_key.clone()))
            .await?;
        tracing::info!(
            "Registered site {} ({}) with key {}",
            site.name,
            site.domain,
            mask_credential(api_key.expose())
        );
        Ok((site, api_key))
    }

    /// Replace a site's API key. The old key stops working immediately.
    pub async fn rotate_credential(&self, id: &SiteId) -> Result<(Site, Secret), SiteAuthError> {
        let api_key = generate_site_api_key();
        let site = self.registry.rotate_api_key(id, api_key.clone()).await?;
        tracing::info!(
            "Rotated API key for site {} (now {})",
            site.domain,
            mask_credential(api_key.expose())
        );
        Ok((site, api_key))
    }

    /// Mark a site inactive. Its key and handoff destination stop resolving.
    pub async fn deactivate(&self, id: &SiteId) -> Result<Site, SiteAuthError> {
        let site = self.registry.set_site_active(id, false).await?;
        tracing::info!("Deactivated site {}", site.domain);
        Ok(site)
    }
}

impl std::fmt::Debug for SiteDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteDirectory").finish_non_exhaustive()
    }
}
