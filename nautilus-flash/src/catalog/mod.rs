//! The list of published firmware releases
//!
//! The [ReleaseCatalog] caches the releases last returned by a
//! [ReleaseSource] and tracks which one of them, if any, the operator has
//! selected. Failing to list releases is never fatal: the catalog degrades to
//! offering only the local firmware files.

use async_trait::async_trait;
use log::{info, warn};
use url::Url;

pub use self::github::GitHubReleases;
use crate::{error::CatalogError, manifest::Selection};

pub mod github;

/// A downloadable file attached to a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    pub download_url: Url,
}

/// A published firmware release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Human readable name, may be empty
    pub name: String,
    pub tag: String,
    pub prerelease: bool,
    pub assets: Vec<Asset>,
}

impl Release {
    /// The name to show the operator, falling back to the tag
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.tag
        } else {
            &self.name
        }
    }

    /// Find an asset by its exact file name
    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.assets.iter().find(|asset| asset.name == name)
    }
}

/// A service which lists releases, most recent first
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn list(&self) -> Result<Vec<Release>, CatalogError>;
}

/// Whether, and how, the catalog was last loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogState {
    /// [ReleaseCatalog::refresh] has not been called yet
    Unloaded,
    /// The releases returned by the last successful refresh
    Loaded(Vec<Release>),
    /// The last refresh failed, only local files are available
    Failed(String),
}

/// Cached releases and the current selection
pub struct ReleaseCatalog {
    source: Option<Box<dyn ReleaseSource>>,
    state: CatalogState,
    selected: Option<usize>,
}

impl ReleaseCatalog {
    pub fn new(source: impl ReleaseSource + 'static) -> Self {
        ReleaseCatalog {
            source: Some(Box::new(source)),
            state: CatalogState::Unloaded,
            selected: None,
        }
    }

    /// A catalog with no release source, offering local files only
    pub fn local_only() -> Self {
        ReleaseCatalog {
            source: None,
            state: CatalogState::Unloaded,
            selected: None,
        }
    }

    /// Reload the releases, returning how many are now available
    pub async fn refresh(&mut self) -> usize {
        let result = match &self.source {
            Some(source) => source.list().await,
            None => Err(CatalogError::NotConfigured),
        };

        match result {
            Ok(releases) => {
                info!("Found {} release(s)", releases.len());
                self.selected = (!releases.is_empty()).then_some(0);
                self.state = CatalogState::Loaded(releases);
            }
            Err(err) => {
                warn!("Failed to load releases, using local firmware files: {err}");
                self.selected = None;
                self.state = CatalogState::Failed(err.to_string());
            }
        }

        self.releases().len()
    }

    pub fn state(&self) -> &CatalogState {
        &self.state
    }

    /// The reason the last refresh failed, if it did
    pub fn failure(&self) -> Option<&str> {
        match &self.state {
            CatalogState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn releases(&self) -> &[Release] {
        match &self.state {
            CatalogState::Loaded(releases) => releases,
            _ => &[],
        }
    }

    /// Select a release by index, or `None` for the local files
    pub fn select(&mut self, index: Option<usize>) -> Result<(), CatalogError> {
        let len = self.releases().len();

        match index {
            Some(index) if index >= len => Err(self.missing(
                &format!("#{}", index + 1),
                CatalogError::OutOfRange { index, len },
            )),
            index => {
                self.selected = index;
                Ok(())
            }
        }
    }

    /// Select the release with the given tag or display name
    pub fn select_tag(&mut self, tag: &str) -> Result<(), CatalogError> {
        let index = self
            .releases()
            .iter()
            .position(|release| release.tag == tag || release.display_name() == tag)
            .ok_or_else(|| self.missing(tag, CatalogError::UnknownRelease(tag.to_string())))?;

        self.selected = Some(index);
        Ok(())
    }

    /// Explain a release missing from the listing, blaming a failed refresh
    /// when there is one
    fn missing(&self, release: &str, err: CatalogError) -> CatalogError {
        match self.failure() {
            Some(reason) => CatalogError::Unavailable {
                release: release.to_string(),
                reason: reason.to_string(),
            },
            None => err,
        }
    }

    /// The selected release, `None` meaning the local files
    pub fn selected(&self) -> Option<&Release> {
        self.selected.and_then(|index| self.releases().get(index))
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    /// The selection to flash
    pub fn selection(&self) -> Selection<'_> {
        match self.selected() {
            Some(release) => Selection::Release(release),
            None => Selection::Local,
        }
    }
}

impl std::fmt::Debug for ReleaseCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseCatalog")
            .field("configured", &self.source.is_some())
            .field("state", &self.state)
            .field("selected", &self.selected)
            .finish()
    }
}
