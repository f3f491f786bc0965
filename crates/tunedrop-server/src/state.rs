use anyhow::{Context, Result};
use std::sync::Arc;
use tunedrop::extractor::{Extractor, YtDlpExtractor};
use tunedrop::services::{ArtifactStore, ConversionService, RetentionSweeper, ServiceConfig};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ArtifactStore>,
    pub conversions: ConversionService,
    pub config: ServiceConfig,
}

impl AppState {
    /// Build the production state: on-disk store plus the yt-dlp extractor
    pub async fn from_config(config: ServiceConfig) -> Result<Self> {
        let store = ArtifactStore::open(&config.storage.root, &config.storage.extension)
            .await
            .with_context(|| {
                format!(
                    "Failed to open artifact store at {}",
                    config.storage.root.display()
                )
            })?;
        let extractor: Arc<dyn Extractor> =
            Arc::new(YtDlpExtractor::new(config.extraction.clone()));
        Ok(Self::new(Arc::new(store), extractor, config))
    }

    pub fn new(
        store: Arc<ArtifactStore>,
        extractor: Arc<dyn Extractor>,
        config: ServiceConfig,
    ) -> Self {
        let conversions =
            ConversionService::new(store.clone(), extractor, config.extraction.clone());
        Self {
            store,
            conversions,
            config,
        }
    }

    pub fn sweeper(&self) -> RetentionSweeper {
        RetentionSweeper::from_config(self.store.clone(), &self.config.retention)
    }
}
