use super::config::ExtractionConfig;
use super::store::{ArtifactDraft, ArtifactStore, StoreError};
use super::types::{validate_id, ArtifactRecord, ArtifactState};
use super::ServiceError;
use crate::extractor::{ExtractError, Extraction, Extractor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;

/// Outcome published by a flight once it resolves
type FlightOutcome = Option<Result<ArtifactRecord, ServiceError>>;

/// In-flight extractions by flight key
type Flights = HashMap<String, watch::Receiver<FlightOutcome>>;

/// Upper bound on remembered URL → id mappings before the table is reset
const MAX_ALIASES: usize = 10_000;

enum Admission {
    /// Another request is already extracting this source
    Joined(watch::Receiver<FlightOutcome>),
    /// This request registered the flight and must run it
    Leader(watch::Sender<FlightOutcome>, watch::Receiver<FlightOutcome>),
}

/// Turns source URLs into stored artifacts, running at most one extraction
/// per source at a time.
///
/// Each extraction ("flight") runs on its own task. Callers only wait on the
/// flight's outcome, so a caller that gives up or disconnects does not stop
/// the extraction from finishing and populating the store.
#[derive(Clone)]
pub struct ConversionService {
    store: Arc<ArtifactStore>,
    extractor: Arc<dyn Extractor>,
    config: ExtractionConfig,
    flights: Arc<Mutex<Flights>>,
    aliases: Arc<RwLock<HashMap<String, String>>>,
}

impl ConversionService {
    pub fn new(
        store: Arc<ArtifactStore>,
        extractor: Arc<dyn Extractor>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            config,
            flights: Arc::new(Mutex::new(HashMap::new())),
            aliases: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Convert `source_url` into a ready artifact.
    ///
    /// Returns the cached artifact when one exists, attaches to an in-flight
    /// extraction for the same source, or starts a new one.
    pub async fn convert(&self, source_url: &str) -> Result<ArtifactRecord, ServiceError> {
        let url = validate_source_url(source_url)?;

        if let Some(record) = self.cached(url).await {
            tracing::debug!("Cache hit for {} -> {}", url, record.id);
            return Ok(record);
        }

        let key = self.flight_key(url);
        let rx = match self.admit(&key) {
            Admission::Joined(rx) => {
                tracing::debug!("Joining in-flight extraction {}", key);
                rx
            },
            Admission::Leader(tx, rx) => {
                // A flight that finished between the cache check and admission
                // has already stored its record.
                if let Some(record) = self.cached(url).await {
                    self.finish(&key, &tx, Ok(record));
                } else {
                    let service = self.clone();
                    let url = url.to_string();
                    tokio::spawn(async move { service.run_flight(url, key, tx).await });
                }
                rx
            },
        };

        self.wait(rx).await
    }

    /// Where `source_url` currently is in its lifecycle, if anywhere
    pub async fn state(&self, source_url: &str) -> Option<ArtifactState> {
        let url = source_url.trim();
        let key = self.flight_key(url);
        if self.lock_flights().contains_key(&key) {
            return Some(ArtifactState::Pending);
        }
        self.cached(url).await.map(|record| record.state)
    }

    /// Number of extractions currently running
    pub fn in_flight(&self) -> usize {
        self.lock_flights().len()
    }

    fn lock_flights(&self) -> MutexGuard<'_, Flights> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn known_id(&self, url: &str) -> Option<String> {
        self.extractor.source_id(url).or_else(|| {
            self.aliases
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(url)
                .cloned()
        })
    }

    fn flight_key(&self, url: &str) -> String {
        match self.known_id(url) {
            Some(id) => format!("id:{}", id),
            None => format!("url:{}", url),
        }
    }

    async fn cached(&self, url: &str) -> Option<ArtifactRecord> {
        let id = self.known_id(url)?;
        match self.store.get(&id).await {
            Ok(record) => Some(record),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => {
                tracing::warn!("Cache lookup for {} failed: {}", id, e);
                None
            },
        }
    }

    fn admit(&self, key: &str) -> Admission {
        let mut flights = self.lock_flights();
        if let Some(rx) = flights.get(key) {
            return Admission::Joined(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        flights.insert(key.to_string(), rx.clone());
        Admission::Leader(tx, rx)
    }

    async fn wait(
        &self,
        mut rx: watch::Receiver<FlightOutcome>,
    ) -> Result<ArtifactRecord, ServiceError> {
        let waited = tokio::time::timeout(self.config.timeout(), async {
            rx.wait_for(Option::is_some)
                .await
                .map(|outcome| (*outcome).clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(outcome))) => outcome,
            Ok(Ok(None)) | Ok(Err(_)) => Err(ServiceError::Internal(
                "extraction ended without an outcome".to_string(),
            )),
            Err(_) => {
                tracing::warn!(
                    "Gave up waiting for extraction after {:?}; it continues in the background",
                    self.config.timeout()
                );
                Err(ServiceError::ExtractionFailed(
                    "timed out waiting for extraction".to_string(),
                ))
            },
        }
    }

    async fn run_flight(self, url: String, key: String, tx: watch::Sender<FlightOutcome>) {
        tracing::info!("Starting extraction for {}", url);
        let hard_limit = self.config.hard_limit();
        let result = match tokio::time::timeout(hard_limit, self.extract_and_store(&url)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::ExtractionFailed(format!(
                "extraction exceeded {:?}",
                hard_limit
            ))),
        };

        match &result {
            Ok(record) => {
                tracing::info!("Artifact {} ready for {}", record.id, url);
                self.remember_alias(&url, &record.id);
            },
            Err(e) => tracing::error!("Extraction for {} failed: {}", url, e),
        }
        self.finish(&key, &tx, result);
    }

    /// Publish the outcome to every waiter and release the in-flight marker
    fn finish(
        &self,
        key: &str,
        tx: &watch::Sender<FlightOutcome>,
        result: Result<ArtifactRecord, ServiceError>,
    ) {
        tx.send_replace(Some(result));
        self.lock_flights().remove(key);
    }

    fn remember_alias(&self, url: &str, id: &str) {
        if self.extractor.source_id(url).is_some() {
            return;
        }
        let mut aliases = self.aliases.write().unwrap_or_else(PoisonError::into_inner);
        if aliases.len() >= MAX_ALIASES {
            aliases.clear();
        }
        aliases.insert(url.to_string(), id.to_string());
    }

    async fn extract_and_store(&self, url: &str) -> Result<ArtifactRecord, ServiceError> {
        let staging = self.store.stage()?;
        let extraction = self
            .extractor
            .extract(url, staging.path())
            .await
            .map_err(|e| match e {
                ExtractError::Unavailable(msg) => ServiceError::SourceUnavailable(msg),
                ExtractError::Failed(msg) => ServiceError::ExtractionFailed(msg),
            })?;

        verify_output(&extraction, staging.path()).await?;

        let draft = ArtifactDraft {
            id: extraction.id,
            title: extraction.title,
            thumbnail_url: extraction.thumbnail_url,
            staged_path: extraction.file_path,
        };
        match self.store.put(draft).await {
            Ok(record) => Ok(record),
            Err(StoreError::DuplicateId(id)) => {
                tracing::debug!("Artifact {} already stored, discarding new copy", id);
                Ok(self.store.get(&id).await?)
            },
            Err(e) => Err(e.into()),
        }
    }
}

/// Trim and sanity check a source URL before any work starts
fn validate_source_url(source_url: &str) -> Result<&str, ServiceError> {
    let url = source_url.trim();
    if url.is_empty() {
        return Err(ServiceError::InvalidRequest("URL is required.".to_string()));
    }

    let lower = url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .ok_or_else(|| ServiceError::InvalidRequest("URL must use http or https.".to_string()))?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || url.chars().any(char::is_whitespace) {
        return Err(ServiceError::InvalidRequest("URL is malformed.".to_string()));
    }
    Ok(url)
}

/// The extractor's success is advisory: the file must exist inside the
/// staging area, be a regular file and be non-empty.
async fn verify_output(extraction: &Extraction, staging: &std::path::Path) -> Result<(), ServiceError> {
    validate_id(&extraction.id).map_err(|reason| {
        ServiceError::ExtractionFailed(format!("extractor returned unusable id: {}", reason))
    })?;
    if !extraction.file_path.starts_with(staging) {
        return Err(ServiceError::ExtractionFailed(format!(
            "extractor wrote outside its staging area: {}",
            extraction.file_path.display()
        )));
    }
    match tokio::fs::metadata(&extraction.file_path).await {
        Ok(m) if m.is_file() && m.len() > 0 => Ok(()),
        Ok(_) => Err(ServiceError::ExtractionFailed(format!(
            "output {} is empty",
            extraction.file_path.display()
        ))),
        Err(e) => Err(ServiceError::ExtractionFailed(format!(
            "output {} is missing: {}",
            extraction.file_path.display(),
            e
        ))),
    }
}
