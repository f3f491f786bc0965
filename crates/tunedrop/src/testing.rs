//! Test utilities for the tunedrop crate
//!
//! Provides a scriptable `Extractor` that never touches the network, so the
//! coordinator, store and HTTP layer can be exercised deterministically.

use crate::extractor::{ExtractError, Extraction, Extractor};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What a [`FakeExtractor`] does when asked to extract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Write `content_for(id)` and report success
    Produce,
    /// Report the source as unavailable
    Unavailable,
    /// Report a transcoding failure
    Fail,
    /// Report success without writing anything
    MissingFile,
    /// Report success after writing an empty file
    EmptyFile,
    /// Never return
    Hang,
}

/// Extractor double with a call counter.
///
/// The artifact id is the last path segment of the URL (query and fragment
/// stripped, other characters replaced by `_`) unless a fixed id is set.
pub struct FakeExtractor {
    behavior: FakeBehavior,
    delay: Duration,
    derive_ids: bool,
    fixed_id: Option<String>,
    calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::with_behavior(FakeBehavior::Produce)
    }

    pub fn with_behavior(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            derive_ids: false,
            fixed_id: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep this long before doing anything
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Let the coordinator compute ids from URLs up front
    pub fn deriving_ids(mut self) -> Self {
        self.derive_ids = true;
        self
    }

    /// Report the same id for every URL
    pub fn with_fixed_id(mut self, id: impl Into<String>) -> Self {
        self.fixed_id = Some(id.into());
        self
    }

    /// Number of times `extract` has been invoked
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Bytes written for an artifact with `id`
    pub fn content_for(id: &str) -> Vec<u8> {
        format!("fake-audio:{}", id).into_bytes()
    }

    pub fn id_for(url: &str) -> String {
        let without_query = url.split(['?', '#']).next().unwrap_or_default();
        let segment = without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let id: String = segment
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if id.is_empty() {
            "root".to_string()
        } else {
            id
        }
    }

    fn resolve_id(&self, url: &str) -> String {
        self.fixed_id.clone().unwrap_or_else(|| Self::id_for(url))
    }
}

impl Default for FakeExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Extractor for FakeExtractor {
    fn source_id(&self, url: &str) -> Option<String> {
        self.derive_ids.then(|| self.resolve_id(url))
    }

    async fn extract(&self, url: &str, workdir: &Path) -> Result<Extraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let id = self.resolve_id(url);
        let file_path = workdir.join(format!("{}.mp3", id));
        match self.behavior {
            FakeBehavior::Produce => {
                tokio::fs::write(&file_path, Self::content_for(&id))
                    .await
                    .map_err(|e| ExtractError::Failed(e.to_string()))?;
            },
            FakeBehavior::EmptyFile => {
                tokio::fs::write(&file_path, b"")
                    .await
                    .map_err(|e| ExtractError::Failed(e.to_string()))?;
            },
            FakeBehavior::MissingFile => {},
            FakeBehavior::Unavailable => {
                return Err(ExtractError::Unavailable(format!("{} is private", url)));
            },
            FakeBehavior::Fail => {
                return Err(ExtractError::Failed("encoder crashed".to_string()));
            },
            FakeBehavior::Hang => std::future::pending::<()>().await,
        }

        Ok(Extraction {
            title: Some(format!("Title of {}", id)),
            thumbnail_url: Some(format!("https://img.test/{}.jpg", id)),
            id,
            file_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn id_for_uses_last_segment() {
        assert_eq!(FakeExtractor::id_for("https://media.test/song-1"), "song-1");
        assert_eq!(FakeExtractor::id_for("https://media.test/a/b/?x=1"), "b");
        assert_eq!(FakeExtractor::id_for("https://media.test/s p.mp3"), "s_p_mp3");
    }

    #[tokio::test]
    async fn produce_writes_content_and_counts() {
        let dir = TempDir::new().unwrap();
        let fake = FakeExtractor::new();

        let extraction = fake.extract("https://media.test/x", dir.path()).await.unwrap();

        assert_eq!(fake.calls(), 1);
        assert_eq!(
            std::fs::read(&extraction.file_path).unwrap(),
            FakeExtractor::content_for("x")
        );
    }

    #[tokio::test]
    async fn missing_file_claims_success() {
        let dir = TempDir::new().unwrap();
        let fake = FakeExtractor::with_behavior(FakeBehavior::MissingFile);

        let extraction = fake.extract("https://media.test/x", dir.path()).await.unwrap();
        assert!(!extraction.file_path.exists());
    }
}
