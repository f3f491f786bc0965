use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Longest identifier accepted as an artifact key.
pub const ID_MAX_LENGTH: usize = 128;

/// Artifact lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    Pending,
    Ready,
    Failed,
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactState::Pending => "pending",
            ArtifactState::Ready => "ready",
            ArtifactState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A converted audio file tracked by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub path: PathBuf,
    pub title: Option<String>,
    pub thumbnail_url: Option<String>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub state: ArtifactState,
}

impl ArtifactRecord {
    /// Age of the artifact relative to `now`. Negative ages clamp to zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }

    /// Title shown to clients, falling back to the id when the extractor gave none.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }

    /// File name under which the artifact is served, e.g. `abc123.mp3`
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Validate an artifact identifier.
///
/// Identifiers become file names, so only ASCII alphanumerics, `-` and `_`
/// are accepted. This rules out path separators and parent references.
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("identifier is empty".to_string());
    }
    if id.len() > ID_MAX_LENGTH {
        return Err(format!(
            "identifier exceeds {} characters",
            ID_MAX_LENGTH
        ));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!("identifier contains invalid character '{}'", bad));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod validate {
        use super::*;

        #[test]
        fn accepts_youtube_style_ids() {
            assert!(validate_id("dQw4w9WgXcQ").is_ok());
            assert!(validate_id("a-b_c").is_ok());
        }

        #[test]
        fn rejects_empty() {
            assert!(validate_id("").is_err());
        }

        #[test]
        fn rejects_traversal() {
            assert!(validate_id("..").is_err());
            assert!(validate_id("../etc/passwd").is_err());
            assert!(validate_id("a/b").is_err());
            assert!(validate_id("a\\b").is_err());
        }

        #[test]
        fn rejects_dots_and_spaces() {
            assert!(validate_id("song.mp3").is_err());
            assert!(validate_id("my song").is_err());
        }

        #[test]
        fn rejects_overlong() {
            let id = "a".repeat(ID_MAX_LENGTH + 1);
            assert!(validate_id(&id).is_err());
            assert!(validate_id(&"a".repeat(ID_MAX_LENGTH)).is_ok());
        }
    }

    mod record {
        use super::*;

        fn record(title: Option<&str>) -> ArtifactRecord {
            ArtifactRecord {
                id: "abc".to_string(),
                path: PathBuf::from("/tmp/store/abc.mp3"),
                title: title.map(String::from),
                thumbnail_url: None,
                size: 3,
                created_at: Utc::now(),
                state: ArtifactState::Ready,
            }
        }

        #[test]
        fn display_title_falls_back_to_id() {
            assert_eq!(record(None).display_title(), "abc");
            assert_eq!(record(Some("Song")).display_title(), "Song");
        }

        #[test]
        fn file_name_comes_from_path() {
            assert_eq!(record(None).file_name(), "abc.mp3");
        }

        #[test]
        fn age_never_negative() {
            let r = record(None);
            let earlier = r.created_at - chrono::Duration::seconds(10);
            assert_eq!(r.age_at(earlier), chrono::Duration::zero());
        }

        #[test]
        fn state_serializes_lowercase() {
            let json = serde_json::to_string(&ArtifactState::Ready).unwrap();
            assert_eq!(json, "\"ready\"");
        }
    }
}
