pub mod ytdlp;

use std::path::{Path, PathBuf};

pub use ytdlp::YtDlpExtractor;

/// What an extractor reports after a conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub id: String,
    pub title: Option<String>,
    pub thumbnail_url: Option<String>,
    /// Where the extractor claims it wrote the audio. Not trusted until checked.
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    /// The source cannot be fetched: bad URL, private, removed, region locked
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The source was reached but no usable audio came out
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Turns a source URL into an audio file
#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    /// Canonical artifact id for `url`, if it can be derived without
    /// contacting the source.
    fn source_id(&self, _url: &str) -> Option<String> {
        None
    }

    /// Extract audio from `url`, writing output only inside `workdir`
    async fn extract(&self, url: &str, workdir: &Path) -> Result<Extraction, ExtractError>;
}

const YOUTUBE_ID_LENGTH: usize = 11;

/// Extract the video id from the common YouTube URL shapes.
///
/// Handles `watch?v=`, `youtu.be/`, `/shorts/`, `/embed/`, `/live/` and `/v/`
/// on youtube.com and its `www.`, `m.` and `music.` subdomains.
pub fn youtube_video_id(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    let (host, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx + 1..]),
        None => return None,
    };
    let host = host.to_ascii_lowercase();
    let host = host.split(':').next().unwrap_or_default();
    let (path, query) = match path_and_query.find('?') {
        Some(idx) => (&path_and_query[..idx], &path_and_query[idx + 1..]),
        None => (path_and_query, ""),
    };
    let path = path.split('#').next().unwrap_or_default();

    let candidate = match host {
        "youtu.be" | "www.youtu.be" => path.split('/').next(),
        "youtube.com" | "www.youtube.com" | "m.youtube.com" | "music.youtube.com" => {
            let mut segments = path.split('/');
            match segments.next() {
                Some("watch") => query
                    .split('&')
                    .filter_map(|pair| pair.split_once('='))
                    .find(|(key, _)| *key == "v")
                    .map(|(_, value)| value.split('#').next().unwrap_or_default()),
                Some("shorts") | Some("embed") | Some("live") | Some("v") => segments.next(),
                _ => None,
            }
        },
        _ => None,
    }?;

    let is_valid = candidate.len() == YOUTUBE_ID_LENGTH
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    is_valid.then(|| candidate.to_string())
}
