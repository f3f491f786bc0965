use super::{youtube_video_id, ExtractError, Extraction, Extractor};
use crate::services::ExtractionConfig;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Subset of the info JSON yt-dlp prints with `--dump-json`
#[derive(Debug, Deserialize)]
struct InfoJson {
    id: String,
    title: Option<String>,
    thumbnail: Option<String>,
}

/// Extractor backed by the `yt-dlp` executable
pub struct YtDlpExtractor {
    config: ExtractionConfig,
}

impl YtDlpExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    fn command(&self, url: &str, workdir: &Path) -> Command {
        let template = workdir.join("%(id)s.%(ext)s");
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.extra_args)
            .args(["--format", "bestaudio/best", "--extract-audio"])
            .arg("--audio-format")
            .arg(&self.config.audio_format)
            .arg("--audio-quality")
            .arg(&self.config.audio_quality)
            .args([
                "--no-playlist",
                "--geo-bypass",
                "--no-check-certificates",
                "--no-progress",
                "--no-mtime",
                "--dump-json",
                "--no-simulate",
            ])
            .arg("--output")
            .arg(template)
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl Extractor for YtDlpExtractor {
    fn source_id(&self, url: &str) -> Option<String> {
        youtube_video_id(url)
    }

    async fn extract(&self, url: &str, workdir: &Path) -> Result<Extraction, ExtractError> {
        tracing::debug!("Running {} for {}", self.config.program, url);
        let output = self
            .command(url, workdir)
            .output()
            .await
            .map_err(|e| ExtractError::Failed(format!("failed to run {}: {}", self.config.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, output.status.code()));
        }

        let info = parse_info(&output.stdout)?;
        let file_path = workdir.join(format!("{}.{}", info.id, self.config.audio_format));
        Ok(Extraction {
            id: info.id,
            title: info.title,
            thumbnail_url: info.thumbnail,
            file_path,
        })
    }
}

/// Take the last JSON object on stdout; yt-dlp may print warnings first.
fn parse_info(stdout: &[u8]) -> Result<InfoJson, ExtractError> {
    let stdout = String::from_utf8_lossy(stdout);
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<InfoJson>(line).ok())
        .ok_or_else(|| ExtractError::Failed("extractor printed no metadata".to_string()))
}

/// Map a failed run onto the error taxonomy.
///
/// yt-dlp reports unreachable sources with `ERROR:` lines. Post-processing
/// (ffmpeg) problems also use `ERROR:` but mean the source itself was fine.
fn classify_failure(stderr: &str, code: Option<i32>) -> ExtractError {
    let error_line = stderr
        .lines()
        .find(|line| line.starts_with("ERROR:"))
        .map(|line| line.trim_start_matches("ERROR:").trim().to_string());

    match error_line {
        Some(line) if is_postprocessing_error(&line) => ExtractError::Failed(line),
        Some(line) => ExtractError::Unavailable(line),
        None => ExtractError::Failed(match code {
            Some(code) => format!("extractor exited with status {}", code),
            None => "extractor terminated by signal".to_string(),
        }),
    }
}

fn is_postprocessing_error(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("postprocessing") || lower.contains("ffmpeg") || lower.contains("ffprobe")
}
