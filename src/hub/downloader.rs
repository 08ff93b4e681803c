use std::path::{Path, PathBuf};
use std::time::Duration;

use hf_hub::{api::RepoInfo, Cache, Repo, RepoType};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::CONTENT_LENGTH;
use tokio::io::AsyncWriteExt;

use crate::{
    config::HubConfig,
    error::{is_transient_status, EngineError, ErrorExt, Result},
};

const LINKED_SIZE: &str = "x-linked-size";

const PROGRESS_TEMPLATE: &str =
    "{msg} {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})";

/// Summary of a model download
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Files fetched in this run
    pub files: Vec<String>,
    /// Bytes written in this run
    pub bytes: u64,
    /// Files already present with the expected size
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Downloaded(u64),
    Skipped,
}

/// Downloads the files of one hub repository
pub struct Downloader {
    config: HubConfig,
    token: Option<String>,
    client: reqwest::Client,
    show_progress: bool,
    retry_delay: Duration,
}

impl Downloader {
    pub fn new(config: HubConfig) -> Result<Self> {
        // explicit token or HF_TOKEN, then the token saved by `huggingface-cli login`
        let token = config.resolved_token().or_else(|| Cache::default().token());
        let client = reqwest::Client::builder()
            .user_agent(concat!("mushroom-ai/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            config,
            token,
            client,
            show_progress: true,
            retry_delay: Duration::from_secs(1),
        })
    }

    /// Draw progress bars on stderr (on by default)
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Base delay between attempts; attempt `n` waits `n` times this long
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn repo_id(&self) -> &str {
        &self.config.repo_id
    }

    /// Resolve URL of a repository file
    pub fn file_url(&self, name: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.repo_id,
            self.config.revision,
            name
        )
    }

    /// Repository files matching the allow patterns, sorted by name
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let repo = Repo::with_revision(
            self.config.repo_id.clone(),
            RepoType::Model,
            self.config.revision.clone(),
        );
        let url = format!(
            "{}/api/{}",
            self.config.endpoint.trim_end_matches('/'),
            repo.api_url()
        );

        let response = self.request(reqwest::Method::GET, &url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Download {
                url,
                message: format!("HTTP {status}"),
                retryable: is_transient_status(status),
            });
        }
        let info: RepoInfo = response.json().await?;

        let mut files: Vec<String> = info
            .siblings
            .into_iter()
            .map(|sibling| sibling.rfilename)
            .filter(|name| {
                self.config
                    .allow_patterns
                    .iter()
                    .any(|pattern| matches_pattern(pattern, name))
            })
            .collect();
        files.sort();
        tracing::debug!(repo = %self.config.repo_id, count = files.len(), "listed repository files");
        Ok(files)
    }

    /// Download one file into `dest`, retrying transient failures
    pub async fn download_file(&self, name: &str, dest: &Path) -> Result<FileOutcome> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(name, dest).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.retry_delay * attempt as u32;
                    tracing::warn!(file = name, attempt, ?delay, "download failed, retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(file = name, "Error downloading file: {e}");
                    return Err(e);
                }
            }
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Size announced by a HEAD request, `None` when the server does not say
    async fn remote_size(&self, url: &str) -> Result<Option<u64>> {
        let response = self.request(reqwest::Method::HEAD, url).send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        // the hub answers with x-linked-size for LFS files
        let size = [LINKED_SIZE, CONTENT_LENGTH.as_str()]
            .iter()
            .find_map(|header| response.headers().get(*header))
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        Ok(size)
    }

    async fn fetch_once(&self, name: &str, dest: &Path) -> Result<FileOutcome> {
        let url = self.file_url(name);
        let target = dest.join(name);

        if let Ok(meta) = tokio::fs::metadata(&target).await {
            if self.remote_size(&url).await? == Some(meta.len()) {
                tracing::info!(file = name, "already present, skipping");
                return Ok(FileOutcome::Skipped);
            }
        }

        let response = self.request(reqwest::Method::GET, &url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Download {
                url,
                message: format!("HTTP {status}"),
                retryable: is_transient_status(status),
            });
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = part_path(&target);
        let written = match self.stream_body(response, name, &url, &partial).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&partial, &target).await?;
        tracing::info!(file = name, bytes = written, "downloaded");
        Ok(FileOutcome::Downloaded(written))
    }

    /// Write the body to `partial`, failing when fewer bytes than announced arrive
    async fn stream_body(
        &self,
        mut response: reqwest::Response,
        name: &str,
        url: &str,
        partial: &Path,
    ) -> Result<u64> {
        let total = response.content_length();
        let mut file = tokio::fs::File::create(partial).await?;

        let bar = self.progress_bar(name, total);
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            bar.set_position(written);
        }
        file.flush().await?;
        bar.finish();

        match total {
            Some(total) if written != total => Err(EngineError::Download {
                url: url.to_string(),
                message: format!("received {written} of {total} bytes"),
                retryable: true,
            }),
            _ => Ok(written),
        }
    }

    fn progress_bar(&self, name: &str, total: Option<u64>) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        let style = ProgressStyle::with_template(PROGRESS_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        bar.set_style(style);
        bar.set_message(name.to_string());
        bar
    }

    /// Download every allowed file of the repository into `dest`
    pub async fn download_model(&self, dest: &Path) -> Result<DownloadReport> {
        tokio::fs::create_dir_all(dest).await?;
        tracing::info!(repo = %self.config.repo_id, dest = %dest.display(), "downloading model");

        let files = self.list_files().await?;
        if files.is_empty() {
            return Err(EngineError::Download {
                url: format!("{}/{}", self.config.endpoint, self.config.repo_id),
                message: "no repository files match the allow patterns".to_string(),
                retryable: false,
            });
        }
        self.download_files(&files, dest).await
    }

    /// Download a known list of files into `dest`
    pub async fn download_files(&self, files: &[String], dest: &Path) -> Result<DownloadReport> {
        let mut report = DownloadReport::default();
        for name in files {
            match self.download_file(name, dest).await? {
                FileOutcome::Downloaded(bytes) => {
                    report.bytes += bytes;
                    report.files.push(name.clone());
                }
                FileOutcome::Skipped => report.skipped += 1,
            }
        }
        tracing::info!(
            files = report.files.len(),
            skipped = report.skipped,
            bytes = report.bytes,
            "download finished"
        );
        Ok(report)
    }

    /// Create `dir` if needed and download the model only when it is empty.
    /// Returns `None` when the directory already had content.
    pub async fn ensure_model(&self, dir: &Path) -> Result<Option<DownloadReport>> {
        tokio::fs::create_dir_all(dir).await?;
        let mut entries = tokio::fs::read_dir(dir).await?;
        if entries.next_entry().await?.is_some() {
            tracing::info!(dir = %dir.display(), "model directory is not empty, skipping download");
            return Ok(None);
        }
        self.download_model(dir).await.map(Some)
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Glob match where `*` stands for any run of characters
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if p < pattern.len() && pattern[p] == name[n] {
            p += 1;
            n += 1;
        } else if let Some((star_p, star_n)) = star {
            // let the last star swallow one more character
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}
