use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::{
    config::{DatasetSpec, DatasetsConfig},
    error::{is_transient_status, EngineError, ErrorExt, Result},
};

const PAGE_RETRIES: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct RowsPage {
    rows: Vec<RowEntry>,
    num_rows_total: usize,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    row: Value,
}

/// Pages dataset rows from the hub datasets server, with a JSONL cache
pub struct DatasetFetcher {
    client: reqwest::Client,
    endpoint: String,
    data_dir: PathBuf,
    page_size: usize,
    max_rows: Option<usize>,
}

impl DatasetFetcher {
    pub fn new(config: &DatasetsConfig, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mushroom-ai/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            data_dir: data_dir.into(),
            page_size: config.page_size.clamp(1, 100),
            max_rows: config.max_rows,
        })
    }

    /// `<data_dir>/<dataset>/<config>-<split>.jsonl`
    pub fn cache_path(&self, source: &DatasetSpec) -> PathBuf {
        self.data_dir
            .join(&source.dataset)
            .join(format!("{}-{}.jsonl", source.config, source.split))
    }

    /// Raw rows of one split, from the cache when present
    pub async fn fetch_rows(&self, source: &DatasetSpec) -> Result<Vec<Value>> {
        let cache = self.cache_path(source);
        if tokio::fs::try_exists(&cache).await? {
            let mut rows = read_jsonl(&cache).await?;
            if let Some(max) = self.max_rows {
                rows.truncate(max);
            }
            tracing::info!(dataset = %source.dataset, split = %source.split, rows = rows.len(), "using cached rows");
            return Ok(rows);
        }

        let (rows, total) = self.fetch_remote(source).await?;
        // a capped fetch is not the whole split, so it is not cached
        if rows.len() >= total {
            write_jsonl(&cache, &rows).await?;
        }
        Ok(rows)
    }

    async fn fetch_remote(&self, source: &DatasetSpec) -> Result<(Vec<Value>, usize)> {
        let mut rows = Vec::new();
        let mut limit = self.max_rows.unwrap_or(usize::MAX);
        let mut total = usize::MAX;

        while rows.len() < limit {
            let length = self.page_size.min(limit - rows.len());
            let page = self.fetch_page(source, rows.len(), length).await?;
            total = page.num_rows_total;
            limit = limit.min(total);
            if page.rows.is_empty() {
                break;
            }
            rows.extend(page.rows.into_iter().map(|entry| entry.row));
        }
        rows.truncate(limit);

        tracing::info!(
            dataset = %source.dataset,
            split = %source.split,
            rows = rows.len(),
            total,
            "fetched rows"
        );
        Ok((rows, total))
    }

    async fn fetch_page(&self, source: &DatasetSpec, offset: usize, length: usize) -> Result<RowsPage> {
        let mut attempt = 0;
        loop {
            match self.fetch_page_once(source, offset, length).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < PAGE_RETRIES => {
                    attempt += 1;
                    tracing::warn!(dataset = %source.dataset, offset, attempt, "row request failed, retrying: {e}");
                    tokio::time::sleep(RETRY_DELAY * attempt as u32).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_page_once(&self, source: &DatasetSpec, offset: usize, length: usize) -> Result<RowsPage> {
        let url = format!("{}/rows", self.endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("dataset", source.dataset.as_str()),
                ("config", source.config.as_str()),
                ("split", source.split.as_str()),
            ])
            .query(&[("offset", offset), ("length", length)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Download {
                url: format!("{url}?dataset={}&split={}", source.dataset, source.split),
                message: format!("HTTP {status}"),
                retryable: is_transient_status(status),
            });
        }
        Ok(response.json().await?)
    }

    /// Dialogue texts of one split; rows without text are dropped
    pub async fn load_texts(&self, source: &DatasetSpec) -> Result<Vec<String>> {
        let rows = self.fetch_rows(source).await?;
        let texts: Vec<String> = rows.iter().filter_map(dialogue_text).collect();
        if texts.len() < rows.len() {
            tracing::debug!(
                dataset = %source.dataset,
                dropped = rows.len() - texts.len(),
                "rows without dialogue text"
            );
        }
        Ok(texts)
    }

    /// Texts of all sources, concatenated in order
    pub async fn load_corpus(&self, sources: &[DatasetSpec]) -> Result<Vec<String>> {
        let mut corpus = Vec::new();
        for source in sources {
            corpus.extend(self.load_texts(source).await?);
        }
        Ok(corpus)
    }
}

/// Flatten a dataset row into one training text.
///
/// Rows carry either a `dialog` column (a list of turns or a string), the
/// Blended Skill Talk layout (`previous_utterance` followed by alternating
/// `free_messages` and `guided_messages`), or a plain `text` column.
pub fn dialogue_text(row: &Value) -> Option<String> {
    let text = match row.get("dialog") {
        Some(Value::Array(turns)) => join_turns(turns.iter()),
        Some(Value::String(s)) => s.clone(),
        _ if row.get("free_messages").is_some() => blended_skill_talk_text(row),
        _ => row.get("text")?.as_str()?.to_string(),
    };

    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn blended_skill_talk_text(row: &Value) -> String {
    let free = list_field(row, "free_messages");
    let guided = list_field(row, "guided_messages");
    let mut turns: Vec<&Value> = list_field(row, "previous_utterance").iter().collect();
    for i in 0..free.len().max(guided.len()) {
        turns.extend(free.get(i));
        turns.extend(guided.get(i));
    }
    join_turns(turns.into_iter())
}

fn list_field<'a>(row: &'a Value, key: &str) -> &'a [Value] {
    row.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn join_turns<'a>(turns: impl Iterator<Item = &'a Value>) -> String {
    turns
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

async fn read_jsonl(path: &Path) -> Result<Vec<Value>> {
    let raw = tokio::fs::read_to_string(path).await?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(EngineError::from))
        .collect()
}

async fn write_jsonl(path: &Path, rows: &[Value]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut buf = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buf, row)?;
        buf.push(b'\n');
    }
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(&buf).await?;
    file.flush().await?;
    Ok(())
}
