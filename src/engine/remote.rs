use std::time::{Duration, Instant};

use crate::{
    error::{EngineError, Result},
    types::{Completion, ErrorBody, GenerateRequest, GenerateResponse},
};

use super::Completer;

const GENERATE_PATH: &str = "/api/chat/generate";

/// Completer that forwards prompts to a running chat server
pub struct RemoteCompleter {
    client: reqwest::Client,
    url: String,
}

impl RemoteCompleter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), GENERATE_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Completer for RemoteCompleter {
    async fn complete(&self, prompt: &str) -> Result<Completion> {
        let start_time = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .json(&GenerateRequest::new(prompt))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<ErrorBody>().await {
                Ok(ErrorBody {
                    error,
                    details: Some(details),
                }) => format!("{error}: {details}"),
                Ok(ErrorBody { error, .. }) => error,
                Err(_) => "unreadable error body".to_string(),
            };
            return Err(EngineError::Generation(format!("server returned {status}: {detail}")));
        }

        let body: GenerateResponse = response.json().await?;
        let mut completion = Completion::text(body.response);
        completion.processing_time = start_time.elapsed();
        Ok(completion)
    }
}
