use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::{error::Result, types::FALLBACK_RESPONSE};

use super::Completer;

/// Label printed before every prompt
pub const PROMPT_LABEL: &str = "Enter a prompt: ";

const EXIT_COMMANDS: [&str; 2] = ["exit", "quit"];

/// Interactive read-complete-print loop over any completer
pub struct ChatLoop<C> {
    completer: C,
}

impl<C: Completer> ChatLoop<C> {
    pub fn new(completer: C) -> Self {
        Self { completer }
    }

    /// Run until EOF or an exit command, returning the number of prompts answered
    pub async fn run<R, W>(&self, input: R, mut output: W) -> Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut answered = 0;

        loop {
            output.write_all(PROMPT_LABEL.as_bytes()).await?;
            output.flush().await?;

            let Some(line) = lines.next_line().await? else {
                output.write_all(b"\n").await?;
                break;
            };
            let prompt = line.trim();
            if prompt.is_empty() {
                continue;
            }
            if EXIT_COMMANDS.contains(&prompt.to_lowercase().as_str()) {
                break;
            }

            let response = self.respond(prompt).await;
            output.write_all(response.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
            answered += 1;
        }

        output.flush().await?;
        Ok(answered)
    }

    /// Completion text, or the fallback text when the completer fails
    pub async fn respond(&self, prompt: &str) -> String {
        match self.completer.complete(prompt).await {
            Ok(completion) => completion.text,
            Err(e) => {
                tracing::error!("Error generating response: {e}");
                FALLBACK_RESPONSE.to_string()
            }
        }
    }
}
