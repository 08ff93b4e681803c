//! Engine module providing the completion backends and the interactive loop

mod builder;
mod chat;
mod engine;
mod remote;

pub use builder::EngineBuilder;
pub use chat::{ChatLoop, PROMPT_LABEL};
pub use engine::{CompletionEngine, EngineInfo};
pub use remote::RemoteCompleter;

use crate::{error::Result, types::Completion};

/// Anything that turns a prompt into a completion
#[async_trait::async_trait]
pub trait Completer: Send + Sync {
    /// Complete a single prompt
    async fn complete(&self, prompt: &str) -> Result<Completion>;
}

#[async_trait::async_trait]
impl<T: Completer + ?Sized> Completer for std::sync::Arc<T> {
    async fn complete(&self, prompt: &str) -> Result<Completion> {
        (**self).complete(prompt).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::EngineError;

    /// Echoes the prompt back, or fails when the prompt is "fail"
    pub(crate) struct MockCompleter;

    #[async_trait::async_trait]
    impl Completer for MockCompleter {
        async fn complete(&self, prompt: &str) -> Result<Completion> {
            match prompt {
                "fail" => Err(EngineError::Generation("mock failure".to_string())),
                "silent" => Ok(Completion::text("")),
                _ => Ok(Completion::text(format!("echo: {prompt}"))),
            }
        }
    }

    #[tokio::test]
    async fn test_mock_completer() {
        let completer = std::sync::Arc::new(MockCompleter);
        let result = completer.complete("test").await.unwrap();
        assert_eq!(result.text, "echo: test");
        assert!(completer.complete("fail").await.is_err());
    }
}
