//! Answer synthesis: renders the answer prompt and asks the model once.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, LlmProvider};

/// Question plus retrieved context. Both are always present; `context` may
/// be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub question: String,
    pub context: String,
}

impl SynthesisRequest {
    pub fn new(question: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            context: context.into(),
        }
    }

    /// Substitute question and context into the answer template verbatim.
    pub fn render_prompt(&self) -> String {
        format!(
            "Based on the following question from an email:\n\
             {question}\n\
             \n\
             And the following information from Confluence:\n\
             {confluence_info}\n\
             \n\
             Please draft a response to the email:\n",
            question = self.question,
            confluence_info = self.context,
        )
    }
}

/// Something that turns a rendered prompt into answer text.
#[async_trait]
pub trait ResponseSynthesizer: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Sampling settings for answer generation.
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 500,
        }
    }
}

/// [`ResponseSynthesizer`] backed by an [`LlmProvider`].
pub struct LlmSynthesizer {
    llm: Arc<dyn LlmProvider>,
    config: SynthesisConfig,
}

impl LlmSynthesizer {
    pub fn new(llm: Arc<dyn LlmProvider>, config: SynthesisConfig) -> Self {
        Self { llm, config }
    }
}

#[async_trait]
impl ResponseSynthesizer for LlmSynthesizer {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let request = CompletionRequest::new(prompt)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);

        let response = self.llm.complete(request).await?;
        debug!(
            model = self.llm.model_name(),
            chars = response.content.len(),
            "Answer generated"
        );
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::CompletionResponse;
    use std::sync::Mutex;

    /// Records the last request and echoes a fixed answer.
    struct RecordingLlm {
        answer: String,
        last: Mutex<Option<CompletionRequest>>,
    }

    #[async_trait]
    impl LlmProvider for RecordingLlm {
        fn model_name(&self) -> &str {
            "recording"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            *self.last.lock().unwrap() = Some(request);
            Ok(CompletionResponse {
                content: self.answer.clone(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn prompt_matches_template() {
        let prompt = SynthesisRequest::new(
            "How do I reset my password?",
            "Reset via settings page.\n\n",
        )
        .render_prompt();
        let expected = concat!(
            "Based on the following question from an email:\n",
            "How do I reset my password?\n",
            "\n",
            "And the following information from Confluence:\n",
            "Reset via settings page.\n\n",
            "\n\n",
            "Please draft a response to the email:\n",
        );
        assert_eq!(prompt, expected);
    }

    #[test]
    fn empty_fields_still_render_every_section() {
        let prompt = SynthesisRequest::new("", "").render_prompt();
        assert!(prompt.starts_with("Based on the following question from an email:\n\n"));
        assert!(prompt.contains("And the following information from Confluence:\n\n"));
        assert!(prompt.ends_with("Please draft a response to the email:\n"));
    }

    #[test]
    fn placeholders_in_question_are_not_expanded() {
        let prompt = SynthesisRequest::new("{confluence_info}", "ctx").render_prompt();
        assert!(prompt.contains("email:\n{confluence_info}\n"));
        assert_eq!(prompt.matches("ctx").count(), 1);
    }

    #[tokio::test]
    async fn llm_synthesizer_sends_prompt_with_sampling() {
        let llm = Arc::new(RecordingLlm {
            answer: "  Use Settings.  ".into(),
            last: Mutex::new(None),
        });
        let synth = LlmSynthesizer::new(llm.clone(), SynthesisConfig::default());

        let out = synth.generate("the prompt").await.unwrap();
        assert_eq!(out, "  Use Settings.  ");

        let req = llm.last.lock().unwrap().clone().unwrap();
        assert_eq!(req.prompt, "the prompt");
        assert_eq!(req.temperature, Some(0.7));
        assert_eq!(req.max_tokens, Some(500));
    }
}
