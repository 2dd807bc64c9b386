//! Natural-language query translation: questions to Athena SQL, descriptions
//! to GitHub search queries.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::info;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, LlmProvider};

const QUERY_TEMPERATURE: f32 = 0.5;
const QUERY_MAX_TOKENS: u32 = 500;

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*\n?(.*?)\s*```$").expect("valid code fence regex")
});

/// Turns plain-language requests into queries with a single model call.
pub struct QueryTranslator {
    llm: Arc<dyn LlmProvider>,
}

impl QueryTranslator {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Generate SQL answering `question` against the table described by
    /// `table_ddl`.
    pub async fn to_sql(&self, question: &str, table_ddl: &str) -> Result<String, LlmError> {
        let prompt = format!(
            "Given the following Athena table DDL:\n\
             {table_ddl}\n\
             \n\
             Generate an SQL query to answer the following question:\n\
             {question}\n\
             \n\
             SQL Query:\n"
        );
        let sql = self.translate(prompt).await?;
        info!(chars = sql.len(), "Generated SQL query");
        Ok(sql)
    }

    /// Generate a GitHub search query matching `description`.
    pub async fn to_github_query(&self, description: &str) -> Result<String, LlmError> {
        let prompt = format!(
            "Convert the following description into a GitHub search query:\n\
             {description}\n\
             \n\
             GitHub Search Query:\n"
        );
        self.translate(prompt).await
    }

    async fn translate(&self, prompt: String) -> Result<String, LlmError> {
        let request = CompletionRequest::new(prompt)
            .with_temperature(QUERY_TEMPERATURE)
            .with_max_tokens(QUERY_MAX_TOKENS);
        let response = self.llm.complete(request).await?;

        let query = unwrap_code_fence(response.content.trim());
        if query.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "model returned an empty query".into(),
            });
        }
        Ok(query.to_string())
    }
}

/// Strip a surrounding Markdown code fence, if any.
fn unwrap_code_fence(text: &str) -> &str {
    match CODE_FENCE.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::CompletionResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CannedLlm {
        answer: String,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedLlm {
        fn new(answer: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.into(),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for CannedLlm {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            assert_eq!(request.temperature, Some(QUERY_TEMPERATURE));
            self.prompts.lock().unwrap().push(request.prompt);
            Ok(CompletionResponse {
                content: self.answer.clone(),
                ..Default::default()
            })
        }
    }

    const DDL: &str = "CREATE EXTERNAL TABLE sales (id INT, total_amount DECIMAL(10, 2))";

    #[tokio::test]
    async fn sql_prompt_includes_ddl_and_question() {
        let llm = CannedLlm::new("  SELECT 1;  \n");
        let translator = QueryTranslator::new(llm.clone());

        let sql = translator
            .to_sql("What is the total sales amount?", DDL)
            .await
            .unwrap();
        assert_eq!(sql, "SELECT 1;");

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].starts_with("Given the following Athena table DDL:\n"));
        assert!(prompts[0].contains(DDL));
        assert!(prompts[0].contains("What is the total sales amount?"));
        assert!(prompts[0].ends_with("SQL Query:\n"));
    }

    #[tokio::test]
    async fn fenced_sql_is_unwrapped() {
        let llm = CannedLlm::new("```sql\nSELECT product_id, SUM(total_amount)\nFROM sales\n```");
        let sql = QueryTranslator::new(llm)
            .to_sql("totals per product", DDL)
            .await
            .unwrap();
        assert_eq!(sql, "SELECT product_id, SUM(total_amount)\nFROM sales");
    }

    #[tokio::test]
    async fn github_query_prompt() {
        let llm = CannedLlm::new("language:python topic:image-classification");
        let translator = QueryTranslator::new(llm.clone());
        let q = translator
            .to_github_query("Python image classification repos")
            .await
            .unwrap();
        assert_eq!(q, "language:python topic:image-classification");
        assert!(llm.prompts.lock().unwrap()[0].ends_with("GitHub Search Query:\n"));
    }

    #[tokio::test]
    async fn empty_output_is_invalid_response() {
        let llm = CannedLlm::new("   ");
        let err = QueryTranslator::new(llm).to_sql("q", DDL).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }

    #[test]
    fn unfenced_text_is_unchanged() {
        assert_eq!(unwrap_code_fence("SELECT 1"), "SELECT 1");
        assert_eq!(unwrap_code_fence("```\nSELECT 2\n```"), "SELECT 2");
    }
}
