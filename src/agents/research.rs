use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tracing::info;

use crate::llm::{CallOptions, Completion};
use crate::prompts::{PromptTemplates, render};
use crate::types::ExtractedKnowledge;

use super::{Agent, AgentError};

/// One CSV export to mine.
#[derive(Debug, Clone)]
pub struct CsvInput {
    pub filename: String,
    pub content: String,
}

/// Turns a CSV export of articles into free-text knowledge for the store.
#[derive(Clone)]
pub struct ResearchAgent {
    llm: Arc<dyn Completion>,
    prompts: Arc<PromptTemplates>,
    options: CallOptions,
}

impl ResearchAgent {
    /// `options` should already carry the research call budget (see [`ResearchAgent::call_options`]).
    pub fn new(llm: Arc<dyn Completion>, prompts: Arc<PromptTemplates>, options: CallOptions) -> Self {
        Self { llm, prompts, options }
    }

    /// Long-form extraction: more tokens, more patience.
    pub fn call_options(base: CallOptions) -> CallOptions {
        CallOptions { temperature: 0.1, ..base }
            .with_max_tokens(3000)
            .with_retries(5, 3.0)
            .with_timeout(60)
    }
}

#[async_trait]
impl Agent for ResearchAgent {
    type Input = CsvInput;
    type Output = ExtractedKnowledge;

    async fn execute(&self, input: &Self::Input) -> Result<Self::Output, AgentError> {
        info!("ResearchAgent: extracting knowledge from {}", input.filename);
        let prompt = render(
            &self.prompts.csv_analysis,
            &[("filename", &input.filename), ("csv_content", &input.content)],
        )?;
        let text = self
            .llm
            .complete(&self.prompts.research_system, &prompt, &self.options)
            .await?;
        info!("ResearchAgent: received {} characters for {}", text.chars().count(), input.filename);

        Ok(ExtractedKnowledge {
            extracted_knowledge: text,
            filename: input.filename.clone(),
            timestamp: Local::now().to_rfc3339(),
        })
    }
}
