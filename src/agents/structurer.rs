use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::extract::fenced_block;
use crate::llm::{CallOptions, Completion};
use crate::prompts::{PromptTemplates, render};

use super::{Agent, AgentError};

/// Input text beyond this many characters is cut before prompting.
pub const MAX_INPUT_CHARS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct TextInput {
    pub filename: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct StructuredOutput {
    /// Model output with any ```json fence removed.
    pub content: String,
    pub valid_json: bool,
}

/// Converts a regulatory notice into the fixed JSON layout of the structuring prompt.
#[derive(Clone)]
pub struct StructurerAgent {
    llm: Arc<dyn Completion>,
    prompts: Arc<PromptTemplates>,
    options: CallOptions,
}

impl StructurerAgent {
    pub fn new(llm: Arc<dyn Completion>, prompts: Arc<PromptTemplates>, options: CallOptions) -> Self {
        Self { llm, prompts, options }
    }

    pub fn call_options(base: CallOptions) -> CallOptions {
        CallOptions { temperature: 0.1, ..base }.with_max_tokens(3000).with_timeout(60)
    }
}

#[async_trait]
impl Agent for StructurerAgent {
    type Input = TextInput;
    type Output = StructuredOutput;

    async fn execute(&self, input: &Self::Input) -> Result<Self::Output, AgentError> {
        let text: String = input.text.chars().take(MAX_INPUT_CHARS).collect();
        let prompt = render(&self.prompts.text_structuring, &[("text_content", text.as_str())])?;
        let raw = self
            .llm
            .complete(&self.prompts.structuring_system, &prompt, &self.options)
            .await?;

        let content = fenced_block(&raw).unwrap_or(raw.as_str()).to_string();
        let valid_json = serde_json::from_str::<serde_json::Value>(&content).is_ok();
        if valid_json {
            info!("StructurerAgent: {} produced valid JSON", input.filename);
        } else {
            warn!("StructurerAgent: output for {} is not valid JSON, saving it anyway", input.filename);
        }
        Ok(StructuredOutput { content, valid_json })
    }
}
