use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] crate::llm::LlmError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Prompt(#[from] crate::prompts::PromptError),
    #[error("model output unusable: {0}")]
    MalformedOutput(String),
}

#[async_trait]
pub trait Agent {
    type Input: Send + Sync;
    type Output: Send + Sync;
    async fn execute(&self, input: &Self::Input) -> Result<Self::Output, AgentError>;
}

pub mod formula;
pub mod miner;
pub mod research;
pub mod structurer;

pub use formula::{CodeGenerator, FormulaAgent, FormulaInput};
pub use miner::{RuleGenerator, RuleMinerAgent, new_rule_id};
pub use research::{CsvInput, ResearchAgent};
pub use structurer::{StructuredOutput, StructurerAgent, TextInput};
