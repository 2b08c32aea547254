use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use crate::extract::{extract, extract_code};
use crate::llm::{CallOptions, Completion};
use crate::prompts::{PromptTemplates, render};
use crate::repair::{ArtifactGenerator, CODE_ATTEMPTS, RepairFeedback, RepairOutcome, run_repair_loop};
use crate::validation::{finalize_code, validate_code};

use super::miner::bullet_list;
use super::{Agent, AgentError};

#[derive(Debug, Clone)]
pub struct FormulaInput {
    pub risk_description: String,
    pub model_items: Vec<JsonValue>,
}

/// Writes `check_risk` snippets. Every candidate goes through one mechanical repair pass and a
/// parse check before validation.
pub struct CodeGenerator {
    llm: Arc<dyn Completion>,
    prompts: Arc<PromptTemplates>,
    options: CallOptions,
    prompt: String,
}

impl CodeGenerator {
    pub fn new(llm: Arc<dyn Completion>, prompts: Arc<PromptTemplates>, options: CallOptions, prompt: String) -> Self {
        Self { llm, prompts, options, prompt }
    }
}

#[async_trait]
impl ArtifactGenerator for CodeGenerator {
    type Artifact = String;
    type Error = AgentError;

    async fn generate(&self, feedback: Option<&RepairFeedback<String>>) -> Result<String, AgentError> {
        let prompt = match feedback {
            None => self.prompt.clone(),
            Some(feedback) => render(
                &self.prompts.code_repair,
                &[
                    ("prompt", self.prompt.as_str()),
                    ("attempt", &feedback.attempt.to_string()),
                    ("previous_code", feedback.previous.as_str()),
                    ("issues", &bullet_list(&feedback.validation.issues)),
                    ("suggestions", &bullet_list(&feedback.validation.suggestions)),
                ],
            )?,
        };
        let raw = self.llm.complete(&self.prompts.formula_system, &prompt, &self.options).await?;
        Ok(finalize_code(&extract_code(&raw)))
    }
}

/// Analyses a risk description, then generates and validates its `check_risk` snippet.
#[derive(Clone)]
pub struct FormulaAgent {
    llm: Arc<dyn Completion>,
    prompts: Arc<PromptTemplates>,
    options: CallOptions,
}

impl FormulaAgent {
    pub fn new(llm: Arc<dyn Completion>, prompts: Arc<PromptTemplates>, options: CallOptions) -> Self {
        Self { llm, prompts, options }
    }

    /// Structured reading of the formula. Never fails: a failed call or non-JSON answer still
    /// yields an object carrying the description and items.
    pub async fn analyze(&self, input: &FormulaInput) -> Result<JsonValue, AgentError> {
        info!("FormulaAgent: analysing formula structure");
        let items = serde_json::to_string_pretty(&input.model_items)?;
        let prompt = render(
            &self.prompts.formula_analysis,
            &[("risk_description", input.risk_description.as_str()), ("model_items", items.as_str())],
        )?;

        let mut analysis = match self.llm.complete(&self.prompts.formula_system, &prompt, &self.options).await {
            Ok(raw) => match serde_json::from_str::<JsonValue>(&extract(&raw)) {
                Ok(parsed @ JsonValue::Object(_)) => parsed,
                _ => json!({ "analysis_text": raw }),
            },
            Err(e) => {
                warn!("FormulaAgent: formula analysis failed ({}), continuing without it", e);
                json!({ "analysis_text": "未能分析风险公式结构" })
            }
        };
        if let Some(obj) = analysis.as_object_mut() {
            obj.insert("original_risk_description".into(), json!(input.risk_description));
            obj.insert("model_items".into(), JsonValue::Array(input.model_items.clone()));
        }
        Ok(analysis)
    }
}

#[async_trait]
impl Agent for FormulaAgent {
    type Input = FormulaInput;
    type Output = RepairOutcome<String>;

    async fn execute(&self, input: &Self::Input) -> Result<Self::Output, AgentError> {
        let analysis = self.analyze(input).await?;
        let formula = serde_json::to_string_pretty(&analysis)?;
        let prompt = render(&self.prompts.code_generation, &[("risk_formula", formula.as_str())])?;
        let generator = CodeGenerator::new(self.llm.clone(), self.prompts.clone(), self.options.clone(), prompt);

        let label: String = input.risk_description.chars().take(30).collect();
        let outcome = run_repair_loop(&generator, &|code: &String| validate_code(code), CODE_ATTEMPTS, &label).await;
        if let RepairOutcome::Accepted { attempts, .. } = &outcome {
            info!("FormulaAgent: snippet accepted after {} attempt(s)", attempts);
        }
        Ok(outcome)
    }
}
