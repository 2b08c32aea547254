use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use rand::Rng;
use serde_json::{Value as JsonValue, json};
use tracing::info;

use crate::extract::extract;
use crate::llm::{CallOptions, Completion};
use crate::prompts::{PromptTemplates, render};
use crate::repair::{ArtifactGenerator, RULE_ATTEMPTS, RepairFeedback, RepairOutcome, run_repair_loop};
use crate::types::{RuleEntry, RuleFailure};
use crate::validation::validate_rule;

use super::{Agent, AgentError};

/// `rule_<YYYYMMDD>_<100..=999>`.
pub fn new_rule_id() -> String {
    format!(
        "rule_{}_{}",
        Local::now().format("%Y%m%d"),
        rand::thread_rng().gen_range(100..=999)
    )
}

/// Few-shot rules used when no example file is supplied.
pub fn default_example_rules() -> Vec<JsonValue> {
    vec![
        json!({
            "id": "rule_example_1",
            "risk_point": "应收账款异常增长",
            "rule_text": "当应收账款同比增幅超过营业收入同比增幅15个百分点时，可能存在应收账款异常增长风险",
            "dsl": "e - a > 15.0",
            "variables_used": {
                "a": {"name": "营业收入同比(%)", "period": "YoY", "unit": "pct"},
                "e": {"name": "应收账款同比(%)", "period": "YoY", "unit": "pct"}
            },
            "source_refs": ["stats:行业基准数据", "text:年报措辞参考"],
            "safety_hints": ["检查是否存在数据缺失", "注意单位一致性"]
        }),
        json!({
            "id": "rule_example_2",
            "risk_point": "经营活动现金流恶化",
            "rule_text": "当经营活动现金流净额/营业收入(TTM)低于行业25分位值时，可能存在现金流恶化风险",
            "dsl": "g < q25_g_ind",
            "variables_used": {
                "g": {"name": "经营活动现金流净额/营业收入", "period": "TTM", "unit": "ratio"},
                "q25_g_ind": {"name": "行业g分位25%", "period": "TTM", "unit": "ratio"}
            },
            "source_refs": ["stats:行业基准数据", "text:年报措辞参考"],
            "safety_hints": ["检查除零错误", "注意财务期间匹配"]
        }),
        json!({
            "id": "rule_example_3",
            "risk_point": "毛利率显著下降",
            "rule_text": "当毛利率同比下降超过5个百分点时，可能存在毛利率显著下降风险",
            "dsl": "c < -5.0",
            "variables_used": {
                "c": {"name": "毛利率同比变化", "period": "YoY", "unit": "pct"}
            },
            "source_refs": ["stats:行业基准数据", "text:年报措辞参考"],
            "safety_hints": ["注意去年同期数据可得性", "检查数据质量"]
        }),
    ]
}

fn default_variable_catalog() -> JsonValue {
    json!({
        "a": {"name": "营业收入同比(%)", "period": "YoY", "unit": "pct"},
        "e": {"name": "应收账款同比(%)", "period": "YoY", "unit": "pct"},
        "g": {"name": "经营活动现金流净额/营业收入", "period": "TTM", "unit": "ratio"},
        "c": {"name": "行业营业收入YoY Q75", "period": "YoY", "unit": "pct"},
        "q25_g_ind": {"name": "行业g分位25%", "period": "TTM", "unit": "ratio"},
        "q75_e_ind": {"name": "行业应收YoY Q75", "period": "YoY", "unit": "pct"}
    })
}

const DEFAULT_SNIPPETS: &[&str] = &[
    "收入确认以控制权转移为前提",
    "行业协会口径：收入同比中位数7.8%",
    "应收账款周转率下降15%",
    "经营性现金流同比下降5%",
    "毛利率下降超过5个百分点",
];

/// Asks the model for one rule object; repairs embed the rejected rule and its issues.
pub struct RuleGenerator {
    llm: Arc<dyn Completion>,
    prompts: Arc<PromptTemplates>,
    options: CallOptions,
    prompt: String,
    rule_id: String,
    risk_point: String,
}

impl RuleGenerator {
    pub fn new(
        llm: Arc<dyn Completion>,
        prompts: Arc<PromptTemplates>,
        options: CallOptions,
        prompt: String,
        risk_point: String,
    ) -> Self {
        Self { llm, prompts, options, prompt, rule_id: new_rule_id(), risk_point }
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn parse_rule(&self, raw: &str) -> Result<JsonValue, AgentError> {
        let payload = extract(raw);
        let mut rule: JsonValue = serde_json::from_str(&payload)
            .map_err(|e| AgentError::MalformedOutput(format!("rule is not valid JSON: {}", e)))?;
        let obj = rule
            .as_object_mut()
            .ok_or_else(|| AgentError::MalformedOutput("rule is not a JSON object".into()))?;
        obj.insert("id".into(), JsonValue::String(self.rule_id.clone()));
        obj.insert("risk_point".into(), JsonValue::String(self.risk_point.clone()));
        Ok(rule)
    }
}

#[async_trait]
impl ArtifactGenerator for RuleGenerator {
    type Artifact = JsonValue;
    type Error = AgentError;

    async fn generate(&self, feedback: Option<&RepairFeedback<JsonValue>>) -> Result<JsonValue, AgentError> {
        let prompt = match feedback {
            None => self.prompt.clone(),
            Some(feedback) => render(
                &self.prompts.rule_repair,
                &[
                    ("prompt", &self.prompt),
                    ("previous_rule", &serde_json::to_string_pretty(&feedback.previous)?),
                    ("issues", &bullet_list(&feedback.validation.issues)),
                    ("suggestions", &bullet_list(&feedback.validation.suggestions)),
                ],
            )?,
        };
        let raw = self.llm.complete(&self.prompts.rule_system, &prompt, &self.options).await?;
        self.parse_rule(&raw)
    }
}

pub(crate) fn bullet_list(lines: &[String]) -> String {
    lines.iter().map(|l| format!("- {}", l)).collect::<Vec<_>>().join("\n")
}

/// Produces one validated rule (or a failure entry) per risk point.
pub struct RuleMinerAgent {
    llm: Arc<dyn Completion>,
    prompts: Arc<PromptTemplates>,
    options: CallOptions,
    knowledge: String,
    example_rules: Vec<JsonValue>,
    variable_catalog: JsonValue,
    text_snippets: Vec<String>,
}

impl RuleMinerAgent {
    pub fn new(
        llm: Arc<dyn Completion>,
        prompts: Arc<PromptTemplates>,
        options: CallOptions,
        knowledge: String,
        example_rules: Vec<JsonValue>,
    ) -> Self {
        Self {
            llm,
            prompts,
            options,
            knowledge,
            example_rules,
            variable_catalog: default_variable_catalog(),
            text_snippets: DEFAULT_SNIPPETS.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn build_prompt(&self, risk_point: &str) -> Result<String, AgentError> {
        let knowledge = if self.knowledge.trim().is_empty() { "无" } else { self.knowledge.as_str() };
        let snippets = self
            .text_snippets
            .iter()
            .map(|s| format!("- {}", s))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(render(
            &self.prompts.rule_generation,
            &[
                ("financial_fraud_knowledge", knowledge),
                ("risk_point", risk_point),
                ("variable_catalog_json", &serde_json::to_string_pretty(&self.variable_catalog)?),
                ("text_snippets", &snippets),
                ("few_shots_json_array", &serde_json::to_string_pretty(&self.example_rules)?),
            ],
        )?)
    }
}

#[async_trait]
impl Agent for RuleMinerAgent {
    type Input = String;
    type Output = RuleEntry;

    async fn execute(&self, risk_point: &Self::Input) -> Result<Self::Output, AgentError> {
        let generator = RuleGenerator::new(
            self.llm.clone(),
            self.prompts.clone(),
            self.options.clone(),
            self.build_prompt(risk_point)?,
            risk_point.clone(),
        );
        info!("RuleMinerAgent: {} -> {}", risk_point, generator.rule_id());

        let label = format!("rule {}", generator.rule_id());
        let outcome = run_repair_loop(&generator, &validate_rule, RULE_ATTEMPTS, &label).await;
        let reason = outcome.failure_reason().unwrap_or_default();
        let attempts = outcome.attempts();

        Ok(match outcome {
            RepairOutcome::Accepted { mut artifact, .. } => {
                if let Some(obj) = artifact.as_object_mut() {
                    obj.insert("compiled".into(), JsonValue::Bool(true));
                }
                RuleEntry::Compiled(artifact)
            }
            RepairOutcome::Exhausted { last, validation, .. } => RuleEntry::Failed(RuleFailure {
                risk_point: risk_point.clone(),
                compiled: false,
                error: reason,
                attempts,
                last_candidate: Some(last),
                issues: validation.issues,
            }),
            RepairOutcome::GenerationFailed { .. } => RuleEntry::Failed(RuleFailure {
                risk_point: risk_point.clone(),
                compiled: false,
                error: reason,
                attempts,
                last_candidate: None,
                issues: Vec::new(),
            }),
        })
    }
}
