use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Top level of `risk_warning.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskWarningFile {
    #[serde(default)]
    pub data: Map<String, JsonValue>,
}

/// One entry under `data.<company>.<category>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskItem {
    #[serde(rename = "具体风险和模型公式编号", default)]
    pub description: String,
    #[serde(rename = "模型涉及项目", default)]
    pub model_items: Vec<JsonValue>,
}

/// A risk item flattened together with where it came from.
#[derive(Debug, Clone)]
pub struct RiskTask {
    pub company_name: String,
    pub risk_category: String,
    pub item: RiskItem,
}

impl RiskWarningFile {
    /// Every `(company, category, item)` in file order. Entries that are not objects of the
    /// expected shape are treated as items with an empty description.
    pub fn tasks(&self) -> Vec<RiskTask> {
        let mut tasks = Vec::new();
        for (company, categories) in &self.data {
            let Some(categories) = categories.as_object() else { continue };
            for (category, items) in categories {
                let Some(items) = items.as_array() else { continue };
                for item in items {
                    let item: RiskItem = serde_json::from_value(item.clone()).unwrap_or_default();
                    tasks.push(RiskTask {
                        company_name: company.clone(),
                        risk_category: category.clone(),
                        item,
                    });
                }
            }
        }
        tasks
    }
}

/// Saved for every snippet the analysis run produced, including re-confirmation attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedCodeRecord {
    pub company_name: String,
    pub risk_category: String,
    pub risk_description: String,
    pub python_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_risk: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_retry: bool,
}

/// Final verdict for one input item; failures carry `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub company_name: String,
    pub risk_category: String,
    pub risk_description: String,
    pub python_code: String,
    pub is_risk: bool,
    /// Raw value returned by the snippet, `null` when it produced none.
    #[serde(default)]
    pub execution_result: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `knowledge` payload of a stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedKnowledge {
    pub extracted_knowledge: String,
    pub filename: String,
    pub timestamp: String,
}

/// One knowledge-store record, keyed by `filename`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub filename: String,
    pub knowledge: ExtractedKnowledge,
    #[serde(default)]
    pub processed_at: String,
    #[serde(default)]
    pub added_at: String,
}

/// Result of analysing one research input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutcome {
    pub filename: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge: Option<ExtractedKnowledge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-risk-point entry of `rules_output_<ts>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleEntry {
    /// A validated rule object with `compiled: true` set.
    Compiled(JsonValue),
    Failed(RuleFailure),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFailure {
    pub risk_point: String,
    pub compiled: bool,
    pub error: String,
    #[serde(default)]
    pub attempts: u32,
    /// Last rejected candidate, when one was produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_candidate: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl RuleEntry {
    pub fn is_compiled(&self) -> bool {
        matches!(self, RuleEntry::Compiled(_))
    }
}

/// What happened to one `.txt` input of the structuring run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredText {
    pub filename: String,
    pub output_path: String,
    /// Whether the model output parsed as JSON; non-JSON output is still saved.
    pub valid_json: bool,
    pub success: bool,
}
