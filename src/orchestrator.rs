use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Local;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agents::{
    Agent, AgentError, CsvInput, FormulaAgent, FormulaInput, ResearchAgent, RuleMinerAgent, StructuredOutput,
    StructurerAgent, TextInput,
};
use crate::config::Config;
use crate::console::Console;
use crate::knowledge::KnowledgeStore;
use crate::llm::{CallOptions, Completion};
use crate::prompts::PromptTemplates;
use crate::repair::RepairOutcome;
use crate::report;
use crate::sandbox::{ExecutionResult, Sandbox};
use crate::types::{
    AnalysisResult, ExtractedKnowledge, GeneratedCodeRecord, KnowledgeDocument, ResearchOutcome, RiskTask,
    RiskWarningFile, RuleEntry, RuleFailure, StructuredText,
};

/// Files written by an analysis run.
#[derive(Debug)]
pub struct AnalysisRun {
    pub results: Vec<AnalysisResult>,
    pub codes_path: PathBuf,
    pub report_path: PathBuf,
}

/// Sequential batch runners sharing one client, one prompt set and one sandbox.
pub struct Orchestrator {
    config: Config,
    llm: Arc<dyn Completion>,
    prompts: Arc<PromptTemplates>,
    sandbox: Sandbox,
    run_id: Uuid,
}

impl Orchestrator {
    pub fn new(config: Config, llm: Arc<dyn Completion>, prompts: PromptTemplates) -> Self {
        let run_id = Uuid::new_v4();
        info!("Orchestrator ready (run {}, {})", run_id, llm.model_info());
        Self { config, llm, prompts: Arc::new(prompts), sandbox: Sandbox::default(), run_id }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn options(&self) -> CallOptions {
        CallOptions::from_config(&self.config)
    }

    fn stamp() -> String {
        Local::now().format("%Y%m%d_%H%M%S").to_string()
    }

    async fn pause_between(&self, index: usize, total: usize) {
        if index + 1 < total && self.config.item_delay > 0.0 {
            tokio::time::sleep(self.config.item_delay()).await;
        }
    }

    /// Mine each CSV export into the knowledge store at `knowledge_path`, then export a copy.
    pub async fn run_research(&self, inputs: &[PathBuf], knowledge_path: &Path) -> Result<Vec<ResearchOutcome>> {
        for path in inputs {
            if !path.is_file() {
                bail!("input file not found: {}", path.display());
            }
        }
        info!("Research run {}: {} input file(s)", self.run_id, inputs.len());

        let mut store = KnowledgeStore::open(knowledge_path).await;
        info!("Knowledge store holds {} document(s)", store.len());
        let agent = ResearchAgent::new(
            self.llm.clone(),
            self.prompts.clone(),
            ResearchAgent::call_options(self.options()),
        );

        let mut outcomes = Vec::with_capacity(inputs.len());
        for (index, path) in inputs.iter().enumerate() {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            info!("[{}/{}] processing {}", index + 1, inputs.len(), filename);

            let outcome = match self.research_one(&agent, &mut store, path, &filename).await {
                Ok(knowledge) => {
                    ResearchOutcome { filename, success: true, knowledge: Some(knowledge), error: None }
                }
                Err(e) => {
                    error!("Research failed for {}: {}", filename, e);
                    ResearchOutcome { filename, success: false, knowledge: None, error: Some(e.to_string()) }
                }
            };
            Console::display_research_outcome(&outcome);
            outcomes.push(outcome);
            self.pause_between(index, inputs.len()).await;
        }

        let export = self.config.output_dir.join(format!("knowledge_base_{}.json", Self::stamp()));
        store.export_to(&export).await?;
        Console::display_knowledge_summary(&store.summary());
        Console::display_artifacts(&[knowledge_path.display().to_string(), export.display().to_string()]);
        Ok(outcomes)
    }

    async fn research_one(
        &self,
        agent: &ResearchAgent,
        store: &mut KnowledgeStore,
        path: &Path,
        filename: &str,
    ) -> Result<ExtractedKnowledge> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let input = CsvInput { filename: filename.to_string(), content: content.trim_start_matches('\u{feff}').to_string() };
        let knowledge = agent.execute(&input).await?;
        store
            .upsert(KnowledgeDocument {
                filename: filename.to_string(),
                knowledge: knowledge.clone(),
                processed_at: Local::now().to_rfc3339(),
                added_at: String::new(),
            })
            .await?;
        Ok(knowledge)
    }

    /// One rule entry per risk point, saved to `rules_output_<ts>.json`.
    pub async fn run_mining(
        &self,
        risk_points: &[String],
        example_rules: Vec<JsonValue>,
        knowledge: String,
    ) -> Result<(Vec<RuleEntry>, PathBuf)> {
        info!("Mining run {}: {} risk point(s)", self.run_id, risk_points.len());
        let agent = RuleMinerAgent::new(self.llm.clone(), self.prompts.clone(), self.options(), knowledge, example_rules);

        let mut entries = Vec::with_capacity(risk_points.len());
        for (index, risk_point) in risk_points.iter().enumerate() {
            info!("[{}/{}] risk point: {}", index + 1, risk_points.len(), risk_point);
            let entry = match agent.execute(risk_point).await {
                Ok(entry) => entry,
                Err(e) => {
                    error!("Rule mining failed for {}: {}", risk_point, e);
                    RuleEntry::Failed(RuleFailure {
                        risk_point: risk_point.clone(),
                        compiled: false,
                        error: e.to_string(),
                        attempts: 0,
                        last_candidate: None,
                        issues: Vec::new(),
                    })
                }
            };
            Console::display_rule_entry(&entry);
            entries.push(entry);
            self.pause_between(index, risk_points.len()).await;
        }

        let compiled = entries.iter().filter(|e| e.is_compiled()).count();
        let path = self.config.output_dir.join(format!("rules_output_{}.json", Self::stamp()));
        write_json(&path, &entries).await?;
        info!("Mining finished: {}/{} rules compiled, saved to {}", compiled, entries.len(), path.display());
        Console::display_artifacts(&[path.display().to_string()]);
        Ok((entries, path))
    }

    /// Generate, run and (for negatives) re-confirm a snippet for every risk item.
    pub async fn run_analysis(&self, data: &RiskWarningFile) -> Result<AnalysisRun> {
        let tasks = data.tasks();
        info!("Analysis run {}: {} risk item(s) across {} compan(ies)", self.run_id, tasks.len(), data.data.len());
        let agent = FormulaAgent::new(self.llm.clone(), self.prompts.clone(), self.options());

        let mut results = Vec::with_capacity(tasks.len());
        let mut codes = Vec::new();
        for (index, task) in tasks.iter().enumerate() {
            Console::display_item_header(index + 1, &task.company_name, &task.risk_category, &task.item.description);
            let result = self.analyze_one(&agent, task, &mut codes).await;
            match &result.error {
                Some(reason) => Console::display_item_failure(&task.company_name, &task.risk_category, reason),
                None => Console::display_verdict(
                    &task.company_name,
                    &task.risk_category,
                    &task.item.description,
                    result.is_risk,
                ),
            }
            results.push(result);
            self.pause_between(index, tasks.len()).await;
        }

        let stamp = Self::stamp();
        let codes_path = self.config.output_dir.join(format!("generated_risk_codes_{}.json", stamp));
        write_json(&codes_path, &codes).await?;
        info!("Saved {} generated snippet(s) to {}", codes.len(), codes_path.display());

        let content = report::build_report(&results, Local::now())?;
        let report_path = report::save_report(&content, &self.config.output_dir, &stamp).await?;

        Console::display_totals(&report::totals(&results));
        Console::display_artifacts(&[codes_path.display().to_string(), report_path.display().to_string()]);
        Ok(AnalysisRun { results, codes_path, report_path })
    }

    async fn analyze_one(
        &self,
        agent: &FormulaAgent,
        task: &RiskTask,
        codes: &mut Vec<GeneratedCodeRecord>,
    ) -> AnalysisResult {
        let failure = |error: String| AnalysisResult {
            company_name: task.company_name.clone(),
            risk_category: task.risk_category.clone(),
            risk_description: task.item.description.clone(),
            python_code: String::new(),
            is_risk: false,
            execution_result: JsonValue::Null,
            error: Some(error),
        };

        if task.item.description.trim().is_empty() || task.item.model_items.is_empty() {
            warn!("Skipping {} / {}: missing description or model items", task.company_name, task.risk_category);
            return failure("missing risk description or model items".to_string());
        }

        let input = FormulaInput {
            risk_description: task.item.description.clone(),
            model_items: task.item.model_items.clone(),
        };
        let sandbox_input = build_sandbox_input(&task.company_name, &task.item.model_items);

        let code = match self.generate_code(agent, &input).await {
            Ok(code) => code,
            Err(reason) => return failure(reason),
        };
        Console::display_code("生成的Python代码", &code);
        let first = self.execute(&code, &sandbox_input).await;
        Console::display_execution("第一次验证", &first);
        codes.push(self.code_record(task, &code, Some(first.is_risk()), false));

        let (code, verdict) = if first.is_risk() {
            (code, first)
        } else {
            // Negative first verdicts are re-confirmed with an independent snippet; the second
            // result replaces the first. Positives are accepted as-is.
            info!("First verdict negative, regenerating to confirm");
            match self.generate_code(agent, &input).await {
                Ok(retry_code) => {
                    Console::display_code("重试生成的Python代码", &retry_code);
                    let second = self.execute(&retry_code, &sandbox_input).await;
                    Console::display_execution("第二次验证", &second);
                    codes.push(self.code_record(task, &retry_code, Some(second.is_risk()), true));
                    (retry_code, second)
                }
                Err(reason) => {
                    warn!("Re-confirmation failed ({}), keeping the first verdict", reason);
                    (code, first)
                }
            }
        };

        AnalysisResult {
            company_name: task.company_name.clone(),
            risk_category: task.risk_category.clone(),
            risk_description: task.item.description.clone(),
            python_code: code,
            is_risk: verdict.is_risk(),
            execution_result: verdict.to_json(),
            error: verdict.failure_reason().map(|r| format!("no verdict: {}", r)),
        }
    }

    async fn generate_code(&self, agent: &FormulaAgent, input: &FormulaInput) -> Result<String, String> {
        match agent.execute(input).await {
            Ok(RepairOutcome::Accepted { artifact, .. }) => Ok(artifact),
            Ok(outcome) => Err(outcome.failure_reason().unwrap_or_else(|| "解析失败".to_string())),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Run on the blocking pool; the interpreter never crosses an `.await`.
    async fn execute(&self, code: &str, input: &JsonValue) -> ExecutionResult {
        let sandbox = self.sandbox.clone();
        let code = code.to_string();
        let input = input.clone();
        tokio::task::spawn_blocking(move || sandbox.execute(&code, &input))
            .await
            .unwrap_or_else(|e| ExecutionResult::NoResult(format!("sandbox task failed: {}", e)))
    }

    fn code_record(&self, task: &RiskTask, code: &str, is_risk: Option<bool>, is_retry: bool) -> GeneratedCodeRecord {
        GeneratedCodeRecord {
            company_name: task.company_name.clone(),
            risk_category: task.risk_category.clone(),
            risk_description: task.item.description.clone(),
            python_code: code.to_string(),
            is_risk,
            is_retry,
        }
    }

    /// Structure every `.txt` file in `input_dir` into `output_dir`.
    pub async fn run_structuring(&self, input_dir: &Path, output_dir: &Path) -> Result<Vec<StructuredText>> {
        if !input_dir.is_dir() {
            bail!("input directory not found: {}", input_dir.display());
        }
        fs::create_dir_all(output_dir).await?;

        let mut files = Vec::new();
        let mut entries = fs::read_dir(input_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "txt") && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        info!("Structuring run {}: found {} txt file(s)", self.run_id, files.len());

        let agent = StructurerAgent::new(
            self.llm.clone(),
            self.prompts.clone(),
            StructurerAgent::call_options(self.options()),
        );
        let mut outcomes = Vec::with_capacity(files.len());
        for (index, path) in files.iter().enumerate() {
            let filename = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            info!("[{}/{}] structuring {}", index + 1, files.len(), filename);

            let outcome = match structure_one(&agent, path, &filename).await {
                Ok(output) => {
                    let out = output_dir.join(format!("structured_{}", filename));
                    fs::write(&out, &output.content).await?;
                    info!("Saved {}", out.display());
                    StructuredText {
                        filename,
                        output_path: out.display().to_string(),
                        valid_json: output.valid_json,
                        success: true,
                    }
                }
                Err(e) => {
                    error!("Structuring failed for {}: {}", filename, e);
                    let out = output_dir.join(format!("error_{}", filename));
                    fs::write(&out, format!("处理失败: {}", e)).await?;
                    StructuredText { filename, output_path: out.display().to_string(), valid_json: false, success: false }
                }
            };
            outcomes.push(outcome);
            self.pause_between(index, files.len()).await;
        }
        Ok(outcomes)
    }
}

async fn structure_one(agent: &StructurerAgent, path: &Path, filename: &str) -> Result<StructuredOutput, AgentError> {
    let text = fs::read_to_string(path).await?;
    agent.execute(&TextInput { filename: filename.to_string(), text }).await
}

/// `{company_name, model_items, model_data_by_name_type}` with items indexed by `"<项目名称>_<类型>"`.
pub fn build_sandbox_input(company_name: &str, model_items: &[JsonValue]) -> JsonValue {
    let mut by_name_type = Map::new();
    for item in model_items {
        let Some(obj) = item.as_object() else { continue };
        let field = |key: &str| match obj.get(key) {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        by_name_type.insert(format!("{}_{}", field("项目名称"), field("类型")), item.clone());
    }
    json!({
        "company_name": company_name,
        "model_items": model_items,
        "model_data_by_name_type": by_name_type,
    })
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_input_indexes_items_by_name_and_type() {
        let items = vec![
            json!({"项目名称": "营业收入", "类型": "企业", "2024": 100}),
            json!({"项目名称": "营业收入", "类型": "行业", "2024": 80}),
            json!("not an item"),
        ];
        let input = build_sandbox_input("甲公司", &items);
        assert_eq!(input["company_name"], json!("甲公司"));
        assert_eq!(input["model_items"].as_array().map(Vec::len), Some(3));
        assert_eq!(input["model_data_by_name_type"]["营业收入_企业"]["2024"], json!(100));
        assert_eq!(input["model_data_by_name_type"]["营业收入_行业"]["2024"], json!(80));
        assert_eq!(input["model_data_by_name_type"].as_object().map(Map::len), Some(2));
    }
}
