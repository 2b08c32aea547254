use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use risk_agents::agents::miner::default_example_rules;
use risk_agents::config::Config;
use risk_agents::knowledge::KnowledgeStore;
use risk_agents::llm::{CallOptions, Completion, LlmError};
use risk_agents::orchestrator::Orchestrator;
use risk_agents::prompts::PromptTemplates;
use risk_agents::types::{RiskWarningFile, RuleEntry};

/// Replays canned replies in order and records every prompt it was sent.
struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Arc::new(Self { replies: Mutex::new(replies.into()), prompts: Mutex::new(Vec::new()) })
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl Completion for ScriptedLlm {
    async fn complete(&self, _system: &str, prompt: &str, _options: &CallOptions) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies.lock().unwrap().pop_front().unwrap_or(Err(LlmError::EmptyResponse))
    }

    fn model_info(&self) -> String {
        "ScriptedLlm".to_string()
    }
}

const RISKY: &str = "```python
def check_risk(data_dict):
    try:
        items = data_dict.get(\"model_data_by_name_type\", {})
        return items[\"营业收入_企业\"][\"2024\"] > 50
    except (KeyError, TypeError):
        return False
```";

const CLEAN: &str = "```python
def check_risk(data_dict):
    try:
        items = data_dict.get(\"model_data_by_name_type\", {})
        return items[\"营业收入_企业\"][\"2024\"] < 50
    except (KeyError, TypeError):
        return False
```";

const ANALYSIS: &str = "{\"formula\": \"营业收入 > 50\"}";

fn ok(text: &str) -> Result<String, LlmError> {
    Ok(text.to_string())
}

fn config(output_dir: &Path) -> Config {
    Config {
        api_key: "test-key".to_string(),
        output_dir: output_dir.to_path_buf(),
        data_dir: output_dir.to_path_buf(),
        item_delay: 0.0,
        min_request_interval: 0.0,
        ..Config::default()
    }
}

fn orchestrator(llm: &Arc<ScriptedLlm>, output_dir: &Path) -> Orchestrator {
    Orchestrator::new(config(output_dir), llm.clone(), PromptTemplates::default())
}

fn warning_file(items: Value) -> RiskWarningFile {
    serde_json::from_value(json!({ "data": { "甲公司": { "收入风险": items } } })).unwrap()
}

fn revenue_item() -> Value {
    json!({
        "具体风险和模型公式编号": "营业收入超过50",
        "模型涉及项目": [{ "项目名称": "营业收入", "类型": "企业", "2024": 100 }]
    })
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn positive_verdict_is_accepted_without_reconfirmation() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::new(vec![ok(ANALYSIS), ok(RISKY)]);
    let run = orchestrator(&llm, dir.path()).run_analysis(&warning_file(json!([revenue_item()]))).await.unwrap();

    assert_eq!(llm.calls(), 2);
    assert_eq!(run.results.len(), 1);
    let result = &run.results[0];
    assert!(result.is_risk);
    assert!(result.error.is_none());
    assert_eq!(result.execution_result, json!(true));
    assert!(result.python_code.starts_with("def check_risk"));

    let codes = read_json(&run.codes_path);
    assert_eq!(codes.as_array().map(Vec::len), Some(1));
    assert_eq!(codes[0]["is_risk"], json!(true));
    assert!(codes[0].get("is_retry").is_none());

    let report = std::fs::read_to_string(&run.report_path).unwrap();
    assert!(report.contains("- 甲公司 - 收入风险: 存在风险"));
}

#[tokio::test]
async fn negative_verdict_is_regenerated_and_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::new(vec![ok(ANALYSIS), ok(CLEAN), ok(ANALYSIS), ok(RISKY)]);
    let run = orchestrator(&llm, dir.path()).run_analysis(&warning_file(json!([revenue_item()]))).await.unwrap();

    assert_eq!(llm.calls(), 4);
    let result = &run.results[0];
    assert!(result.is_risk);
    assert!(result.python_code.contains("> 50"));

    let codes = read_json(&run.codes_path);
    assert_eq!(codes.as_array().map(Vec::len), Some(2));
    assert_eq!(codes[0]["is_risk"], json!(false));
    assert_eq!(codes[1]["is_risk"], json!(true));
    assert_eq!(codes[1]["is_retry"], json!(true));
}

#[tokio::test]
async fn failed_reconfirmation_keeps_the_first_verdict() {
    let dir = tempfile::tempdir().unwrap();
    let auth = || Err(LlmError::Auth { status: 401, message: "bad key".to_string() });
    // Second round: analysis falls back, then every code attempt fails to generate.
    let llm = ScriptedLlm::new(vec![ok(ANALYSIS), ok(CLEAN), auth(), auth()]);
    let run = orchestrator(&llm, dir.path()).run_analysis(&warning_file(json!([revenue_item()]))).await.unwrap();

    let result = &run.results[0];
    assert!(!result.is_risk);
    assert!(result.error.is_none());
    assert_eq!(result.execution_result, json!(false));
    assert_eq!(read_json(&run.codes_path).as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn incomplete_items_are_reported_without_llm_calls() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::new(vec![]);
    let items = json!([
        { "具体风险和模型公式编号": "无数据的风险", "模型涉及项目": [] },
        { "模型涉及项目": [{ "项目名称": "营业收入", "类型": "企业" }] }
    ]);
    let run = orchestrator(&llm, dir.path()).run_analysis(&warning_file(items)).await.unwrap();

    assert_eq!(llm.calls(), 0);
    assert_eq!(run.results.len(), 2);
    assert!(run.results.iter().all(|r| !r.is_risk && r.error.is_some()));
    let report = std::fs::read_to_string(&run.report_path).unwrap();
    assert!(report.contains("另有2项"));
}

#[tokio::test]
async fn mining_emits_compiled_and_failed_entries() {
    let dir = tempfile::tempdir().unwrap();
    let good_rule = default_example_rules()[0].to_string();
    let bad_rule = json!({ "rule_text": "收入异常" }).to_string();
    let llm = ScriptedLlm::new(vec![ok(&good_rule), ok(&bad_rule), ok(&bad_rule)]);

    let points = vec!["应收账款异常增长".to_string(), "存货异常".to_string()];
    let (entries, path) = orchestrator(&llm, dir.path())
        .run_mining(&points, default_example_rules(), String::new())
        .await
        .unwrap();

    assert_eq!(llm.calls(), 3);
    assert_eq!(entries.len(), 2);
    match &entries[0] {
        RuleEntry::Compiled(rule) => {
            assert_eq!(rule["compiled"], json!(true));
            assert_eq!(rule["risk_point"], json!("应收账款异常增长"));
            assert!(rule["id"].as_str().is_some_and(|id| id.starts_with("rule_")));
        }
        other => panic!("expected a compiled rule, got {other:?}"),
    }
    match &entries[1] {
        RuleEntry::Failed(failure) => {
            assert_eq!(failure.risk_point, "存货异常");
            assert!(!failure.compiled);
            assert_eq!(failure.attempts, 2);
            assert!(!failure.issues.is_empty());
        }
        other => panic!("expected a failure entry, got {other:?}"),
    }

    let saved = read_json(&path);
    assert_eq!(saved[0]["compiled"], json!(true));
    assert_eq!(saved[1]["compiled"], json!(false));
}

#[tokio::test]
async fn repaired_rule_keeps_its_id() {
    let dir = tempfile::tempdir().unwrap();
    let bad_rule = json!({ "rule_text": "收入异常" }).to_string();
    let good_rule = default_example_rules()[1].to_string();
    let llm = ScriptedLlm::new(vec![ok(&bad_rule), ok(&good_rule)]);

    let (entries, _) = orchestrator(&llm, dir.path())
        .run_mining(&["现金流恶化".to_string()], default_example_rules(), "知识".to_string())
        .await
        .unwrap();

    assert!(entries[0].is_compiled());
    let prompts = llm.prompts.lock().unwrap();
    let RuleEntry::Compiled(rule) = &entries[0] else { unreachable!() };
    let id = rule["id"].as_str().unwrap();
    assert!(prompts[1].contains(id));
    assert!(prompts[1].contains("收入异常"));
}

#[tokio::test]
async fn research_upserts_documents_by_filename() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("articles.csv");
    std::fs::write(&csv, "\u{feff}标题,内容\n财务造假,虚增收入\n").unwrap();
    let knowledge_path = dir.path().join("knowledge_base.json");

    let llm = ScriptedLlm::new(vec![ok("第一版知识"), ok("第二版知识")]);
    let orch = orchestrator(&llm, dir.path());

    let first = orch.run_research(std::slice::from_ref(&csv), &knowledge_path).await.unwrap();
    assert!(first[0].success);
    let second = orch.run_research(std::slice::from_ref(&csv), &knowledge_path).await.unwrap();
    assert!(second[0].success);

    let store = KnowledgeStore::open(&knowledge_path).await;
    assert_eq!(store.len(), 1);
    assert_eq!(store.documents()[0].knowledge.extracted_knowledge, "第二版知识");
    assert!(store.combined_text().contains("## articles.csv"));
    assert!(!llm.prompts.lock().unwrap()[0].contains('\u{feff}'));
}

#[tokio::test]
async fn research_rejects_missing_inputs_before_any_call() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::new(vec![ok("unused")]);
    let missing = dir.path().join("missing.csv");
    let result = orchestrator(&llm, dir.path())
        .run_research(&[missing], &dir.path().join("kb.json"))
        .await;
    assert!(result.is_err());
    assert_eq!(llm.remaining(), 1);
}

#[tokio::test]
async fn structuring_writes_success_and_error_files() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("a.txt"), "关于某公司的处罚决定").unwrap();
    std::fs::write(input.path().join("b.txt"), "第二份公告").unwrap();
    std::fs::write(input.path().join("notes.md"), "ignored").unwrap();

    let llm = ScriptedLlm::new(vec![
        ok("```json\n{\"当事人\": \"某公司\"}\n```"),
        Err(LlmError::Auth { status: 401, message: "bad key".to_string() }),
    ]);
    let outcomes = orchestrator(&llm, output.path())
        .run_structuring(input.path(), output.path())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].success && outcomes[0].valid_json);
    assert!(!outcomes[1].success);

    let structured = std::fs::read_to_string(output.path().join("structured_a.txt")).unwrap();
    assert_eq!(read_json_str(&structured)["当事人"], json!("某公司"));
    let error = std::fs::read_to_string(output.path().join("error_b.txt")).unwrap();
    assert!(error.starts_with("处理失败"));
}

fn read_json_str(text: &str) -> Value {
    serde_json::from_str(text).unwrap()
}
