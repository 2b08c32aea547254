//! Prompt templates as plain data, with strict placeholder rendering.
//!
//! Templates use `{name}` placeholders; literal braces are written `{{` and `}}`.
//! Built-in defaults can be overridden field by field from a JSON file (`PROMPTS_FILE`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("placeholder {{{0}}} was not filled")]
    Unfilled(String),

    #[error("malformed template at byte {position}: {message}")]
    Malformed { position: usize, message: String },

    #[error("failed to read prompt file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse prompt file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Substitute every `{name}` in `template` from `fields`.
///
/// Fails if a placeholder has no value or a brace is unbalanced. Substituted values are inserted
/// verbatim and never re-scanned.
pub fn render(template: &str, fields: &[(&str, &str)]) -> Result<String, PromptError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if chars.peek().is_some_and(|&(_, n)| n == '{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek().is_some_and(|&(_, n)| n == '}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for (_, n) in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(PromptError::Malformed { position: pos, message: "unclosed '{'".into() });
                }
                if name.is_empty() || !name.chars().all(|ch| ch.is_alphanumeric() || ch == '_') {
                    return Err(PromptError::Malformed {
                        position: pos,
                        message: format!("invalid placeholder {{{}}}", name),
                    });
                }
                let value = fields
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| *value)
                    .ok_or(PromptError::Unfilled(name))?;
                out.push_str(value);
            }
            '}' => {
                return Err(PromptError::Malformed { position: pos, message: "unmatched '}'".into() });
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Every template the agents use. Missing keys in an override file keep their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    pub research_system: String,
    /// Fields: `filename`, `csv_content`.
    pub csv_analysis: String,
    pub rule_system: String,
    /// Fields: `financial_fraud_knowledge`, `risk_point`, `variable_catalog_json`,
    /// `text_snippets`, `few_shots_json_array`.
    pub rule_generation: String,
    /// Fields: `prompt`, `previous_rule`, `issues`, `suggestions`.
    pub rule_repair: String,
    pub formula_system: String,
    /// Fields: `risk_description`, `model_items`.
    pub formula_analysis: String,
    /// Fields: `risk_formula`.
    pub code_generation: String,
    /// Fields: `prompt`, `attempt`, `previous_code`, `issues`, `suggestions`.
    pub code_repair: String,
    pub structuring_system: String,
    /// Fields: `text_content`.
    pub text_structuring: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            research_system: RESEARCH_SYSTEM.to_string(),
            csv_analysis: CSV_ANALYSIS.to_string(),
            rule_system: RULE_SYSTEM.to_string(),
            rule_generation: RULE_GENERATION.to_string(),
            rule_repair: RULE_REPAIR.to_string(),
            formula_system: FORMULA_SYSTEM.to_string(),
            formula_analysis: FORMULA_ANALYSIS.to_string(),
            code_generation: CODE_GENERATION.to_string(),
            code_repair: CODE_REPAIR.to_string(),
            structuring_system: STRUCTURING_SYSTEM.to_string(),
            text_structuring: TEXT_STRUCTURING.to_string(),
        }
    }
}

impl PromptTemplates {
    /// Defaults, or defaults overlaid with the JSON object at `path`.
    pub fn load(path: Option<&Path>) -> Result<Self, PromptError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let templates: PromptTemplates = serde_json::from_str(text.trim_start_matches('\u{feff}'))?;
                info!("Loaded prompt templates from {}", path.display());
                Ok(templates)
            }
            None => Ok(Self::default()),
        }
    }
}

const RESEARCH_SYSTEM: &str = "你是一个专业的风险研究专家，擅长分析和总结文档内容，特别是关于造假案例、政策法规等信息。请严格按照要求提取和总结文档内容。";

const CSV_ANALYSIS: &str = r#"
你是一名文献分析专家。目标：从 CSV 文本中抽取对"财务造假判断"有用的经验准则：
[输入]
filename: {filename}
<<CSV_START>>
{csv_content}
<<CSV_END>>

[操作步骤]
1) 去噪：忽略广告/转载声明/纯链接/图片占位。
2) 规则提取：用自然语言写清"指标、比较、基准/阈值、时间窗口"。

[输出]
- 只输出 JSON，分两段：
  A. rules.jsonl：每行一个 JSON 对象：
  B. summary.json：仅一个 JSON 对象，作为最后一行单独输出。
- 所有 JSON 必须可解析，使用半角标点，不要写注释，参考格式如下：
{{
  "rules": [
    {{"risk_point":"…","rule_nl":"…"}},
    …
  ],
  "summary": {{"file":"…","total_rules":"…"}}
}}

A. 单条规则 JSON Schema：
{{
  "risk_point": "string",
  "rule_nl": "string"
}}

B. 汇总 JSON Schema：
{{
  "file": "{filename}",
  "total_rules": "number"
}}

[约束]
- 不输出除 JSON 以外的任何文字。
- 尽量多思考一段时间，至少输出20条规则。
"#;

const RULE_SYSTEM: &str = "你是一个专业的财务风险分析专家，擅长根据风险点生成自然语言判断规则和可执行的DSL公式。请严格按照要求输出JSON格式的规则。";

const RULE_GENERATION: &str = r#"
角色：你是审计与财务风控专家。你的任务是为给定"风险点"产出一条可执行的判断规则。
约束：规则里的阈值必须来自"统计摘要"，措辞尽量贴近"年报片段"的表述风格。输出严格遵守"输出JSON模式"。禁止虚构变量名。

【财务造假判断经验准则】
{financial_fraud_knowledge}

【风险点】
{risk_point}

【变量字典】
{variable_catalog_json}

【年报片段】
{text_snippets}

【示范规则（few-shot）】
{few_shots_json_array}

【任务】
仅生成"1条"新规则，满足：
1) 自然语言表述（贴近年报措辞），含明确阈值/对比基准；
2) 对应DSL布尔表达式（仅允许 + - * / () > < >= <= and or not）；
3) variables_used 完整映射（每个变量含 name、period、unit）；
4) 提供 source_refs 说明阈值来自"统计摘要/片段"的哪些键；
5) 给出 safety_hints（缺失/除零/单位换算）。

【输出JSON模式】
{{
  "id": "rule_YYYYMMDD_xxx",
  "risk_point": "...",
  "rule_text": "...",
  "dsl": "...",
  "variables_used": {{ ... }},
  "source_refs": ["stats:...", "text:..."],
  "safety_hints": ["...", "..."]
}}
"#;

const RULE_REPAIR: &str = r#"{prompt}

【需要修复的规则】
{previous_rule}

【错误提示】
{issues}

【修改建议】
{suggestions}

请修复上述规则，确保符合JSON格式和所有要求。"#;

const FORMULA_SYSTEM: &str = "你是一个专业的财务风险分析专家，擅长将自然语言描述的风险模型公式转化为Python代码。请严格按照要求输出可执行的Python代码。";

const FORMULA_ANALYSIS: &str = r#"
请分析以下风险模型公式的结构：

风险描述：{risk_description}

模型涉及项目：
{model_items}

请分析并输出以下信息：
1. 风险类型识别
2. 涉及的关键财务指标
3. 判断条件分析
4. 数据需求分析

请以JSON格式输出结果。
"#;

const CODE_GENERATION: &str = r#"
任务：根据风险描述，生成风险验证代码

要求：
1. 代码必须调用传入的数据字典data_dict中的'model_items'字段来获取验证所需的所有数据（也可使用按"项目名称_类型"索引的'model_data_by_name_type'字段）
2. 生成的代码必须包含一个名为'check_risk'的函数,该函数接收一个data_dict字典参数
3. 函数返回值必须是布尔类型:True表示存在风险,False表示不存在风险
4. 验证所用到的行业分位数(如85%)或行业均值，直接使用类型为"行业"的那一个数据点的值，**不需要计算分位数**
5. 风险描述中的"本年"指的是2024年
6. 代码必须在函数内部处理所有可能的异常情况，使用try-except语句并指定具体的异常类型（如ValueError, TypeError, ZeroDivisionError等）
7. 只能导入math模块，不要使用numpy、statistics或其他库
8. 当数据缺失或不足时，函数默认返回False
9. 确保生成的代码语法正确，特别是缩进和引号的使用

数据结构说明：
- data_dict是一个字典,包含'company_name'、'model_items'和'model_data_by_name_type'字段
- 'model_items'是一个列表，包含多个字典，每个字典代表一个项目的数据
- 每个项目数据字典包含：'项目名称'、'类型'（企业/行业）、'2023'、'2024'等字段

风险公式：{risk_formula}

请生成完整的验证代码：
"#;

const CODE_REPAIR: &str = r#"{prompt}

上一次生成的代码未通过检查（即将进行第{attempt}次生成）。

【上一次的代码】
```python
{previous_code}
```

【发现的问题】
{issues}

【修改建议】
{suggestions}

请在保留原有判断逻辑的前提下修复上述问题，输出完整的验证代码："#;

const STRUCTURING_SYSTEM: &str = "你是一名擅长信息抽取与整理的金融监管文书分析专家。请阅读以下TXT文件，并将其结构化输出为统一的json格式。";

const TEXT_STRUCTURING: &str = r#"
【任务要求】
1. 从文本中提取以下字段（如缺失则填"无"）：
   - 文号
   - 公告类型（行政处罚事先告知书 / 行政处罚决定书 / 立案告知书 / 其他）
   - 监管机构（发布单位）
   - 公司简称
   - 公司全称
   - 国民经济行业
   - 控股股东
   - 实际控制人
   - 主营业务
   - 立案日期（若有）
   - 主要违规事项（以项目符号列出，保持原文表述）
   - 涉案年份（如"2019–2022年"）
   - 涉案金额（如涉及虚增收入、利润、罚款金额等，列出数字及单位）
   - 处罚对象列表（若有表格则逐条列出）：对象名称、身份或职务、违规类型、处罚类型、处罚金额（万元）、处罚期限
   - 法律依据（提取涉及的《证券法》《行政处罚法》《禁入规定》等条款）
   - 总结或监管意见（尽量保留原文）

2. 输出格式：
   使用 **JSON 格式** 输出结果，结构如下：
   ```json
   {{
     "文号": "",
     "公告类型": "",
     "监管机构": "",
     "发布日期": "",
     "公司信息": {{
       "简称": "",
       "全称": "",
       "行业": "",
       "控股股东": "",
       "实际控制人": "",
       "主营业务": ""
     }},
     "案件信息": {{
       "立案日期": "",
       "涉案年份": "",
       "主要违规事项": [],
       "涉案金额": "",
       "处罚对象": [
         {{
           "对象名称": "",
           "身份": "",
           "违规类型": "",
           "处罚类型": "",
           "处罚金额_万元": "",
           "处罚期限": ""
         }}
       ],
       "法律依据": [],
       "总结": ""
     }}
   }}
   ```

请处理以下文本内容：
{text_content}
"#;
