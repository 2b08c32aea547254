use anyhow::Error;
use colored::*;
use serde_json::Value as JsonValue;

use crate::knowledge::KnowledgeSummary;
use crate::llm::LlmError;
use crate::report::ReportTotals;
use crate::sandbox::ExecutionResult;
use crate::types::{ResearchOutcome, RuleEntry};

const RULE: &str = "─────────────────────────────────────────────────────────────";

pub fn display_welcome(title: &str, mode: &str) {
    println!("{}", format!("🤖 {}", title).bright_blue().bold());
    println!("{}", format!("Mode: {}", mode).blue());
    println!("{}", "Make sure to set the OPENROUTER_API_KEY environment variable.".blue());
    println!("{}", "Press Ctrl+C to abort the batch.\n".blue());
}

pub fn display_item_header(index: usize, company: &str, category: &str, description: &str) {
    let short: String = description.chars().take(50).collect();
    let ellipsis = if description.chars().count() > 50 { "..." } else { "" };
    println!(
        "\n{} {} {} {}{}",
        format!("[{}]", index).bright_white().bold(),
        company.bright_cyan(),
        format!("/ {}", category).cyan(),
        short.white(),
        ellipsis
    );
}

pub fn display_code(title: &str, code: &str) {
    println!("\n    {}", format!("📝 {}", title).bright_yellow().bold());
    println!("    {}", "=".repeat(70).yellow());
    for line in code.lines() {
        println!("    {}", line.white());
    }
    println!("    {}", "=".repeat(70).yellow());
}

pub fn display_execution(label: &str, result: &ExecutionResult) {
    let shown = match result {
        ExecutionResult::Verdict(true) => "True".bright_red().bold(),
        ExecutionResult::Verdict(false) => "False".bright_green().bold(),
        ExecutionResult::NonBoolean(value) => format!("non-boolean {}", value).bright_yellow(),
        ExecutionResult::NoResult(reason) => format!("no result ({})", reason).bright_magenta(),
    };
    println!("    {} {}", format!("🧪 {}:", label).white(), shown);
}

pub fn display_verdict(company: &str, category: &str, description: &str, is_risk: bool) {
    let short: String = description.chars().take(80).collect();
    let ellipsis = if description.chars().count() > 80 { "..." } else { "" };
    println!("\n{}", format!("📊 验证结果 - {} - {}:", company, category).bright_white().bold());
    println!("   {} {}{}", "风险描述:".white(), short, ellipsis);
    let verdict = if is_risk { "🔴 存在风险".bright_red().bold() } else { "🟢 无风险".bright_green().bold() };
    println!("   {} {}", "验证结论:".white(), verdict);
    println!("{}", "=".repeat(80));
}

pub fn display_item_failure(company: &str, category: &str, reason: &str) {
    println!(
        "    {} {} - {}: {}",
        "❌ 解析失败".bright_red().bold(),
        company,
        category,
        reason.red()
    );
}

pub fn display_rule_entry(entry: &RuleEntry) {
    match entry {
        RuleEntry::Compiled(rule) => {
            let field = |key: &str| rule.get(key).and_then(JsonValue::as_str).unwrap_or("").to_string();
            println!("\n{}", "✅ Rule compiled".bright_green().bold());
            println!("{}", format!("┌{}", RULE).green());
            println!("{} {}", "│ 🆔 ID:".green(), field("id").bright_white());
            println!("{} {}", "│ 🎯 Risk point:".green(), field("risk_point").white());
            println!("{} {}", "│ 📝 Rule:".green(), field("rule_text").white());
            println!("{} {}", "│ 🧮 DSL:".green(), field("dsl").bright_white());
            println!("{}", format!("└{}\n", RULE).green());
        }
        RuleEntry::Failed(failure) => {
            println!("\n{}", "❌ Rule rejected".bright_red().bold());
            println!("{}", format!("┌{}", RULE).red());
            println!("{} {}", "│ 🎯 Risk point:".red(), failure.risk_point.white());
            println!("{} {}", "│ 🔁 Attempts:".red(), failure.attempts.to_string().white());
            println!("{} {}", "│ ⚠️  Error:".red(), failure.error.white());
            for issue in &failure.issues {
                println!("│   - {}", issue.white());
            }
            println!("{}", format!("└{}\n", RULE).red());
        }
    }
}

pub fn display_research_outcome(outcome: &ResearchOutcome) {
    if outcome.success {
        println!("{} {}", "[SUCCESS]".bright_green().bold(), outcome.filename.white());
    } else {
        println!("{} {}", "[FAILED]".bright_red().bold(), outcome.filename.white());
        if let Some(error) = &outcome.error {
            println!("{} {}", "错误:".red(), error.red());
        }
    }
}

pub fn display_knowledge_summary(summary: &KnowledgeSummary) {
    println!("\n{}", "📚 Knowledge store".bright_cyan().bold());
    println!("{}", format!("┌{}", RULE).cyan());
    println!("{} {}", "│ 📄 Documents:".cyan(), summary.document_count.to_string().white());
    println!("{} {}", "│ 🔤 Characters:".cyan(), summary.total_characters.to_string().white());
    println!("{} {}", "│ 📏 Average length:".cyan(), summary.avg_doc_length.to_string().white());
    println!("{}", format!("└{}\n", RULE).cyan());
}

pub fn display_totals(totals: &ReportTotals) {
    println!("\n{}", "📋 Analysis summary".bright_magenta().bold());
    println!("{}", format!("┌{}", RULE).magenta());
    println!("{} {}", "│ 🔢 Items:".magenta(), totals.total.to_string().white());
    println!("{} {}", "│ 🔴 Risks detected:".magenta(), totals.detected.to_string().bright_red());
    println!("{} {:.1}%", "│ 📈 Detection rate:".magenta(), totals.detection_rate);
    println!("{} {}", "│ ❌ Failed items:".magenta(), totals.failed.to_string().white());
    println!("{}", format!("└{}\n", RULE).magenta());
}

pub fn display_artifacts(paths: &[String]) {
    println!("{}", "💾 Artifacts:".bright_white().bold());
    for path in paths {
        println!("  {}", path.white());
    }
}

pub fn display_error(error: &Error) {
    if let Some(llm_error) = error.downcast_ref::<LlmError>() {
        display_llm_error(llm_error);
    } else {
        println!("{} {}", "❌ Error:".bright_red().bold(), error.to_string().red());
        println!("{}", "Please check your configuration and try again.\n".red());
    }
}

pub fn display_llm_error(error: &LlmError) {
    let user_message = error.user_message();
    let root = match error {
        LlmError::Exhausted { last, .. } => last.as_ref(),
        other => other,
    };
    match root {
        LlmError::RateLimited => {
            println!("{}", user_message.bright_yellow().bold());
            println!("{}", "💡 Tip: Raise MIN_REQUEST_INTERVAL or wait before trying again.".yellow());
        }
        LlmError::ServerBusy { .. } | LlmError::Timeout { .. } => {
            println!("{}", user_message.bright_yellow().bold());
            println!("{}", "💡 Tip: The server might be overloaded. Try again later.".yellow());
        }
        LlmError::Network { .. } => {
            println!("{}", user_message.bright_red().bold());
            println!("{}", "💡 Tip: Check your internet connection and LLM_BASE_URL.".red());
        }
        LlmError::Auth { .. } => {
            println!("{}", user_message.bright_red().bold());
            println!("{}", "💡 Tip: Check your OPENROUTER_API_KEY environment variable.".red());
        }
        LlmError::EmptyResponse | LlmError::Parse { .. } => {
            println!("{}", user_message.bright_magenta().bold());
            println!("{}", "💡 Tip: The model answered with nothing usable; try another DEFAULT_MODEL.".magenta());
        }
        LlmError::Api { .. } | LlmError::Config { .. } | LlmError::Exhausted { .. } => {
            println!("{}", user_message.bright_red().bold());
        }
    }
    println!();
}

pub fn display_aborted() {
    println!("\n{}", "⚠️ Batch aborted by user".bright_yellow().bold());
}

pub fn display_goodbye() {
    println!("{}", "👋 Done.".bright_yellow().bold());
}
