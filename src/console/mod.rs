use anyhow::Error;

use crate::knowledge::KnowledgeSummary;
use crate::llm::LlmError;
use crate::report::ReportTotals;
use crate::sandbox::ExecutionResult;
use crate::types::{ResearchOutcome, RuleEntry};

mod render;

/// Terminal output for the batch runners
pub struct Console;

impl Console {
    /// Display a welcome banner
    pub fn display_welcome(title: &str, mode: &str) {
        render::display_welcome(title, mode);
    }

    pub fn display_item_header(index: usize, company: &str, category: &str, description: &str) {
        render::display_item_header(index, company, category, description);
    }

    /// Print a generated snippet inside a ruled block
    pub fn display_code(title: &str, code: &str) {
        render::display_code(title, code);
    }

    pub fn display_execution(label: &str, result: &ExecutionResult) {
        render::display_execution(label, result);
    }

    pub fn display_verdict(company: &str, category: &str, description: &str, is_risk: bool) {
        render::display_verdict(company, category, description, is_risk);
    }

    pub fn display_item_failure(company: &str, category: &str, reason: &str) {
        render::display_item_failure(company, category, reason);
    }

    pub fn display_rule_entry(entry: &RuleEntry) {
        render::display_rule_entry(entry);
    }

    pub fn display_research_outcome(outcome: &ResearchOutcome) {
        render::display_research_outcome(outcome);
    }

    pub fn display_knowledge_summary(summary: &KnowledgeSummary) {
        render::display_knowledge_summary(summary);
    }

    pub fn display_totals(totals: &ReportTotals) {
        render::display_totals(totals);
    }

    pub fn display_artifacts(paths: &[String]) {
        render::display_artifacts(paths);
    }

    /// Display an error message with context-aware messaging
    pub fn display_error(error: &Error) {
        render::display_error(error);
    }

    /// Display an LlmError with styling and a tip for its cause
    pub fn display_llm_error(error: &LlmError) {
        render::display_llm_error(error);
    }

    pub fn display_aborted() {
        render::display_aborted();
    }

    pub fn display_goodbye() {
        render::display_goodbye();
    }
}
