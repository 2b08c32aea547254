//! LLM-driven financial-risk agents: knowledge research, rule mining, formula-to-code analysis
//! with sandboxed execution, and regulatory text structuring.

pub mod agents;
pub mod config;
pub mod console;
pub mod extract;
pub mod knowledge;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod repair;
pub mod report;
pub mod sandbox;
pub mod types;
pub mod validation;
