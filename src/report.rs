//! Markdown summary of an analysis run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::fs;
use tracing::info;

use crate::agents::AgentError;
use crate::prompts::render;
use crate::types::AnalysisResult;

const REPORT_TEMPLATE: &str = "
# 风险分析报告

## 执行摘要

本报告对{company_count}家企业的财务风险进行了分析与验证。

## 风险概览

- 总风险数: {total_risks}
- 检测到风险数: {detected_risks}
- 风险检测率: {detection_rate}%
- 分析失败数: {failed_risks}

## 详细分析

{risk_details}

## 结论与建议

{conclusions}

---
*报告生成时间: {generation_time}*
";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportTotals {
    pub total: usize,
    pub detected: usize,
    pub failed: usize,
    /// Percentage in `[0, 100]`; zero for an empty run.
    pub detection_rate: f64,
}

pub fn totals(results: &[AnalysisResult]) -> ReportTotals {
    let total = results.len();
    let detected = results.iter().filter(|r| r.is_risk).count();
    let failed = results.iter().filter(|r| r.error.is_some()).count();
    let detection_rate = if total == 0 { 0.0 } else { detected as f64 / total as f64 * 100.0 };
    ReportTotals { total, detected, failed, detection_rate }
}

pub fn build_report(results: &[AnalysisResult], generated_at: DateTime<Local>) -> Result<String, AgentError> {
    let t = totals(results);
    let companies: BTreeSet<&str> = results.iter().map(|r| r.company_name.as_str()).collect();

    let details = results
        .iter()
        .map(|r| {
            let status = if r.is_risk { "存在风险" } else { "无风险" };
            match &r.error {
                Some(error) => format!("- {} - {}: {}（{}）", r.company_name, r.risk_category, status, error),
                None => format!("- {} - {}: {}", r.company_name, r.risk_category, status),
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut conclusions = String::from("根据分析结果，建议关注检测到的高风险项，并采取相应的风险控制措施。");
    if t.failed > 0 {
        conclusions.push_str(&format!("\n\n另有{}项未能得出验证结论，建议人工复核。", t.failed));
    }

    Ok(render(
        REPORT_TEMPLATE,
        &[
            ("company_count", &companies.len().to_string()),
            ("total_risks", &t.total.to_string()),
            ("detected_risks", &t.detected.to_string()),
            ("detection_rate", &format!("{:.1}", t.detection_rate)),
            ("failed_risks", &t.failed.to_string()),
            ("risk_details", &details),
            ("conclusions", &conclusions),
            ("generation_time", &generated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ],
    )?)
}

/// Write `risk_analysis_report_<ts>.md` under `output_dir`.
pub async fn save_report(content: &str, output_dir: &Path, stamp: &str) -> Result<PathBuf, AgentError> {
    fs::create_dir_all(output_dir).await?;
    let path = output_dir.join(format!("risk_analysis_report_{}.md", stamp));
    fs::write(&path, content).await?;
    info!("Saved analysis report to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn result(company: &str, is_risk: bool, error: Option<&str>) -> AnalysisResult {
        AnalysisResult {
            company_name: company.to_string(),
            risk_category: "收入".to_string(),
            risk_description: "d".to_string(),
            python_code: String::new(),
            is_risk,
            execution_result: Value::Null,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn totals_and_rate() {
        let results = vec![result("甲", true, None), result("甲", false, None), result("乙", false, Some("x"))];
        let t = totals(&results);
        assert_eq!((t.total, t.detected, t.failed), (3, 1, 1));
        assert!((t.detection_rate - 33.333).abs() < 0.01);
        assert_eq!(totals(&[]).detection_rate, 0.0);
    }

    #[test]
    fn report_lists_every_item() {
        let results = vec![result("甲", true, None), result("乙", false, Some("解析失败"))];
        let report = build_report(&results, Local::now()).unwrap();
        assert!(report.contains("本报告对2家企业"));
        assert!(report.contains("- 风险检测率: 50.0%"));
        assert!(report.contains("- 甲 - 收入: 存在风险"));
        assert!(report.contains("- 乙 - 收入: 无风险（解析失败）"));
        assert!(report.contains("另有1项"));
    }

    #[tokio::test]
    async fn report_is_saved_with_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_report("# r", dir.path(), "20240101_000000").await.unwrap();
        assert!(path.ends_with("risk_analysis_report_20240101_000000.md"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "# r");
    }
}
