//! Report writer: renders answered questions as Markdown.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent::{typed, Agent};
use crate::error::Result;
use crate::protocol::kinds;

const DEFAULT_OUTPUT_PATH: &str = "report.md";

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateReportRequest {
    pub title: String,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub answers: Vec<String>,
    #[serde(default)]
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateReportResult {
    pub status: String,
    pub report_path: String,
}

pub fn register(agent: &Agent) -> Result<()> {
    agent.register_handler(
        kinds::GENERATE_REPORT,
        typed(|_ctx, request: GenerateReportRequest| async move { write_report(request).await }),
    )
}

async fn write_report(request: GenerateReportRequest) -> anyhow::Result<GenerateReportResult> {
    let path = report_path(request.output_path.as_deref().unwrap_or(DEFAULT_OUTPUT_PATH));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, render(&request.title, &request.queries, &request.answers)).await?;

    tracing::info!("Report written to {}", path.display());
    Ok(GenerateReportResult {
        status: "success".to_string(),
        report_path: path.to_string_lossy().into_owned(),
    })
}

/// Markdown path for a requested output path; typeset formats become `.md`.
pub fn report_path(requested: &str) -> PathBuf {
    let path = Path::new(requested);
    match path.extension().and_then(|e| e.to_str()) {
        Some("md") => path.to_path_buf(),
        _ => path.with_extension("md"),
    }
}

pub fn render(title: &str, queries: &[String], answers: &[String]) -> String {
    let mut out = format!(
        "# {}\n\n_Generated {}_\n\n## Contents\n\n",
        title,
        chrono::Local::now().format("%Y-%m-%d %H:%M")
    );

    for (i, query) in queries.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, query));
    }

    for (i, query) in queries.iter().enumerate() {
        let answer = answers.get(i).map(String::as_str).unwrap_or("");
        out.push_str(&format!("\n## {}. {}\n\n{}\n", i + 1, query, answer.trim()));
    }
    out
}
