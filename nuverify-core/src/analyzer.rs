//! Per-script analysis boundary and its LLM-backed implementation.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::AnalysisError;
use crate::llm::{LlmProvider, extract_json_array, strip_code_fence};
use crate::progress::{ProgressEmitter, ProgressPhase, estimate_tokens};
use crate::types::{AnalysisResult, CompatibilityIssue, InstructionSet, ScriptRecord, Severity};
use crate::version::Version;

/// Checks one script against an instruction set.
///
/// Implementations may emit [`ProgressPhase::Streaming`] events on `progress`;
/// the pipeline emits the start and terminal events itself.
#[async_trait::async_trait]
pub trait ScriptAnalyzer: Send + Sync + std::fmt::Debug {
    async fn analyze(
        &self,
        script: &ScriptRecord,
        target: &Version,
        instructions: &InstructionSet,
        progress: ProgressEmitter,
    ) -> Result<AnalysisResult, AnalysisError>;
}

/// Asks an LLM to review the script against the instructions.
#[derive(Debug, Clone)]
pub struct LlmScriptAnalyzer {
    llm: Arc<dyn LlmProvider>,
}

impl LlmScriptAnalyzer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    async fn complete(&self, prompt: &str, progress: &ProgressEmitter, total: u64) -> Result<String, AnalysisError> {
        if !progress.is_enabled() {
            return self
                .llm
                .call(prompt)
                .await
                .map(|(text, _)| text)
                .map_err(|e| AnalysisError::Model(e.to_string()));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let pump = async {
            let mut seen = 0u64;
            while let Some(chunk) = rx.recv().await {
                seen += (chunk.len() as u64 / 4).max(1);
                progress.emit(ProgressPhase::Streaming, seen, total);
            }
        };
        let (streamed, ()) = tokio::join!(self.llm.call_streaming(prompt, tx), pump);

        match streamed {
            Ok((text, _)) => Ok(text),
            Err(e) => {
                warn!(script = progress.script(), error = %e, "Streaming failed, retrying without streaming");
                self.llm
                    .call(prompt)
                    .await
                    .map(|(text, _)| text)
                    .map_err(|e| AnalysisError::Model(e.to_string()))
            }
        }
    }
}

#[async_trait::async_trait]
impl ScriptAnalyzer for LlmScriptAnalyzer {
    async fn analyze(
        &self,
        script: &ScriptRecord,
        target: &Version,
        instructions: &InstructionSet,
        progress: ProgressEmitter,
    ) -> Result<AnalysisResult, AnalysisError> {
        if instructions.is_empty() {
            debug!(path = %script.path.display(), "No instructions apply, skipping model call");
            return Ok(AnalysisResult::from_issues(script.path.clone(), Vec::new()));
        }

        let prompt = analysis_prompt(script, target, instructions);
        let total = estimate_tokens(&script.content);
        let answer = self.complete(&prompt, &progress, total).await?;
        let issues = parse_issues(&answer);
        debug!(path = %script.path.display(), issues = issues.len(), "Script analyzed");
        Ok(AnalysisResult::from_issues(script.path.clone(), issues))
    }
}

fn analysis_prompt(script: &ScriptRecord, target: &Version, instructions: &InstructionSet) -> String {
    let mut checks = String::new();
    for (i, instr) in instructions.instructions.iter().enumerate() {
        checks.push_str(&format!("{}. [{}] {}\n", i + 1, instr.introduced_in, instr.description));
        if let Some(detection) = &instr.detection {
            checks.push_str(&format!("   Detect: {detection}\n"));
        }
        if let Some(remediation) = &instr.remediation {
            checks.push_str(&format!("   Fix: {remediation}\n"));
        }
    }
    let since = script
        .version()
        .map_or_else(|| "unknown".to_string(), ToString::to_string);

    format!(
        r#"You are a Nushell expert reviewing a script for compatibility with Nushell {target}.

Script path: {path}
Last known compatible version: {since}
Target version: {target}

Breaking changes to check:
{checks}
Script content:
```nushell
{content}
```

If none of the changes affect this script, answer with the single word COMPATIBLE.
Otherwise answer with a JSON array only, one element per problem:
{{"description": "what breaks", "suggested_fix": "replacement code", "severity": "error|warning|info", "line": 12}}
"#,
        path = script.path.display(),
        content = script.content,
    )
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    #[serde(alias = "message")]
    description: String,
    #[serde(default)]
    suggested_fix: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    line: Option<Value>,
}

fn line_number(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse an analysis answer into issues. `COMPATIBLE` means none; anything
/// that is not a JSON issue list becomes one warning carrying the raw text.
fn parse_issues(answer: &str) -> Vec<CompatibilityIssue> {
    let body = strip_code_fence(answer);
    if body.is_empty() || body.trim_end_matches('.').eq_ignore_ascii_case("compatible") {
        return Vec::new();
    }

    let parsed = extract_json_array(body)
        .and_then(|json| serde_json::from_str::<Vec<RawIssue>>(json).ok());

    match parsed {
        Some(raw) => raw
            .into_iter()
            .map(|r| CompatibilityIssue {
                severity: r
                    .severity
                    .as_deref()
                    .map_or(Severity::Warning, Severity::parse_lenient),
                message: r.description,
                suggested_fix: r.suggested_fix.filter(|s| !s.trim().is_empty()),
                line: r.line.as_ref().and_then(line_number),
            })
            .collect(),
        None => vec![CompatibilityIssue {
            severity: Severity::Warning,
            message: body.to_string(),
            suggested_fix: None,
            line: None,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompatibilityInstruction, Resolution, VersionSource};
    use std::path::PathBuf;

    fn script() -> ScriptRecord {
        ScriptRecord {
            path: PathBuf::from("/s/env.nu"),
            root: PathBuf::from("/s"),
            content: "let-env FOO = 1\n".into(),
            content_hash: 0,
            has_shebang: false,
            header_marker: None,
            resolution: Some(Resolution {
                version: Version::new(0, 80, 0),
                source: VersionSource::Default,
            }),
        }
    }

    #[test]
    fn compatible_answer_has_no_issues() {
        assert!(parse_issues("COMPATIBLE").is_empty());
        assert!(parse_issues("  compatible.\n").is_empty());
        assert!(parse_issues("[]").is_empty());
    }

    #[test]
    fn json_issues_are_parsed() {
        let answer = r#"```json
[{"description": "`let-env` was removed", "suggested_fix": "$env.FOO = 1", "severity": "error", "line": 1},
 {"message": "old flag", "severity": "bogus", "line": "7"}]
```"#;
        let issues = parse_issues(answer);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].severity, Severity::Error);
        assert_eq!(issues[0].line, Some(1));
        assert_eq!(issues[0].suggested_fix.as_deref(), Some("$env.FOO = 1"));
        assert_eq!(issues[1].severity, Severity::Warning);
        assert_eq!(issues[1].line, Some(7));
    }

    #[test]
    fn free_text_becomes_warning() {
        let issues = parse_issues("The script uses let-env which no longer exists.");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);
        assert!(issues[0].message.contains("let-env"));
    }

    #[test]
    fn prompt_lists_instructions_and_content() {
        let set = InstructionSet::new(vec![CompatibilityInstruction {
            description: "`let-env` removed".into(),
            introduced_in: Version::new(0, 83, 0),
            detection: Some("let-env X = ...".into()),
            remediation: Some("$env.X = ...".into()),
        }]);
        let prompt = analysis_prompt(&script(), &Version::new(0, 100, 0), &set);
        assert!(prompt.contains("1. [0.83.0] `let-env` removed"));
        assert!(prompt.contains("Detect: let-env X = ..."));
        assert!(prompt.contains("Last known compatible version: 0.80.0"));
        assert!(prompt.contains("let-env FOO = 1"));
    }
}
