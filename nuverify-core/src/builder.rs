//! Instruction building: change-log text in, compatibility instructions out.
//!
//! The pipeline only decides *when* to build; [`InstructionBuilder`] decides
//! how. [`LlmInstructionBuilder`] fetches release notes from a
//! [`ChangeLogSource`] and distills each release with an [`LlmProvider`].

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::error::BuildError;
use crate::llm::{LlmProvider, extract_json_array, strip_code_fence};
use crate::pipeline::CancellationToken;
use crate::source::{ChangeLogBlock, ChangeLogSource};
use crate::types::{CompatibilityInstruction, InstructionSet};
use crate::version::{Version, VersionRange};

/// Longest release text sent to the model in one prompt.
const MAX_BLOCK_CHARS: usize = 120_000;

/// Boundary for producing the instruction set of a version range.
#[async_trait::async_trait]
pub trait InstructionBuilder: Send + Sync + std::fmt::Debug {
    /// Change-log text for every release in `range`, oldest first.
    async fn fetch_change_log(&self, range: &VersionRange)
    -> Result<Vec<ChangeLogBlock>, BuildError>;

    /// Turn change-log blocks into ordered instructions.
    async fn distill(&self, blocks: &[ChangeLogBlock]) -> Result<InstructionSet, BuildError>;
}

/// Fetch then distill. An empty change log yields an empty set.
#[instrument(skip_all, name = "build_instructions", fields(range = %range))]
pub async fn build_instructions(
    builder: &dyn InstructionBuilder,
    range: &VersionRange,
) -> Result<InstructionSet, BuildError> {
    let blocks = builder.fetch_change_log(range).await?;
    if blocks.is_empty() {
        info!("No releases in range, nothing to distill");
        return Ok(InstructionSet::default());
    }
    let set = builder.distill(&blocks).await?;
    info!(
        releases = blocks.len(),
        instructions = set.len(),
        "Built instruction set"
    );
    Ok(set)
}

/// Release notes from a [`ChangeLogSource`], distilled by an LLM.
#[derive(Debug, Clone)]
pub struct LlmInstructionBuilder {
    source: Arc<dyn ChangeLogSource>,
    llm: Arc<dyn LlmProvider>,
    cancel: CancellationToken,
}

impl LlmInstructionBuilder {
    pub fn new(source: Arc<dyn ChangeLogSource>, llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            source,
            llm,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop issuing distillation calls once `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn distill_block(
        &self,
        block: &ChangeLogBlock,
    ) -> Result<Vec<CompatibilityInstruction>, BuildError> {
        let prompt = distill_prompt(block);
        let (text, usage) = self
            .llm
            .call(&prompt)
            .await
            .map_err(|e| BuildError::Distill {
                version: block.version.clone(),
                reason: e.to_string(),
            })?;
        debug!(
            version = %block.version,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Distilled release notes"
        );
        Ok(parse_instructions(&text, &block.version))
    }
}

#[async_trait::async_trait]
impl InstructionBuilder for LlmInstructionBuilder {
    async fn fetch_change_log(
        &self,
        range: &VersionRange,
    ) -> Result<Vec<ChangeLogBlock>, BuildError> {
        self.source
            .change_log(range)
            .await
            .map_err(|e| BuildError::ChangeLogUnavailable {
                from: range.from.clone(),
                to: range.to.clone(),
                reason: e.to_string(),
            })
    }

    async fn distill(&self, blocks: &[ChangeLogBlock]) -> Result<InstructionSet, BuildError> {
        let mut instructions = Vec::new();
        for block in blocks {
            if self.cancel.is_cancelled() {
                info!(version = %block.version, "Build cancelled before distilling");
                return Err(BuildError::Cancelled);
            }
            instructions.extend(self.distill_block(block).await?);
        }
        Ok(InstructionSet::new(instructions))
    }
}

fn distill_prompt(block: &ChangeLogBlock) -> String {
    let text = truncate_chars(&block.text, MAX_BLOCK_CHARS);
    format!(
        r#"You are a Nushell expert reading the release notes for Nushell {version}.
List every change in this release that can break or alter an existing Nushell script:
removed or renamed commands, changed flags or parameters, changed syntax,
changed scoping or data types, and deprecations with their replacements.
Skip new features, performance work, bug fixes that keep behavior, and documentation.

Answer with a JSON array only. Each element:
{{"description": "what changed", "detection": "how to spot the old usage in a script", "remediation": "what to write instead"}}
Answer [] if nothing in this release affects existing scripts.

Release notes:
{text}
"#,
        version = block.version,
    )
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => {
            warn!(max, "Release notes truncated");
            &text[..idx]
        }
        None => text,
    }
}

#[derive(Debug, Deserialize)]
struct RawInstruction {
    description: String,
    #[serde(default)]
    detection: Option<String>,
    #[serde(default, alias = "new_pattern", alias = "replacement")]
    remediation: Option<String>,
}

/// Parse a distillation answer. Free-form text becomes one instruction.
fn parse_instructions(text: &str, version: &Version) -> Vec<CompatibilityInstruction> {
    let body = strip_code_fence(text);
    if body.is_empty() {
        return Vec::new();
    }

    let parsed = extract_json_array(body)
        .and_then(|json| serde_json::from_str::<Vec<RawInstruction>>(json).ok());

    match parsed {
        Some(raw) => raw
            .into_iter()
            .filter(|r| !r.description.trim().is_empty())
            .map(|r| CompatibilityInstruction {
                description: r.description.trim().to_string(),
                introduced_in: version.clone(),
                detection: r.detection.filter(|s| !s.trim().is_empty()),
                remediation: r.remediation.filter(|s| !s.trim().is_empty()),
            })
            .collect(),
        None => {
            warn!(%version, "Distillation answer was not JSON, keeping raw text");
            vec![CompatibilityInstruction {
                description: body.to_string(),
                introduced_in: version.clone(),
                detection: None,
                remediation: None,
            }]
        }
    }
}
