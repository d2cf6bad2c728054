//! Turns generator output into a user-facing outcome.
//!
//! Raw stderr never leaves this module: the returned notice carries a fixed,
//! actionable message chosen by the first matching rule.

use anyhow::{Context, Result};
use regex::Regex;

use super::types::{FailureCategory, FailureNotice, JobOutcome};
use crate::core::config::FailurePattern;
use crate::core::report::GenerationOutput;

pub const GENERIC_FAILURE: &str =
    "Report processing failed. An administrator can find the details in the logs.";

pub const NO_LINK_PRODUCED: &str = "The report was processed but no document link was produced. \
     This usually means the report could not be saved to the shared drive.";

struct Rule {
    pattern: Regex,
    category: FailureCategory,
    message: String,
}

/// Built-in rules, checked in order after the configured ones.
const BUILTIN_RULES: &[(&str, FailureCategory, &str)] = &[
    (
        r"(?i)(não foi possível encontrar projeto para o canal|no project (is )?(linked|configured|found) for (this )?channel|project not found for channel)",
        FailureCategory::NotFound,
        "No project is linked to this channel. Ask an administrator to register it in the channel directory.",
    ),
    (
        r"(?i)(projeto não encontrado ou sem dados|sem dados|no data (available|found)|insufficient data|empty (status|discipline) column)",
        FailureCategory::Data,
        "The project has no usable schedule data. Check that the schedule's status and discipline columns are filled in.",
    ),
    (
        r"(?i)(credenciais|credentials? (are )?(not available|missing|expired|invalid)|(token|api key) (is )?(invalid|expired)|invalid (token|api key)|unauthori[sz]ed)",
        FailureCategory::Authentication,
        "Credentials for one of the data sources are missing or expired. An administrator needs to renew them.",
    ),
    (
        r"(?i)(permission denied|access denied|forbidden|insufficient permissions?)",
        FailureCategory::Permission,
        "The report service was denied access to a required file or folder. An administrator needs to check its permissions.",
    ),
    (
        r"(?i)(timed? ?out|connection (refused|reset|aborted|error)|could not connect|name resolution|temporarily unavailable|service unavailable)",
        FailureCategory::Connection,
        "A data source could not be reached. Please try again in a few minutes.",
    ),
    (
        r"(?i)(template not found|no such file or directory|config(uration)? (file )?(missing|not found))",
        FailureCategory::Configuration,
        "A template or configuration file is missing on the report server. An administrator has to restore it.",
    ),
    (
        r"(?i)(out of memory|memoryerror|no space left on device)",
        FailureCategory::System,
        "The report server ran out of resources. Please try again later.",
    ),
];

pub struct FailureClassifier {
    rules: Vec<Rule>,
}

impl FailureClassifier {
    /// Configured patterns are checked before the built-in ones; they
    /// classify as `Unknown` with their own message.
    pub fn new(custom: &[FailurePattern]) -> Result<Self> {
        let mut rules = Vec::with_capacity(custom.len() + BUILTIN_RULES.len());
        for fp in custom {
            let pattern = Regex::new(&fp.pattern)
                .with_context(|| format!("invalid failure pattern `{}`", fp.pattern))?;
            rules.push(Rule {
                pattern,
                category: FailureCategory::Unknown,
                message: fp.message.clone(),
            });
        }
        for (pattern, category, message) in BUILTIN_RULES {
            rules.push(Rule {
                pattern: Regex::new(pattern)?,
                category: *category,
                message: (*message).to_string(),
            });
        }
        Ok(Self { rules })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(&[])
    }

    pub fn classify_output(&self, output: &GenerationOutput) -> JobOutcome {
        if output.succeeded() {
            if output.artifact_links.is_empty() {
                return JobOutcome::Failed(FailureNotice {
                    category: FailureCategory::Unknown,
                    message: NO_LINK_PRODUCED.to_string(),
                });
            }
            return JobOutcome::Succeeded {
                links: output.artifact_links.clone(),
            };
        }
        let text = if output.stderr.trim().is_empty() {
            output.stdout.as_str()
        } else {
            output.stderr.as_str()
        };
        JobOutcome::Failed(self.classify_text(text, output.exit_code))
    }

    /// For generators that failed without producing output at all.
    pub fn classify_error(&self, err: &anyhow::Error) -> JobOutcome {
        JobOutcome::Failed(self.classify_text(&format!("{:#}", err), None))
    }

    pub fn classify_text(&self, text: &str, exit_code: Option<i32>) -> FailureNotice {
        if let Some(rule) = self.rules.iter().find(|r| r.pattern.is_match(text)) {
            return FailureNotice {
                category: rule.category,
                message: rule.message.clone(),
            };
        }
        match exit_code {
            Some(2) => FailureNotice {
                category: FailureCategory::Configuration,
                message: "The report generator rejected its arguments. An administrator needs to check the generator configuration.".to_string(),
            },
            Some(126) | Some(127) => FailureNotice {
                category: FailureCategory::System,
                message: "The report generator could not be started on the server.".to_string(),
            },
            _ => FailureNotice {
                category: FailureCategory::Unknown,
                message: GENERIC_FAILURE.to_string(),
            },
        }
    }
}
