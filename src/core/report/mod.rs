//! External report collaborators.
//!
//! The core never builds report content itself. It asks a `ReportGenerator`
//! for one project's report and a `ReportSystem` for the weekly coverage
//! summary and the two broadcast notifications. The production
//! implementations shell out to the report scripts (see [process]).

pub mod process;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::core::channels::ChannelId;

pub use process::{ProcessGenerator, ProcessReportSystem};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArgs {
    /// Leave the auxiliary dashboard link out of the report.
    pub omit_dashboard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub channel_id: ChannelId,
    pub project_id: String,
    pub args: JobArgs,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub artifact_links: Vec<String>,
}

impl GenerationOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    /// Runs one generation. Implementations should stop work once `cancel`
    /// fires; the caller stops waiting either way.
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationOutput>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub week_label: String,
    pub total_projects: usize,
    pub should_generate: usize,
    pub generated: usize,
    pub missing: usize,
    #[serde(default)]
    pub missing_by_coordinator: BTreeMap<String, Vec<String>>,
}

#[async_trait]
pub trait ReportSystem: Send + Sync {
    async fn coverage(&self) -> Result<CoverageSummary>;

    /// Posts the missing-reports notice to `target`. `Ok(false)` means the
    /// collaborator ran but reported that nothing was sent.
    async fn notify_missing(&self, target: &ChannelId) -> Result<bool>;

    /// Sends direct notices to coordinators, reporting back to `admin_channel`.
    async fn notify_coordinators(&self, admin_channel: &ChannelId) -> Result<bool>;
}

/// Used when no `[report_system]` is configured.
pub struct UnconfiguredReportSystem;

#[async_trait]
impl ReportSystem for UnconfiguredReportSystem {
    async fn coverage(&self) -> Result<CoverageSummary> {
        anyhow::bail!("report system is not configured")
    }

    async fn notify_missing(&self, _target: &ChannelId) -> Result<bool> {
        anyhow::bail!("report system is not configured")
    }

    async fn notify_coordinators(&self, _admin_channel: &ChannelId) -> Result<bool> {
        anyhow::bail!("report system is not configured")
    }
}
