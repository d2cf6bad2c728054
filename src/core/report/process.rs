use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{CoverageSummary, GenerationOutput, GenerationRequest, ReportGenerator, ReportSystem};
use crate::core::channels::ChannelId;
use crate::core::config::{GeneratorConfig, ReportSystemConfig};

/// Upper bound for the short coverage/broadcast subcommands.
const REPORT_SYSTEM_TIMEOUT: Duration = Duration::from_secs(300);

/// Pull artifact links out of generator stdout, in order, without duplicates.
pub fn extract_links(stdout: &str, pattern: &Regex) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for m in pattern.find_iter(stdout) {
        let link = m
            .as_str()
            .trim_end_matches(|c| matches!(c, ')' | '>' | ']' | ',' | '.' | '"' | '\''))
            .to_string();
        if !link.is_empty() && !links.contains(&link) {
            links.push(link);
        }
    }
    links
}

/// Runs the report script as a child process.
///
/// The child is spawned with `kill_on_drop`, so when the worker abandons a
/// timed-out generation the process is killed. Processes the script itself
/// forks are not tracked.
pub struct ProcessGenerator {
    program: String,
    args: Vec<String>,
    omit_dashboard_flag: String,
    working_dir: Option<PathBuf>,
    link_pattern: Regex,
}

impl ProcessGenerator {
    pub fn from_config(cfg: &GeneratorConfig) -> Result<Self> {
        let link_pattern = Regex::new(&cfg.link_pattern)
            .with_context(|| format!("invalid link pattern `{}`", cfg.link_pattern))?;
        Ok(Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
            omit_dashboard_flag: cfg.omit_dashboard_flag.clone(),
            working_dir: cfg.working_dir.clone(),
            link_pattern,
        })
    }

    fn build_command(&self, request: &GenerationRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        for arg in &self.args {
            cmd.arg(
                arg.replace("{channel}", request.channel_id.as_str())
                    .replace("{project}", &request.project_id),
            );
        }
        if request.args.omit_dashboard && !self.omit_dashboard_flag.is_empty() {
            cmd.arg(&self.omit_dashboard_flag);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ReportGenerator for ProcessGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationOutput> {
        let mut cmd = self.build_command(request);
        info!(
            "[generator] Running {} for project {} (channel {}, omit_dashboard={})",
            self.program, request.project_id, request.channel_id, request.args.omit_dashboard
        );
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn generator `{}`", self.program))?;

        let output = tokio::select! {
            out = child.wait_with_output() => out.context("failed to collect generator output")?,
            _ = cancel.cancelled() => {
                // Dropping the wait future drops the child, which kills it.
                anyhow::bail!("generation cancelled");
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let artifact_links = extract_links(&stdout, &self.link_pattern);
        info!(
            "[generator] Project {} finished: exit={:?}, stdout={}B, stderr={}B, links={}",
            request.project_id,
            output.status.code(),
            stdout.len(),
            stderr.len(),
            artifact_links.len()
        );
        Ok(GenerationOutput {
            exit_code: output.status.code(),
            stdout,
            stderr,
            artifact_links,
        })
    }
}

/// Runs the report system's coverage and broadcast subcommands.
pub struct ProcessReportSystem {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl ProcessReportSystem {
    pub fn from_config(cfg: &ReportSystemConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
            working_dir: cfg.working_dir.clone(),
        }
    }

    async fn run(&self, subcommand: &str, extra: &[&str]) -> Result<std::process::Output> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(subcommand).args(extra);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn report system `{}`", self.program))?;
        tokio::time::timeout(REPORT_SYSTEM_TIMEOUT, child.wait_with_output())
            .await
            .with_context(|| format!("report system `{}` timed out", subcommand))?
            .context("failed to collect report system output")
    }

    async fn run_flag(&self, subcommand: &str, channel: &ChannelId) -> Result<bool> {
        let output = self.run(subcommand, &["--channel", channel.as_str()]).await?;
        if !output.status.success() {
            warn!(
                "[report-system] `{}` exited with {:?}: {}",
                subcommand,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }
}

#[async_trait]
impl ReportSystem for ProcessReportSystem {
    async fn coverage(&self) -> Result<CoverageSummary> {
        let output = self.run("coverage", &[]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "coverage exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim()).context("coverage output is not a JSON summary")
    }

    async fn notify_missing(&self, target: &ChannelId) -> Result<bool> {
        self.run_flag("notify-missing", target).await
    }

    async fn notify_coordinators(&self, admin_channel: &ChannelId) -> Result<bool> {
        self.run_flag("notify-coordinators", admin_channel).await
    }
}
