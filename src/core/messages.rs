//! Text posted back to channels.

use std::time::Duration;

use crate::core::channels::{ChannelId, MonitoredChannel};
use crate::core::queue::{Job, JobId, JobOutcome, JobStatus, QueueStatus};
use crate::core::report::CoverageSummary;

pub const GENERIC_ERROR: &str =
    "❌ Something went wrong while handling that command. An administrator can check the logs.";

const CHANNEL_LIST_LIMIT: usize = 15;
const UNKNOWN_CHANNEL_LIST_LIMIT: usize = 10;
const PROJECTS_PER_COORDINATOR: usize = 3;

pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{}s", s),
        (0, m, s) => format!("{}m {:02}s", m, s),
        (h, m, _) => format!("{}h {:02}m", h, m),
    }
}

fn format_minutes(d: Duration) -> String {
    let mins = d.as_secs() / 60;
    if mins == 0 {
        format!("{} seconds", d.as_secs())
    } else if mins == 1 {
        "1 minute".to_string()
    } else {
        format!("{} minutes", mins)
    }
}

pub fn intake_started(project: &str, job_id: JobId) -> String {
    format!(
        "🔄 Generating the report for **{}** (job `{}`). I'll post the link here when it's ready.",
        project, job_id
    )
}

pub fn intake_queued(project: &str, job_id: JobId, position: usize) -> String {
    format!(
        "⏳ Report for **{}** queued (job `{}`), position {} in line. I'll post the link here when it's ready.",
        project,
        job_id,
        position + 1
    )
}

pub fn intake_duplicate(
    project: &str,
    job_id: JobId,
    status: JobStatus,
    position: usize,
    elapsed: Duration,
) -> String {
    match status {
        JobStatus::Running => format!(
            "ℹ️ A report for **{}** is already being generated (job `{}`, running for {}). No new request was created.",
            project,
            job_id,
            format_elapsed(elapsed)
        ),
        _ => format!(
            "ℹ️ A report for **{}** is already queued (job `{}`, position {} in line). No new request was created.",
            project,
            job_id,
            position + 1
        ),
    }
}

pub fn job_running(project: &str, job_id: JobId) -> String {
    format!("⚙️ Working on the report for **{}** (job `{}`)...", project, job_id)
}

/// Single line the progress message is edited to once the job ends.
pub fn progress_final(job: &Job) -> String {
    let state = match job.status {
        JobStatus::Succeeded => "✅ finished",
        JobStatus::Failed => "❌ failed",
        JobStatus::TimedOut => "⏱️ timed out",
        JobStatus::Cancelled => "🚫 cancelled",
        JobStatus::Queued | JobStatus::Running => "⚙️ in progress",
    };
    format!(
        "Report for **{}** (job `{}`): {} after {}.",
        job.project_name,
        job.id,
        state,
        format_elapsed(job.elapsed())
    )
}

pub fn terminal(job: &Job, timeout: Duration) -> String {
    match &job.result {
        Some(JobOutcome::Succeeded { links }) => {
            let mut out = format!("✅ Report for **{}** is ready!\n", job.project_name);
            for link in links {
                out.push_str(&format!("🔗 {}\n", link));
            }
            out.trim_end().to_string()
        }
        Some(JobOutcome::Failed(notice)) => format!(
            "❌ The report for **{}** could not be generated.\n{}",
            job.project_name, notice.message
        ),
        Some(JobOutcome::TimedOut) => format!(
            "⏱️ The report for **{}** took longer than {} and was cancelled automatically. You can request it again.",
            job.project_name,
            format_minutes(timeout)
        ),
        Some(JobOutcome::Cancelled { reason }) => format!(
            "🚫 The report for **{}** was cancelled: {}.",
            job.project_name, reason
        ),
        None => format!("Report for **{}** ended.", job.project_name),
    }
}

pub fn admin_alert(job: &Job) -> Option<String> {
    let detail = match &job.result {
        Some(JobOutcome::Failed(notice)) => notice.category.as_str().to_string(),
        Some(JobOutcome::TimedOut) => "timeout".to_string(),
        _ => return None,
    };
    Some(format!(
        "⚠️ **Report job {}** for **{}** in {} ended as `{}` ({}) after {}.",
        job.id,
        job.project_name,
        job.channel_id.mention(),
        job.status.as_str(),
        detail,
        format_elapsed(job.elapsed())
    ))
}

pub fn queue_status(status: &QueueStatus) -> String {
    let busy = status.worker_count - status.free_workers;
    let mut out = format!(
        "📊 **Report queue**\nWorkers busy: {}/{}\nWaiting: {}\n",
        busy, status.worker_count, status.queue_length
    );
    for worker in &status.workers {
        match &worker.job {
            Some((job_id, project)) => out.push_str(&format!(
                "• Worker {}: **{}** (job `{}`)\n",
                worker.worker_id + 1,
                project,
                job_id
            )),
            None => out.push_str(&format!("• Worker {}: idle\n", worker.worker_id + 1)),
        }
    }
    let running: Vec<_> = status
        .jobs
        .iter()
        .filter(|j| j.status == JobStatus::Running)
        .collect();
    if !running.is_empty() {
        out.push_str("\n**Running**\n");
        for job in running {
            out.push_str(&format!(
                "• **{}** ({}), {}\n",
                job.project_name,
                job.channel_id.mention(),
                format_elapsed(job.elapsed)
            ));
        }
    }
    let queued: Vec<_> = status
        .jobs
        .iter()
        .filter(|j| j.status == JobStatus::Queued)
        .collect();
    if !queued.is_empty() {
        out.push_str("\n**Queued**\n");
        for job in queued {
            out.push_str(&format!(
                "{}. **{}** ({}), waiting {}\n",
                job.position.unwrap_or(0) + 1,
                job.project_name,
                job.channel_id.mention(),
                format_elapsed(job.elapsed)
            ));
        }
    }
    if status.jobs.is_empty() {
        out.push_str("\nNo reports in progress.\n");
    }
    out.trim_end().to_string()
}

pub fn help(prefix: &str) -> String {
    [
        "📖 **Commands**".to_string(),
        format!("`{p}relatorio` - generate this channel's report", p = prefix),
        format!(
            "`{p}relatorio sem-dashboard` - generate it without the dashboard link",
            p = prefix
        ),
        format!("`{p}status` - show the report queue", p = prefix),
        format!("`{p}controle` - weekly report coverage", p = prefix),
        format!("`{p}canais` - list monitored projects", p = prefix),
        format!("`{p}topico` - where to request this project's report", p = prefix),
        format!(
            "`{p}notificar` / `{p}notificar_coordenadores` - admin channel only",
            p = prefix
        ),
    ]
    .join("\n")
}

pub fn channel_list(channels: &[MonitoredChannel]) -> String {
    if channels.is_empty() {
        return "No projects are being monitored right now.".to_string();
    }
    let mut out = format!("📋 **Monitored projects ({})**\n", channels.len());
    for (i, c) in channels.iter().take(CHANNEL_LIST_LIMIT).enumerate() {
        out.push_str(&format!(
            "{}. **{}** {}\n",
            i + 1,
            c.project_name,
            c.channel_id.mention()
        ));
    }
    if channels.len() > CHANNEL_LIST_LIMIT {
        out.push_str(&format!(
            "... and {} more\n",
            channels.len() - CHANNEL_LIST_LIMIT
        ));
    }
    out.trim_end().to_string()
}

pub fn topic(channel: Option<&MonitoredChannel>, prefix: &str) -> String {
    match channel {
        Some(c) if c.active => format!(
            "📋 Reports for **{}** are requested with `{}relatorio` in {}.",
            c.project_name,
            prefix,
            c.channel_id.mention()
        ),
        Some(c) => format!("Reports for **{}** are currently disabled.", c.project_name),
        None => "This channel is not linked to any project.".to_string(),
    }
}

pub fn channel_not_configured(channel_id: &ChannelId, active: &[MonitoredChannel]) -> String {
    let mut out = format!(
        "❌ Channel {} is not configured for reports.",
        channel_id.mention()
    );
    if !active.is_empty() {
        out.push_str("\nConfigured projects:\n");
        for c in active.iter().take(UNKNOWN_CHANNEL_LIST_LIMIT) {
            out.push_str(&format!("• **{}** {}\n", c.project_name, c.channel_id.mention()));
        }
        if active.len() > UNKNOWN_CHANNEL_LIST_LIMIT {
            out.push_str(&format!(
                "... and {} more\n",
                active.len() - UNKNOWN_CHANNEL_LIST_LIMIT
            ));
        }
    }
    out.trim_end().to_string()
}

pub fn reports_disabled(project: &str) -> String {
    format!("⚠️ Reports for **{}** are disabled.", project)
}

pub fn project_incomplete(project: &str) -> String {
    format!(
        "⚠️ The configuration for **{}** is incomplete (no project id). Ask an administrator to fix it.",
        project
    )
}

pub fn admin_only(prefix: &str, verb: &str) -> String {
    format!(
        "🔒 `{}{}` can only be used in the administration channel.",
        prefix, verb
    )
}

pub fn coverage(summary: &CoverageSummary) -> String {
    let mut out = format!(
        "📊 **Report coverage - {}**\n📋 Projects: {}\n✅ Should generate: {}\n📝 Generated: {}\n⚠️ Missing: {}\n",
        summary.week_label,
        summary.total_projects,
        summary.should_generate,
        summary.generated,
        summary.missing
    );
    if !summary.missing_by_coordinator.is_empty() {
        out.push_str("\n**Missing by coordinator**\n");
        for (coordinator, projects) in &summary.missing_by_coordinator {
            out.push_str(&format!(
                "👤 **{}**: {} project(s)\n",
                coordinator,
                projects.len()
            ));
            for project in projects.iter().take(PROJECTS_PER_COORDINATOR) {
                out.push_str(&format!("  • {}\n", project));
            }
            if projects.len() > PROJECTS_PER_COORDINATOR {
                out.push_str(&format!(
                    "  ... and {} more\n",
                    projects.len() - PROJECTS_PER_COORDINATOR
                ));
            }
        }
    }
    out.trim_end().to_string()
}

pub fn coverage_unavailable() -> String {
    "❌ The coverage summary is unavailable right now. Please try again later.".to_string()
}

pub fn broadcast_started(what: &str, target: &ChannelId) -> String {
    format!("🚀 Sending {} to {}...", what, target.mention())
}

pub fn broadcast_finished(what: &str, target: &ChannelId, delivered: bool) -> String {
    if delivered {
        format!("✅ {} sent to {}.", capitalize(what), target.mention())
    } else {
        format!(
            "❌ {} to {} could not be sent. An administrator can check the logs.",
            capitalize(what),
            target.mention()
        )
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn elapsed_is_compact() {
        assert_eq!(format_elapsed(Duration::from_secs(9)), "9s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 60)), "3h 01m");
    }

    #[test]
    fn queued_position_is_shown_one_based() {
        let text = intake_queued("Harbor", JobId::new(), 0);
        assert!(text.contains("position 1"));
    }

    #[test]
    fn coverage_lists_at_most_three_projects_per_coordinator() {
        let mut missing = BTreeMap::new();
        missing.insert(
            "Ana".to_string(),
            vec!["A", "B", "C", "D", "E"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        let text = coverage(&CoverageSummary {
            week_label: "Week 12".into(),
            total_projects: 10,
            should_generate: 8,
            generated: 3,
            missing: 5,
            missing_by_coordinator: missing,
        });
        assert!(text.contains("**Ana**: 5 project(s)"));
        assert!(text.contains("• C"));
        assert!(!text.contains("• D"));
        assert!(text.contains("... and 2 more"));
    }

    #[test]
    fn unknown_channel_reply_caps_the_project_list() {
        let active: Vec<MonitoredChannel> = (1..=12)
            .map(|i| MonitoredChannel {
                channel_id: ChannelId::new(&i.to_string()),
                project_id: i.to_string(),
                project_name: format!("P{}", i),
                active: true,
            })
            .collect();
        let text = channel_not_configured(&ChannelId::new("99"), &active);
        assert!(text.contains("**P10**"));
        assert!(!text.contains("**P11**"));
        assert!(text.ends_with("... and 2 more"));
    }
}
