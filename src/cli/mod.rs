mod service;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::core::channels::{ChannelRegistry, ConfiguredDirectory};
use crate::core::config::AppConfig;
use crate::core::terminal::{self, GuideSection, print_error, print_status, print_success, print_warn};

const CONFIG_ENV: &str = "REPORTBOT_CONFIG";

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Service")
        .command("run", "Poll the configured channels and process report requests")
        .command("check", "Validate the configuration and list the monitored channels")
        .command("help", "Show this message")
        .print();

    GuideSection::new("Options")
        .text("--config, -c <path>   Configuration file")
        .blank()
        .text(&format!(
            "Without --config, ${} is used, then {}.",
            CONFIG_ENV,
            AppConfig::default_path().display()
        ))
        .blank()
        .hint("reportbot run --config /etc/reportbot/config.toml", "")
        .print();

    println!(
        "\n {} {} <command> [--config <path>]\n",
        style("Usage:").bold(),
        style("reportbot").green()
    );
}

pub(crate) fn parse_config_flag(args: &[String], start: usize) -> Option<PathBuf> {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    return Some(PathBuf::from(&args[i + 1]));
                }
                i += 1;
            }
            other => {
                if let Some(path) = other.strip_prefix("--config=") {
                    return Some(PathBuf::from(path));
                }
                i += 1;
            }
        }
    }
    None
}

/// Flag first, then the environment, then the per-user default.
pub(crate) fn resolve_config_path<F>(flag: Option<PathBuf>, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    flag.or_else(|| {
        lookup(CONFIG_ENV)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
    })
    .unwrap_or_else(AppConfig::default_path)
}

async fn run_check(cfg: &AppConfig, path: &std::path::Path) -> Result<()> {
    print_success(&format!("Configuration {} is valid", path.display()));
    print_status("Command prefix", &cfg.commands.prefix);
    if let Some(admin) = &cfg.commands.admin_channel_id {
        print_status("Admin channel", admin.as_str());
    }
    match &cfg.commands.notification_channel_id {
        Some(id) => print_status("Notification channel", id.as_str()),
        None => print_warn("No notification channel: failure alerts are disabled"),
    }
    print_status(
        "Workers",
        &format!(
            "{} (timeout {:?})",
            cfg.queue.worker_count,
            cfg.queue.job_timeout()
        ),
    );
    if cfg.report_system.is_none() {
        print_warn("No report system configured: coverage and broadcasts will be unavailable");
    }

    let registry = ChannelRegistry::new(std::sync::Arc::new(ConfiguredDirectory::new(
        cfg.channels.clone(),
        cfg.channels_file.clone(),
    )));
    registry.refresh().await?;
    let active = registry.active_channels().await;
    let mut section = GuideSection::new(&format!("Monitored channels ({})", active.len()));
    for channel in &active {
        section = section.status(&channel.project_name, channel.channel_id.as_str());
    }
    if active.is_empty() {
        section = section.text("No active channels.");
    }
    section.print();
    println!();
    Ok(())
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };

    match cmd {
        "run" | "check" => {
            let path = resolve_config_path(parse_config_flag(&args, 2), |k| std::env::var(k).ok());
            let cfg = match AppConfig::load(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    print_error(&e.to_string());
                    std::process::exit(2);
                }
            };
            if cmd == "check" {
                run_check(&cfg, &path).await
            } else {
                service::run_service(cfg).await?;
                terminal::print_goodbye();
                Ok(())
            }
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
