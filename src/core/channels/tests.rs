use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;

use super::*;

fn channel(id: &str, name: &str, active: bool) -> MonitoredChannel {
    MonitoredChannel {
        channel_id: ChannelId::new(id),
        project_id: format!("p-{}", id),
        project_name: name.to_string(),
        active,
    }
}

#[test]
fn channel_id_keeps_only_digits() {
    assert_eq!(ChannelId::new(" <#1234> ").as_str(), "1234");
    assert!(ChannelId::new("abc").is_empty());
    assert_eq!(ChannelId::new("99").mention(), "<#99>");
}

#[test]
fn message_ids_order_numerically() {
    let a = MessageId::parse("9").unwrap();
    let b = MessageId::parse("10").unwrap();
    assert!(a < b);
    assert!(MessageId::parse("x1").is_none());
}

#[tokio::test]
async fn file_entries_override_static_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channels.toml");
    std::fs::write(
        &path,
        r#"
[[channels]]
channel_id = "100"
project_id = "42"
project_name = "Harbor"
active = false

[[channels]]
channel_id = "300"
project_name = "Quarry"
"#,
    )
    .unwrap();

    let directory = ConfiguredDirectory::new(
        vec![channel("100", "Old Harbor", true), channel("200", "Bridge", true)],
        Some(path),
    );
    let mut listed = directory.list_monitored_channels().await.unwrap();
    listed.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0].project_name, "Harbor");
    assert!(!listed[0].active);
    assert_eq!(listed[2].project_id, "");
    assert!(listed[2].active);
}

struct FlakyDirectory {
    fail: AtomicBool,
}

#[async_trait]
impl ChannelDirectory for FlakyDirectory {
    async fn list_monitored_channels(&self) -> Result<Vec<MonitoredChannel>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("sheet unavailable");
        }
        Ok(vec![
            channel("2", "beta", true),
            channel("1", "Alpha", true),
            channel("3", "gamma", false),
        ])
    }
}

#[tokio::test]
async fn failed_refresh_keeps_previous_snapshot() {
    let directory = Arc::new(FlakyDirectory {
        fail: AtomicBool::new(false),
    });
    let registry = ChannelRegistry::new(directory.clone());
    assert_eq!(registry.refresh().await.unwrap(), 3);

    directory.fail.store(true, Ordering::SeqCst);
    assert!(registry.refresh().await.is_err());

    let active = registry.active_channels().await;
    let names: Vec<_> = active.iter().map(|c| c.project_name.as_str()).collect();
    assert_eq!(names, vec!["Alpha", "beta"]);
    assert_eq!(registry.project_name(&ChannelId::new("3")).await, "gamma");
    assert_eq!(
        registry.project_name(&ChannelId::new("77")).await,
        "channel 77"
    );
}
