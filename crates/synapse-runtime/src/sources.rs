//! Event Observer — long-lived producers that convert external signals into
//! [`Event`]s and feed them into a single channel consumed by the rule engine.
//!
//! Each source runs as an independent, cancellable `tokio` task and shares no
//! mutable state with any other source.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use synapse_types::Event;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Classify a journal message into an event kind, or `None` if it should be
/// dropped as noise. `priority` is the journald `PRIORITY` field (0=emerg,
/// 7=debug); generic error keywords only classify at priority ≤ 4 so INFO
/// and DEBUG lines never become errors.
pub fn classify_message(message: &str, unit: &str, is_kernel: bool, priority: u8) -> Option<&'static str> {
    let msg = message.to_lowercase();

    if is_kernel {
        const KERNEL_CRITICAL: &[&str] = &[
            "[err]", "oops", "panic", "bug:", "firmware crash", "hardware error", "mce:", "segfault",
            "general protection fault", "fw crash", "ser catches error",
        ];
        if KERNEL_CRITICAL.iter().any(|p| msg.contains(p)) {
            return Some("error_kernel_critical");
        }
        const KERNEL_OPERATIONAL: &[&str] =
            &["error", "failed", "failure", "timeout", "i/o error", "badaddr", "halt", "warning"];
        if KERNEL_OPERATIONAL.iter().any(|p| msg.contains(p)) {
            return Some("error_kernel_operational");
        }
        return None;
    }

    let unit_lower = unit.to_lowercase();
    if unit_lower.contains("dream") {
        if msg.contains("promotion") {
            return Some("dream_promotion");
        }
        if msg.contains("survivor") || msg.contains("generation") {
            return Some("dream_generation");
        }
        if msg.contains("failed") || msg.contains("error") {
            return Some("dream_error");
        }
    }
    if unit_lower.contains("phase") {
        if msg.contains("complete") || msg.contains("finished") {
            return Some("phase_complete");
        }
        if msg.contains("timeout") {
            return Some("phase_timeout");
        }
        if msg.contains("failed") {
            return Some("phase_error");
        }
    }
    if msg.contains("oom") || msg.contains("out of memory") {
        return Some("gpu_oom");
    }
    if msg.contains("lock") && msg.contains("contention") {
        return Some("lock_contention");
    }

    if priority <= 4 {
        const ERROR_KEYWORDS: &[&str] = &[
            "error:", "exception", "traceback", "failed:", "failure:", "critical:", "fatal:", "valueerror",
            "typeerror", "keyerror", "attributeerror", "indexerror",
        ];
        if ERROR_KEYWORDS.iter().any(|k| msg.contains(k)) {
            if ["critical", "fatal", "oom", "crash"].iter().any(|k| msg.contains(k)) {
                return Some("error_critical");
            }
            return Some("error_operational");
        }
    }
    None
}

/// Tails `journalctl` for a configured set of units, or kernel-transport
/// logs, classifying each line into an [`Event`].
pub struct JournalSource {
    units: Vec<String>,
    watch_kernel: bool,
}

impl JournalSource {
    pub fn for_units(units: Vec<String>) -> Self {
        Self { units, watch_kernel: false }
    }

    pub fn for_kernel() -> Self {
        Self { units: vec![], watch_kernel: true }
    }

    /// Run the source until the process is killed or `journalctl` exits.
    /// Classified events are sent on `tx`; unclassified lines are dropped.
    pub async fn run(self, tx: mpsc::Sender<Event>) -> Result<(), std::io::Error> {
        let mut cmd = Command::new("journalctl");
        if self.watch_kernel {
            cmd.args(["_TRANSPORT=kernel", "-f", "--output=json", "--since=now"]);
        } else {
            for unit in &self.units {
                cmd.args(["-u", unit]);
            }
            cmd.args(["-f", "--output=json", "--since=now"]);
        }
        cmd.stdout(std::process::Stdio::piped());
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<serde_json::Value>(&line) else {
                tracing::warn!(line = %line, "invalid journal JSON");
                continue;
            };
            let priority: u8 = entry.get("PRIORITY").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(6);
            let message = entry.get("MESSAGE").map(|v| match v {
                serde_json::Value::Array(parts) => {
                    parts.iter().map(|p| p.as_str().unwrap_or_default()).collect::<Vec<_>>().join("\n")
                }
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }).unwrap_or_default();
            let unit = if self.watch_kernel {
                entry.get("SYSLOG_IDENTIFIER").or_else(|| entry.get("_COMM")).and_then(|v| v.as_str()).unwrap_or("kernel").to_string()
            } else {
                entry.get("_SYSTEMD_UNIT").and_then(|v| v.as_str()).unwrap_or_default().to_string()
            };

            if let Some(kind) = classify_message(&message, &unit, self.watch_kernel, priority) {
                let event = Event::new("journald", kind)
                    .with_data("unit", unit)
                    .with_data("message", message);
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }
}

fn classify_file_change(path: &std::path::Path) -> Option<&'static str> {
    let name = path.file_name()?.to_str()?;
    let parent = path.parent()?.file_name().and_then(|p| p.to_str()).unwrap_or_default();

    if parent == "promotions" && name.ends_with(".json") {
        return Some("promotion_new");
    }
    if parent == "signals" && name.contains("phase_complete") {
        return Some("phase_signal");
    }
    if name == "ready" && path.to_string_lossy().contains("dream") {
        return Some("dream_heartbeat");
    }
    None
}

/// Watches a set of directories for created/modified regular files.
pub struct FileWatcherSource {
    paths: Vec<PathBuf>,
}

impl FileWatcherSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    /// Run the watcher until `tx` is closed. Classified file events are
    /// forwarded; everything else (directories, unrecognized names) is
    /// dropped.
    pub async fn run(self, tx: mpsc::Sender<Event>) -> notify::Result<()> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<NotifyEvent>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
            if let Ok(event) = res {
                let _ = raw_tx.send(event);
            }
        })?;
        for path in &self.paths {
            if path.exists() {
                watcher.watch(path, RecursiveMode::NonRecursive)?;
                tracing::info!(path = %path.display(), "FileWatcherSource watching");
            }
        }

        while let Some(raw) = raw_rx.recv().await {
            if !matches!(raw.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            for path in &raw.paths {
                if path.is_dir() {
                    continue;
                }
                if let Some(kind) = classify_file_change(path) {
                    let event =
                        Event::new("inotify", kind).with_data("path", path.to_string_lossy().to_string());
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

const SYSTEM_UNIT_PATTERNS: &[&str] = &[
    "systemd-", "getty@", "serial-getty@", "console-", "emergency", "rescue", "multi-user", "graphical",
    "reboot", "poweroff", "halt", "kexec", "ctrl-alt-del", "syslog", "dbus-", "udev", "plymouth",
    "display-manager", "autovt@", "container-", "user@", "debug-",
];

fn is_system_service(unit_name: &str) -> bool {
    let lower = unit_name.to_lowercase();
    SYSTEM_UNIT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Lists disabled systemd services and timers once per `interval`, emitting
/// one `systemd_disabled` event per not-yet-audited unit, rate-limited to
/// one per second so bulk emission can't flood the intent router.
pub struct SystemdAuditSource {
    interval: Duration,
}

impl SystemdAuditSource {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub async fn run(self, tx: mpsc::Sender<Event>) {
        let mut audited: HashSet<String> = HashSet::new();
        loop {
            match list_disabled_units().await {
                Ok(units) => {
                    for (unit_name, unit_type) in units {
                        if audited.contains(&unit_name) {
                            continue;
                        }
                        audited.insert(unit_name.clone());
                        let event = Event::new("systemd_audit", "systemd_disabled")
                            .with_data("unit", unit_name)
                            .with_data("unit_type", unit_type)
                            .with_data("state", "disabled");
                        if tx.send(event).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "systemd audit failed"),
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

async fn list_disabled_units() -> Result<Vec<(String, String)>, std::io::Error> {
    let mut units = Vec::new();
    for (unit_type, type_flag) in [("service", "service"), ("timer", "timer")] {
        let output = Command::new("systemctl")
            .args(["list-unit-files", &format!("--type={type_flag}"), "--state=disabled", "--no-pager", "--no-legend"])
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some(name) = line.split_whitespace().next()
                && !is_system_service(name)
            {
                units.push((name.to_string(), unit_type.to_string()));
            }
        }
    }
    Ok(units)
}

/// Periodically scrapes a Prometheus-format endpoint and emits threshold
/// breach events.
pub struct MetricsSource {
    endpoint: String,
    interval: Duration,
    client: reqwest::Client,
}

impl MetricsSource {
    pub fn new(endpoint: impl Into<String>, interval: Duration) -> Self {
        Self { endpoint: endpoint.into(), interval, client: reqwest::Client::new() }
    }

    pub async fn run(self, tx: mpsc::Sender<Event>) {
        if self.interval.is_zero() {
            tracing::info!("MetricsSource idle: scrape interval is zero");
            return;
        }
        loop {
            match self.scrape().await {
                Ok(metrics) => {
                    for event in check_thresholds(&metrics) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "metrics scrape failed"),
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn scrape(&self) -> Result<std::collections::HashMap<String, f64>, reqwest::Error> {
        let text = self.client.get(&self.endpoint).timeout(Duration::from_secs(5)).send().await?.text().await?;
        let mut metrics = std::collections::HashMap::new();
        for line in text.lines() {
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            if let (Some(name_part), Some(value_part)) = (parts.next(), parts.next()) {
                let name = name_part.split('{').next().unwrap_or(name_part);
                if let Ok(value) = value_part.parse::<f64>() {
                    metrics.insert(name.to_string(), value);
                }
            }
        }
        Ok(metrics)
    }
}

fn check_thresholds(metrics: &std::collections::HashMap<String, f64>) -> Vec<Event> {
    let mut events = Vec::new();
    let lock_contention = metrics.get("kloros_orchestrator_lock_contention_total").copied().unwrap_or(0.0);
    if lock_contention > 10.0 {
        events.push(Event::new("metrics", "lock_contention_high").with_data("metric", "lock_contention").with_data("value", lock_contention));
    }
    let phase_duration = metrics.get("kloros_phase_duration_seconds").copied().unwrap_or(0.0);
    if phase_duration > 7200.0 {
        events.push(Event::new("metrics", "phase_duration_high").with_data("metric", "phase_duration").with_data("value", phase_duration));
    }
    events
}

/// Watches the dead-letter queue for growth and emits a critical event when
/// new entries appear, including one catch-up event for any dead letters
/// already present on startup.
pub struct DeadLetterMonitor {
    path: PathBuf,
    check_interval: Duration,
}

impl DeadLetterMonitor {
    pub fn new(path: PathBuf, check_interval: Duration) -> Self {
        Self { path, check_interval }
    }

    pub async fn run(self, tx: mpsc::Sender<Event>) {
        let mut last_size: u64 = 0;
        let mut startup_complete = false;

        loop {
            let Ok(metadata) = tokio::fs::metadata(&self.path).await else {
                tokio::time::sleep(self.check_interval).await;
                continue;
            };
            let current_size = metadata.len();

            if !startup_complete {
                if current_size > 0
                    && let Ok(contents) = tokio::fs::read_to_string(&self.path).await
                {
                    let count = contents.lines().filter(|l| !l.trim().is_empty()).count();
                    let event = Event::new("dead_letter_monitor", "error_critical")
                        .with_data("message", format!("Found {count} historical dead letters on startup"));
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                last_size = current_size;
                startup_complete = true;
                tokio::time::sleep(self.check_interval).await;
                continue;
            }

            if current_size > last_size
                && let Ok(contents) = tokio::fs::read_to_string(&self.path).await
            {
                let new_entries = &contents[(last_size as usize).min(contents.len())..];
                let new_count = new_entries.lines().filter(|l| !l.trim().is_empty()).count();
                if new_count > 0 {
                    let last_error = new_entries
                        .lines()
                        .rev()
                        .find_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
                        .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(str::to_string))
                        .unwrap_or_else(|| "unknown error".to_string());
                    let event = Event::new("dead_letter_monitor", "error_critical")
                        .with_data("message", format!("Intent routing failures detected: {new_count} new dead letters. Last error: {last_error}"))
                        .with_data("dead_letter_count", new_count as i64);
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                last_size = current_size;
            }
            tokio::time::sleep(self.check_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_kernel_critical() {
        assert_eq!(classify_message("kernel BUG: soft lockup", "kernel", true, 3), Some("error_kernel_critical"));
    }

    #[test]
    fn classify_kernel_operational() {
        assert_eq!(classify_message("i2c transfer timeout", "kernel", true, 4), Some("error_kernel_operational"));
    }

    #[test]
    fn classify_kernel_noise_is_dropped() {
        assert_eq!(classify_message("link up 1000 Mbps", "kernel", true, 6), None);
    }

    #[test]
    fn classify_dream_promotion() {
        assert_eq!(classify_message("promotion completed", "dream.service", false, 6), Some("dream_promotion"));
    }

    #[test]
    fn classify_phase_timeout() {
        assert_eq!(classify_message("phase timeout waiting on lock", "phase-runner.service", false, 6), Some("phase_timeout"));
    }

    #[test]
    fn classify_gpu_oom() {
        assert_eq!(classify_message("CUDA out of memory", "vllm.service", false, 3), Some("gpu_oom"));
    }

    #[test]
    fn classify_generic_error_requires_priority_le_4() {
        assert_eq!(classify_message("ERROR: Traceback (most recent call last)", "worker.service", false, 6), None);
        assert_eq!(classify_message("ERROR: Traceback (most recent call last)", "worker.service", false, 3), Some("error_operational"));
    }

    #[test]
    fn classify_critical_keyword_wins_severity() {
        assert_eq!(classify_message("FATAL: unrecoverable crash", "worker.service", false, 2), Some("error_critical"));
    }

    #[test]
    fn classify_file_promotion_new() {
        let path = std::path::Path::new("/var/lib/kloros/promotions/2026-07-26.json");
        assert_eq!(classify_file_change(path), Some("promotion_new"));
    }

    #[test]
    fn classify_file_dream_heartbeat() {
        let path = std::path::Path::new("/var/lib/kloros/dream/ready");
        assert_eq!(classify_file_change(path), Some("dream_heartbeat"));
    }

    #[test]
    fn classify_file_unrecognized_is_none() {
        let path = std::path::Path::new("/tmp/scratch.txt");
        assert_eq!(classify_file_change(path), None);
    }

    #[test]
    fn system_service_patterns_are_recognized() {
        assert!(is_system_service("systemd-journald.service"));
        assert!(is_system_service("getty@tty1.service"));
        assert!(!is_system_service("kloros-observer.service"));
    }

    #[test]
    fn check_thresholds_fires_on_breach() {
        let mut metrics = std::collections::HashMap::new();
        metrics.insert("kloros_orchestrator_lock_contention_total".to_string(), 15.0);
        let events = check_thresholds(&metrics);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "lock_contention_high");
    }

    #[test]
    fn check_thresholds_silent_below_breach() {
        let mut metrics = std::collections::HashMap::new();
        metrics.insert("kloros_orchestrator_lock_contention_total".to_string(), 2.0);
        assert!(check_thresholds(&metrics).is_empty());
    }
}
