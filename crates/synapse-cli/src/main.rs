//! `synapse-cli` – boot entry point for the self-observing introspection core.
//!
//! This binary is the single process that hosts every daemon as a task on
//! one `tokio` runtime:
//!
//! 1. Runs a **First-Run Wizard** when `~/.synapse/config.toml` is absent.
//! 2. Probes the configured Ollama endpoint and reports available models.
//! 3. Wires the Event Observer sources into the Rule Engine, the Rule Engine
//!    into the Intent Router and Investigation Worker Pool, the affect
//!    signals into the Self-Regulator, and the Unindexed Knowledge Scanner
//!    into the same worker pool.
//! 4. Serves a self-hosted Prometheus metrics endpoint.
//! 5. Intercepts Ctrl-C / SIGTERM to publish a shutdown signal and drain
//!    producers before exiting.

mod config;
mod handlers;
mod metrics;
mod ollama;
mod repl;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use synapse_bus::ChemBus;
use synapse_kernel::{InvestigationGate, MetaLoopFilter, Watchdog};
use synapse_memory::{InvestigationLog, MemoryStore, ProcessedQuestionLog, VectorIndex};
use synapse_runtime::cognitive_actions;
use synapse_runtime::investigator::{WorkerPoolConfig, QuestionOutcome};
use synapse_runtime::llm_driver::{AnalysisBackend, AnalysisDriver};
use synapse_runtime::router::IntentRouter;
use synapse_runtime::rules::RuleEngine;
use synapse_runtime::scanner::UnindexedKnowledgeScanner;
use synapse_runtime::sources::{DeadLetterMonitor, FileWatcherSource, JournalSource, MetricsSource, SystemdAuditSource};
use synapse_runtime::{CognitiveAction, PressureLevel, SelfRegulator, WorkerPool};
use synapse_types::{CuriosityQuestion, Event, Intent, Signal};
use tokio::sync::mpsc;
use tracing::warn;

/// The self-observing introspection core: a daemon-supervisor binary with a
/// handful of one-shot diagnostic subcommands.
#[derive(Parser)]
#[command(name = "synapse", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print a configuration and backend-connectivity snapshot, then exit.
    Status,
}

fn main() {
    // `telemetry::init_tracing` must run before any Tokio runtime exists: its
    // OTLP exporter uses a simple (synchronous) span exporter specifically so
    // init can happen ahead of `Runtime::new`.
    let _tracer_guard = synapse_runtime::telemetry::init_tracing("synapse-cli");

    let cli = Cli::parse();

    print_banner();

    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    print!("\n  Probing Ollama at {} … ", cfg.ollama_url.dimmed());
    match ollama::fetch_models(&cfg.ollama_url) {
        Ok(models) => {
            println!("{} ({} model(s) available)", "online".green(), models.len());
            for m in &models {
                println!("    • {}", m.name.bold());
            }
        }
        Err(_) => {
            println!("{}", "offline".yellow());
            println!("  {}  Run `{}` to start a local AI.", "No Ollama instance detected.".dimmed(), "ollama serve".bold());
        }
    }
    println!();

    if matches!(cli.command, Some(Command::Status)) {
        repl::status(&cfg);
        return;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {e}", "Failed to start Tokio runtime".red());
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cfg)) {
        eprintln!("{}: {e}", "Fatal error".red());
        std::process::exit(1);
    }
}

/// Resolve a leading `~` against `$HOME`/`$USERPROFILE`; otherwise returned
/// unchanged.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")).unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// Build a full [`CuriosityQuestion`] from an `curiosity_investigate`
/// [`Intent`]'s flat `data` fields. [`IntentRouter::route`]'s published
/// `Q_CURIOSITY_INVESTIGATE` signal only carries summary facts (no
/// evidence), so the worker pool must be fed the question directly rather
/// than reconstructed from the bus.
fn question_from_intent(intent: &Intent, now_seq: u64) -> Option<CuriosityQuestion> {
    let question = intent.data.get("question")?.as_str()?.to_string();
    let question_id = intent
        .data
        .get("question_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("rule.generated.{now_seq}"));
    let hypothesis = intent.data.get("hypothesis").and_then(|v| v.as_str()).unwrap_or(&intent.reason).to_string();
    let capability_key =
        intent.data.get("capability_key").and_then(|v| v.as_str()).unwrap_or("self_healing.unclassified").to_string();
    let priority = intent.data.get("priority").and_then(|v| v.as_str()).unwrap_or("medium").to_string();
    let evidence: Vec<String> = intent
        .data
        .get("evidence")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|e| e.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    Some(CuriosityQuestion::new(question_id, hypothesis, question, evidence, priority, capability_key))
}

/// Serialize `question` into the shape [`IntentRouter::route`] expects under
/// `intent.data["question"]` for `curiosity_investigate` intents.
fn intent_with_question(mut intent: Intent, question: &CuriosityQuestion) -> Intent {
    if let Ok(value) = serde_json::to_value(question) {
        intent.data.insert("question".to_string(), value);
    }
    intent
}

struct Daemons {
    bus: ChemBus,
    router: Arc<IntentRouter>,
    worker_pool: Arc<WorkerPool>,
    self_regulator: Arc<SelfRegulator>,
    watchdog: Arc<Mutex<Watchdog>>,
    queue_depth: Arc<AtomicUsize>,
    metrics: metrics::MetricsHandle,
    memory_store: MemoryStore,
    investigation_log: InvestigationLog,
}

async fn run(cfg: config::Config) -> Result<(), Box<dyn std::error::Error>> {
    let home = expand_home(&config::config_path().parent().map(|p| p.display().to_string()).unwrap_or_default());
    let state_dir = if home.as_os_str().is_empty() { expand_home("~/.synapse") } else { home };
    tokio::fs::create_dir_all(&state_dir).await.ok();

    let db_path = expand_home(&cfg.db_path);
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let bus = ChemBus::default();
    let shutdown = Arc::new(AtomicBool::new(false));

    // Opening creates/migrates the schema every other component's SQLite
    // connection to this file depends on existing. Cloned into `Daemons` for
    // the cognitive actions; `MemoryStore` wraps an `Arc<Mutex<Connection>>`,
    // so every clone shares the same underlying connection.
    let memory_store = MemoryStore::open(&db_path.to_string_lossy())?;
    let vector_index = VectorIndex::open(&db_path.to_string_lossy())?;

    let mut driver = AnalysisDriver::new(cfg.analysis_backend, cfg.ollama_url.clone(), cfg.active_model.clone());
    if cfg.analysis_backend == AnalysisBackend::OpenAiCompatible && !cfg.openai_api_key.is_empty() {
        driver = driver.with_api_key(cfg.openai_api_key.clone());
    }
    let driver = Arc::new(driver);
    let question_handlers = handlers::build(driver, cfg.active_model.clone());

    let gate = InvestigationGate::new(MetaLoopFilter::with_prefixes(cfg.meta_prefixes.clone()), cfg.worker_pool.max_queue_depth);
    let processed_log = ProcessedQuestionLog::open(state_dir.join("processed_questions.jsonl"))?;
    let investigation_log = InvestigationLog::open(state_dir.join("curiosity_investigations.jsonl"))?;

    let worker_config = WorkerPoolConfig {
        max_concurrent_investigations: cfg.worker_pool.max_concurrent_investigations,
        min_delay_between_investigations: cfg.worker_pool.min_delay_between_investigations(),
        normal_timeout: cfg.worker_pool.normal_timeout(),
        emergency_timeout: cfg.worker_pool.emergency_timeout(),
        max_queue_depth: cfg.worker_pool.max_queue_depth,
    };
    let worker_pool = Arc::new(WorkerPool::new(
        worker_config,
        gate,
        bus.clone(),
        processed_log,
        investigation_log.clone(),
        question_handlers,
    ));

    let dead_letters_path = state_dir.join("failed_signals.jsonl");
    let router = Arc::new(IntentRouter::new(state_dir.join("intents"), bus.clone(), &dead_letters_path)?);

    let self_regulator =
        Arc::new(SelfRegulator::new(bus.clone(), state_dir.join("EMERGENCY_BRAKE")).with_action_cooldown(cfg.self_regulator.action_cooldown()));

    let watchdog = Arc::new(Mutex::new(Watchdog::new()));
    let metrics_handle = metrics::spawn_collector(&bus);
    let queue_depth = Arc::new(AtomicUsize::new(0));

    let daemons = Daemons {
        bus: bus.clone(),
        router: router.clone(),
        worker_pool: worker_pool.clone(),
        self_regulator: self_regulator.clone(),
        watchdog: watchdog.clone(),
        queue_depth: queue_depth.clone(),
        metrics: metrics_handle.clone(),
        memory_store: memory_store.clone(),
        investigation_log,
    };

    install_shutdown_handler(bus.clone(), shutdown.clone());

    let mut tasks = Vec::new();
    let (event_tx, event_rx) = mpsc::channel::<Event>(256);

    tasks.push(tokio::spawn(spawn_observer_sources(cfg.clone(), state_dir.clone(), watchdog.clone(), event_tx)));
    tasks.push(tokio::spawn(run_rule_engine_pipeline(cfg.clone(), daemons_clone(&daemons), event_rx)));
    tasks.push(tokio::spawn(run_scanner_tick(cfg.clone(), vector_index, daemons_clone(&daemons))));
    tasks.push(tokio::spawn(run_affect_listener(daemons_clone(&daemons))));
    tasks.push(tokio::spawn(run_recovery_tick(daemons_clone(&daemons))));
    tasks.push(tokio::spawn(run_metrics_tick(daemons_clone(&daemons))));
    tasks.push(tokio::spawn(metrics::serve(metrics_handle, cfg.metrics_port)));

    println!("  {} on port {}", "Metrics endpoint live".green(), cfg.metrics_port);
    println!("  Type {} for a status snapshot.\n", "synapse status".bold().cyan());

    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    for task in tasks {
        task.abort();
    }
    Ok(())
}

fn daemons_clone(d: &Daemons) -> Daemons {
    Daemons {
        bus: d.bus.clone(),
        router: d.router.clone(),
        worker_pool: d.worker_pool.clone(),
        self_regulator: d.self_regulator.clone(),
        watchdog: d.watchdog.clone(),
        queue_depth: d.queue_depth.clone(),
        metrics: d.metrics.clone(),
        memory_store: d.memory_store.clone(),
        investigation_log: d.investigation_log.clone(),
    }
}

fn install_shutdown_handler(bus: ChemBus, shutdown: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  shutdown requested – draining producers …".yellow().bold());
        let _ = bus.publish(Signal::new("SYSTEM_SHUTDOWN").with_intensity(1.0));
        shutdown.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install shutdown handler");
    }
}

/// Spawn every Event Observer source, all feeding `tx` for
/// [`run_rule_engine_pipeline`] to consume.
async fn spawn_observer_sources(cfg: config::Config, state_dir: PathBuf, watchdog: Arc<Mutex<Watchdog>>, tx: mpsc::Sender<Event>) {
    watchdog.lock().unwrap_or_else(|e| e.into_inner()).register("event_observer.journal", Duration::from_secs(60));
    watchdog.lock().unwrap_or_else(|e| e.into_inner()).register("event_observer.kernel", Duration::from_secs(60));
    watchdog.lock().unwrap_or_else(|e| e.into_inner()).register("event_observer.files", Duration::from_secs(60));
    watchdog.lock().unwrap_or_else(|e| e.into_inner()).register("event_observer.systemd_audit", Duration::from_secs(120));
    watchdog.lock().unwrap_or_else(|e| e.into_inner()).register("event_observer.metrics", Duration::from_secs(120));
    watchdog.lock().unwrap_or_else(|e| e.into_inner()).register("event_observer.dead_letters", Duration::from_secs(120));

    let mut handles = Vec::new();

    let watched_units = cfg.observer.watched_units.clone();
    let watched_paths: Vec<PathBuf> = cfg.observer.watched_paths.iter().map(PathBuf::from).collect();
    let systemd_audit_interval = Duration::from_secs(cfg.observer.systemd_audit_interval_secs);
    let metrics_interval = Duration::from_secs(cfg.observer.metrics_poll_interval_secs);
    let metrics_endpoint = format!("http://localhost:{}/metrics", cfg.metrics_port);

    if !watched_units.is_empty() {
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let _ = JournalSource::for_units(watched_units).run(tx).await;
        }));
    }
    {
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let _ = JournalSource::for_kernel().run(tx).await;
        }));
    }
    if !watched_paths.is_empty() {
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let _ = FileWatcherSource::new(watched_paths).run(tx).await;
        }));
    }
    {
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            SystemdAuditSource::new(systemd_audit_interval).run(tx).await;
        }));
    }
    {
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            MetricsSource::new(metrics_endpoint, metrics_interval).run(tx).await;
        }));
    }
    {
        let dead_letters_path = state_dir.join("failed_signals.jsonl");
        handles.push(tokio::spawn(async move {
            DeadLetterMonitor::new(dead_letters_path, Duration::from_secs(30)).run(tx).await;
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
}

/// Drain the Event Observer channel through the Rule Engine, persist and
/// route every resulting [`Intent`], and feed `curiosity_investigate`
/// intents directly into the worker pool (see [`question_from_intent`]).
async fn run_rule_engine_pipeline(cfg: config::Config, daemons: Daemons, mut rx: mpsc::Receiver<Event>) {
    let mut engine = RuleEngine::new(Duration::from_secs(300)).with_total_gpu_mb(cfg.total_gpu_mb);
    let mut seq: u64 = 0;

    while let Some(event) = rx.recv().await {
        daemons.watchdog.lock().unwrap_or_else(|e| e.into_inner()).heartbeat("event_observer.journal");
        let Some(intent) = engine.process(&event) else { continue };
        seq += 1;

        if intent.intent_type == "curiosity_investigate" {
            if let Some(question) = question_from_intent(&intent, seq) {
                let intent = intent_with_question(intent, &question);
                let mut persisted = intent;
                if let Ok(path) = daemons.router.persist(&mut persisted).await {
                    let _ = daemons.router.route(&persisted).await;
                    let _ = IntentRouter::consume(&path);
                }
                spawn_investigation(daemons_clone(&daemons), question);
            }
            continue;
        }

        let mut persisted = intent;
        if daemons.router.persist(&mut persisted).await.is_ok() {
            let _ = daemons.router.route(&persisted).await;
        }
    }
}

/// Run one question through the worker pool, recursively resubmitting any
/// sub-questions a timeout decomposed it into.
fn spawn_investigation(daemons: Daemons, question: CuriosityQuestion) {
    daemons.queue_depth.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        let depth = daemons.queue_depth.load(Ordering::SeqCst);
        let outcome = daemons.worker_pool.process_question(question, depth).await;
        daemons.queue_depth.fetch_sub(1, Ordering::SeqCst);

        if let QuestionOutcome::TimedOut { sub_questions, .. } = outcome {
            for sub_question in sub_questions {
                spawn_investigation(daemons_clone(&daemons), sub_question);
            }
        }
    });
}

/// Periodically scan for unindexed/stale knowledge and feed any resulting
/// questions straight to the worker pool.
async fn run_scanner_tick(cfg: config::Config, vector_index: VectorIndex, daemons: Daemons) {
    if cfg.observer.watched_paths.is_empty() {
        return;
    }
    let scanner = UnindexedKnowledgeScanner::new(
        cfg.observer.watched_paths.iter().map(PathBuf::from).collect(),
        vector_index,
        "knowledge",
    );
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.observer.metrics_poll_interval_secs.max(60) * 10));
    loop {
        interval.tick().await;
        match scanner.scan().await {
            Ok(questions) => {
                for question in questions {
                    spawn_investigation(daemons_clone(&daemons), question);
                }
            }
            Err(e) => warn!(error = %e, "unindexed knowledge scan failed"),
        }
    }
}

/// Subscribe to the four affect topics, apply pressure-level changes to the
/// worker pool's concurrency cap and inter-investigation delay, and run
/// whichever cognitive actions have cleared cooldown.
async fn run_affect_listener(daemons: Daemons) {
    let mut sub = daemons.bus.subscribe();
    loop {
        let signal = match sub.recv().await {
            Ok(signal) => signal,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        if !matches!(
            signal.topic.as_str(),
            "AFFECT_MEMORY_PRESSURE" | "AFFECT_CONTEXT_OVERFLOW" | "AFFECT_TASK_FAILURE_PATTERN" | "AFFECT_RESOURCE_STRAIN"
        ) {
            continue;
        }
        let level = daemons.self_regulator.handle_signal(&signal);
        apply_pressure(&daemons, level);
        run_cognitive_actions(&daemons, level).await;
    }
}

fn apply_pressure(daemons: &Daemons, level: PressureLevel) {
    daemons.worker_pool.set_max_concurrent(level.max_concurrent());
    daemons.worker_pool.set_min_delay(level.min_delay());
}

/// Run every cognitive action whose cooldown has elapsed and the emergency
/// brake allows, dispatching each to its body in [`cognitive_actions`].
async fn run_cognitive_actions(daemons: &Daemons, level: PressureLevel) {
    let memory = daemons.memory_store.clone();
    let investigations = daemons.investigation_log.clone();
    let bus = daemons.bus.clone();
    daemons
        .self_regulator
        .run_ready_actions(move |action| {
            let memory = memory.clone();
            let investigations = investigations.clone();
            let bus = bus.clone();
            async move {
                match action {
                    CognitiveAction::SummarizeContext => cognitive_actions::summarize_context(&memory, &investigations).await,
                    CognitiveAction::ArchiveCompletedTasks => {
                        cognitive_actions::archive_completed_tasks(&memory, &investigations).await
                    }
                    CognitiveAction::ThrottleInvestigations => cognitive_actions::throttle_investigations(&bus, level).await,
                    CognitiveAction::OptimizePerformance => {
                        cognitive_actions::optimize_performance(&memory, &investigations, &bus).await
                    }
                    CognitiveAction::AnalyzeFailurePatterns => {
                        cognitive_actions::analyze_failure_patterns(&memory, &investigations).await
                    }
                }
            }
        })
        .await;
}

/// Poll for pressure-level recovery every ten seconds.
async fn run_recovery_tick(daemons: Daemons) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        interval.tick().await;
        let level = daemons.self_regulator.check_recovery();
        apply_pressure(&daemons, level);
    }
}

/// Emit `METRICS_SUMMARY` (and `BOTTLENECK_DETECTED` when warranted) every
/// five minutes, matching the cadence named in the worker pool's own
/// documentation.
async fn run_metrics_tick(daemons: Daemons) {
    let mut interval = tokio::time::interval(Duration::from_secs(300));
    loop {
        interval.tick().await;
        let depth = daemons.queue_depth.load(Ordering::SeqCst);
        daemons.worker_pool.emit_metrics_summary(depth);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       Synapse First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found. Let's set up the introspection core.\n");

    let mut cfg = config::Config::default();

    println!("  Which analysis backend would you like to use?");
    println!("    1) Local AI via Ollama  (default, offline-first)");
    println!("    2) An OpenAI-compatible API");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    if choice.trim() == "2" {
        cfg.analysis_backend = AnalysisBackend::OpenAiCompatible;
        cfg.ollama_url = prompt_line("  Endpoint base URL: ", &cfg.ollama_url);
        cfg.openai_api_key = prompt_line("  API key (leave blank if none): ", "");
    }

    cfg.active_model = prompt_line(&format!("  Model name [{}]: ", cfg.active_model), &cfg.active_model);

    let port_str = prompt_line(&format!("  Metrics endpoint port [{}]: ", cfg.metrics_port), &cfg.metrics_port.to_string());
    if let Ok(p) = port_str.trim().parse::<u16>() {
        cfg.metrics_port = p;
    }

    match config::save(&cfg) {
        Ok(()) => println!("\n  {} Config saved to {}\n", "✓".green().bold(), config::config_path().display().to_string().bold()),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____              __  __ ___ "#.bold().cyan());
    println!("{}", r#"  / __/_ _____  ___ _/ /_/ (_) "#.bold().cyan());
    println!("{}", r#" _\ \/ // / _ \/ _ `/ __/ _(_) "#.bold().cyan());
    println!("{}", r#"/___/\_, /_//_/\_,_/\__/_/(_)  "#.bold().cyan());
    println!("{}", r#"    /___/                       "#.bold().cyan());
    println!();
    println!("  {} {}", "Synapse".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Self-observing introspection core");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
