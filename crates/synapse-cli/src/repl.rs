//! `synapse status` – a point-in-time snapshot of the configured
//! introspection core, printed to stdout and exited. The daemon itself has
//! no interactive shell; once it boots it runs unattended on the `tokio`
//! runtime wired in `main.rs`; `status` only reads configuration and probes
//! the backends it depends on.

use colored::Colorize;
use std::io::{self, Write};

use crate::config::Config;
use crate::ollama;
use synapse_runtime::llm_driver::AnalysisBackend;

/// Print a snapshot of `cfg` and probe the backends it names.
pub fn status(cfg: &Config) {
    println!("{}", "Synapse status".bold().underline());
    println!();

    println!("  {}", "Configuration".bold());
    println!("    Config file          : {}", crate::config::config_path().display().to_string().dimmed());
    println!("    Analysis backend     : {}", format!("{:?}", cfg.analysis_backend).yellow());
    println!("    Active model         : {}", cfg.active_model.yellow());
    println!("    Memory DB            : {}", cfg.db_path.dimmed());
    println!("    Embedding model      : {}", cfg.embedding_model.dimmed());
    println!("    Metrics port         : {}", cfg.metrics_port.to_string().yellow());
    println!(
        "    Worker pool          : {} concurrent, queue depth {}",
        cfg.worker_pool.max_concurrent_investigations.to_string().yellow(),
        cfg.worker_pool.max_queue_depth.to_string().yellow()
    );
    println!("    Watched units        : {}", summarize(&cfg.observer.watched_units));
    println!("    Watched paths        : {}", summarize(&cfg.observer.watched_paths));
    println!();

    println!("  {}", "Backend connectivity".bold());
    match cfg.analysis_backend {
        AnalysisBackend::Ollama => probe_ollama(cfg),
        AnalysisBackend::OpenAiCompatible => {
            print!("    {} {} … ", "OpenAI-compatible endpoint".bold(), cfg.ollama_url.dimmed());
            io::stdout().flush().ok();
            if ollama::is_running(&cfg.ollama_url) {
                println!("{}", "reachable".green());
            } else {
                println!("{}", "unreachable".red());
            }
        }
    }
    println!();

    println!("  Run the binary with no arguments to start the daemon.");
}

fn probe_ollama(cfg: &Config) {
    print!("    {} {} … ", "Ollama".bold(), cfg.ollama_url.dimmed());
    io::stdout().flush().ok();
    match ollama::fetch_models(&cfg.ollama_url) {
        Ok(models) if models.is_empty() => println!("{}", "online, no models pulled".yellow()),
        Ok(models) => {
            println!("{}", "online".green());
            for m in &models {
                let marker = if m.name == cfg.active_model { "▶" } else { " " };
                println!("      {} {}", marker.green(), m.name.bold());
            }
        }
        Err(e) => {
            println!("{}", "offline".red());
            println!("      {}", e.dimmed());
        }
    }
}

fn summarize(items: &[String]) -> String {
    if items.is_empty() { "(none)".dimmed().to_string() } else { items.join(", ") }
}
