use anyhow::Result;
use colored::Colorize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::Config;

/// Initialize logging and tracing subsystem
pub fn init(config: &Config) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.log_format.as_str() {
        "pretty" => fmt::layer().with_target(true).boxed(),
        // JSON formatting for structured logs
        _ => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_thread_ids(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    Registry::default()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Pulsar Signaling service starting"
    );

    Ok(())
}

/// Log configuration (without secrets)
pub fn log_config(config: &Config) {
    tracing::info!(
        http_bind = %config.http_bind,
        store = if config.database_url.is_some() { "postgres" } else { "memory" },
        max_connection_time_secs = config.max_connection_time_secs,
        ping_interval_secs = config.ping_interval_secs,
        reconnect_grace_secs = config.reconnect_grace_secs,
        sweep_interval_secs = config.sweep_interval_secs,
        lobby_code_length = config.lobby_code_length,
        turn_urls = ?config.turn_urls,
        turn_secret_set = config.turn_secret.is_some(),
        cloudflare = config.cloudflare_app_id.is_some(),
        "Service configuration loaded"
    );
}

/// Startup banner for interactive terminals
pub fn print_banner(config: &Config) {
    let rule = "━".repeat(60);
    println!("\n{}", rule.bright_black());
    println!(
        "  {} {}",
        "Pulsar Signaling".bright_cyan().bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).bright_black()
    );
    println!("  {} {}", "listening on".bright_black(), config.http_bind.to_string().bold());
    println!("{}\n", rule.bright_black());
}

/// One status line per service during startup and shutdown
pub fn log_status(icon: &str, service: &str, status: &str, ok: bool) {
    let status = if ok {
        status.bright_green().bold()
    } else {
        status.bright_red().bold()
    };
    println!("  {icon} {:<20} {status}", service);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_helpers_do_not_panic() {
        let config = Config::default();
        // Subscriber init can only happen once per process, so only the
        // plain output helpers are exercised here.
        print_banner(&config);
        log_status("ok", "Store", "READY", true);
        log_status("!!", "Store", "FAILED", false);
        log_config(&config);
    }
}
