//! Tracing setup and shutdown signals

use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogSettings;

/// `RUST_LOG` wins, then `-v`, then the configured filter, then `warn`
fn filter(verbosity: u8, settings: &LogSettings) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let directives = match verbosity {
        0 => settings.filter.as_deref().unwrap_or("warn"),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("warn"))
}

pub fn init_tracing(verbosity: u8, settings: &LogSettings) {
    let registry = tracing_subscriber::registry().with(filter(verbosity, settings));

    if settings.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

#[cfg(unix)]
type Terminate = Option<signal::unix::Signal>;

#[cfg(not(unix))]
type Terminate = ();

#[cfg(unix)]
fn install_terminate() -> Terminate {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
fn install_terminate() -> Terminate {}

#[cfg(unix)]
async fn terminated(terminate: &mut Terminate) {
    match terminate {
        Some(sigterm) => {
            sigterm.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminated(_terminate: &mut Terminate) {
    std::future::pending::<()>().await
}

async fn interrupted() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Name of whichever shutdown signal arrives next
async fn next_signal(terminate: &mut Terminate) -> &'static str {
    tokio::select! {
        _ = interrupted() => "Ctrl+C",
        _ = terminated(terminate) => "SIGTERM",
    }
}

/// Resolves on the first Ctrl+C or SIGTERM. A second one of either exits at once.
pub async fn shutdown_signal() {
    let mut terminate = install_terminate();

    let first = next_signal(&mut terminate).await;
    tracing::info!("Received {}, starting graceful shutdown", first);

    tokio::spawn(async move {
        let second = next_signal(&mut terminate).await;
        tracing::warn!("Second {} received, exiting without draining", second);
        std::process::exit(130);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_overrides_configured_filter() {
        let settings = LogSettings {
            filter: Some("backlog_tasks=debug".into()),
            json: false,
        };
        if std::env::var("RUST_LOG").is_err() {
            assert_eq!(filter(0, &settings).to_string(), "backlog_tasks=debug");
            assert_eq!(filter(2, &settings).to_string(), "debug");
            assert_eq!(filter(0, &LogSettings::default()).to_string(), "warn");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_every_sigterm_is_observed() {
        let mut terminate = install_terminate();
        assert!(terminate.is_some());

        for _ in 0..2 {
            let status = std::process::Command::new("kill")
                .args(["-TERM", &std::process::id().to_string()])
                .status()
                .unwrap();
            assert!(status.success());

            let received = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                next_signal(&mut terminate),
            )
            .await
            .expect("SIGTERM should be delivered");
            assert_eq!(received, "SIGTERM");
        }
    }
}
