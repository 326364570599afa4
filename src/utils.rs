//! Small shared utilities.

use tracing::info;

/// Wait for SIGINT or SIGTERM.
///
/// Used as the graceful-shutdown future for the HTTP server and the
/// main run loop.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// Shorten a long identifier for log lines.
pub fn short_id(id: &str) -> String {
    if id.len() > 16 {
        format!("{}...", &id[..16])
    } else {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_truncates_long_ids() {
        let long = "0123456789abcdef0123456789abcdef";
        assert_eq!(short_id(long), "0123456789abcdef...");
        assert_eq!(short_id("short"), "short");
    }
}
