use tokio_util::sync::CancellationToken;

/// Wait for SIGINT or SIGTERM, returns the name of the signal received.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    Ok(name)
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Cancel `token` once a shutdown signal arrives. If the handlers cannot be
/// installed the process can only be killed, which is logged but not fatal.
pub async fn cancel_on_signal(token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        result = shutdown_signal() => match result {
            Ok(name) => {
                info!(message = "shutdown signal received", signal = name);
                token.cancel();
            }
            Err(err) => {
                warn!(message = "install signal handler failed", %err);
            }
        }
    }
}
