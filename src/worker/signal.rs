use std::io;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::messaging::ShutdownSignal;

/// 等待終止信號，返回信號名稱
#[cfg(unix)]
pub async fn wait_for_termination() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = terminate.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

/// 等待終止信號，返回信號名稱
#[cfg(not(unix))]
pub async fn wait_for_termination() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// 在背景監聽終止信號並觸發停止信號
///
/// 停止信號由其他途徑觸發時任務自行結束。
pub fn spawn_listener(shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            received = wait_for_termination() => match received {
                Ok(name) => {
                    info!(signal = name, "Received termination signal, shutting down");
                    shutdown.trigger();
                }
                Err(e) => error!(error = %e, "Failed to install signal handlers"),
            },
            _ = shutdown.triggered() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_listener_exits_when_shutdown_triggered_elsewhere() {
        let shutdown = ShutdownSignal::new();
        let listener = spawn_listener(shutdown.clone());

        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
    }
}
