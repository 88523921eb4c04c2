//! 优雅关闭信号

use tokio::signal;
use tracing::{error, info};

/// 等待 Ctrl+C 或 SIGTERM
///
/// 某个信号处理器安装失败时只记录错误，继续等待另一个信号，不会提前返回。
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "安装 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "安装 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
