use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 优雅关闭管理器
///
/// 所有后台循环共享同一个取消令牌的子令牌，关闭时统一取消，
/// 然后在期限内等待各组件的句柄退出。
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    grace_period: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::with_grace_period(Duration::from_secs(30))
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace_period,
        }
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// 触发关闭，重复调用无副作用
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        info!("触发系统关闭");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 在期限内等待句柄结束，超时返回 false
    pub async fn join<T>(&self, handle: JoinHandle<T>) -> bool {
        match timeout(self.grace_period, handle).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                error!("应用关闭时发生错误: {e}");
                true
            }
            Err(_) => {
                warn!("应用关闭超时 ({:?})，强制退出", self.grace_period);
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
