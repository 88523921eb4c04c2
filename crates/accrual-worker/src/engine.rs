//! 积分结算引擎
//!
//! 组装发现端与结算端，两者通过有界队列交接订单，共享同一个停止信号。
//! 关闭时先取消，再等待两个任务都退出；等待返回后不会再有任何账本回写。

use std::future::Future;
use std::sync::Arc;

use loyalty_shared::config::AccrualConfig;
use loyalty_shared::throttle::{ThrottleConfig, ThrottledExecutor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::accrual_client::{AccrualAdapter, AccrualService};
use crate::feed::OrderFeed;
use crate::ledger::OrderLedger;
use crate::reconciler::Reconciler;

pub struct AccrualEngine {
    config: AccrualConfig,
    ledger: Arc<dyn OrderLedger>,
    service: Arc<dyn AccrualService>,
}

impl AccrualEngine {
    pub fn new(
        config: AccrualConfig,
        ledger: Arc<dyn OrderLedger>,
        service: Arc<dyn AccrualService>,
    ) -> Self {
        Self {
            config,
            ledger,
            service,
        }
    }

    /// 启动后台任务；引擎被禁用时不启动任何任务
    pub fn start(self, cancel: CancellationToken) -> EngineHandle {
        if !self.config.enabled {
            info!("积分结算引擎已禁用，不启动后台任务");
            return EngineHandle {
                feed: None,
                reconciler: None,
                cancel,
            };
        }

        let executor = Arc::new(ThrottledExecutor::new(
            ThrottleConfig::new("accrual")
                .with_failure_threshold(self.config.failure_threshold)
                .with_open_duration(self.config.open_duration()),
        ));
        let adapter = Arc::new(AccrualAdapter::new(
            self.service,
            self.ledger.clone(),
            &self.config,
        ));

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);

        let feed = OrderFeed::new(self.ledger, self.config.poll_interval());
        let reconciler = Reconciler::new(adapter, executor);

        let feed = tokio::spawn(feed.run(tx, cancel.clone()));
        let reconciler = tokio::spawn(reconciler.run(rx, cancel.clone()));

        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            queue_capacity = self.config.queue_capacity,
            base_url = %self.config.normalized_base_url(),
            "积分结算引擎已启动"
        );

        EngineHandle {
            feed: Some(feed),
            reconciler: Some(reconciler),
            cancel,
        }
    }
}

/// 运行中的引擎句柄
pub struct EngineHandle {
    feed: Option<JoinHandle<()>>,
    reconciler: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl EngineHandle {
    /// 引擎是否启动了后台任务
    pub fn is_running(&self) -> bool {
        self.feed.is_some() || self.reconciler.is_some()
    }

    /// 等待两个任务退出，不主动发出停止信号
    pub async fn join(self) {
        for (name, handle) in [("order_feed", self.feed), ("reconciler", self.reconciler)] {
            let Some(handle) = handle else { continue };
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "积分结算任务异常退出");
            }
        }
        info!("积分结算引擎已停止");
    }

    /// 发出停止信号并等待退出
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// 等待外部关闭信号，随后停止并等待退出
    ///
    /// 信号先于引擎自行结束时照常取消，引擎被外部取消时不再等待信号。
    pub async fn shutdown_on<F>(self, signal: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            () = signal => {}
            () = self.cancel.cancelled() => {
                info!("积分结算引擎已被取消");
            }
        }
        self.shutdown().await;
    }
}
