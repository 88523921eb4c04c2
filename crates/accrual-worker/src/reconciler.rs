//! 结算端
//!
//! 从交接队列逐笔取出订单，经限速熔断执行器调用积分适配器。
//! 冷却期内先等待冷却结束再发起调用；熔断期内直接跳过订单，
//! 订单仍是未完成状态，会在后续轮询中再次出现。

use std::ops::ControlFlow;
use std::sync::Arc;

use loyalty_shared::observability::metrics;
use loyalty_shared::throttle::{ThrottleError, ThrottledExecutor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accrual_client::AccrualAdapter;
use crate::models::Order;

pub struct Reconciler {
    adapter: Arc<AccrualAdapter>,
    executor: Arc<ThrottledExecutor>,
}

impl Reconciler {
    pub fn new(adapter: Arc<AccrualAdapter>, executor: Arc<ThrottledExecutor>) -> Self {
        Self { adapter, executor }
    }

    /// 主循环：队列关闭或收到停止信号时退出
    ///
    /// 已经发出的请求会执行完毕（受请求超时约束），队列中剩余订单直接放弃。
    pub async fn run(self, mut rx: mpsc::Receiver<Order>, cancel: CancellationToken) {
        info!(executor = self.executor.name(), "结算端已启动");

        loop {
            let order = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("结算端收到停止信号");
                    break;
                }
                next = rx.recv() => match next {
                    Some(order) => order,
                    None => {
                        info!("交接队列已关闭");
                        break;
                    }
                },
            };

            if self.wait_for_cooldown(&cancel).await.is_break() {
                info!(order = %order.number, "冷却等待期间收到停止信号");
                break;
            }

            self.settle(&order).await;
            metrics::set_worker_last_run("accrual_reconciler");
        }

        info!("结算端已退出");
    }

    async fn wait_for_cooldown(&self, cancel: &CancellationToken) -> ControlFlow<()> {
        let Some(remaining) = self.executor.cooldown_remaining() else {
            return ControlFlow::Continue(());
        };

        debug!(remaining_ms = remaining.as_millis() as u64, "等待冷却结束");
        tokio::select! {
            biased;
            () = cancel.cancelled() => ControlFlow::Break(()),
            () = tokio::time::sleep(remaining) => ControlFlow::Continue(()),
        }
    }

    async fn settle(&self, order: &Order) {
        let adapter = &self.adapter;

        match self.executor.run(|| adapter.reconcile(order)).await {
            Ok(decision) => {
                debug!(order = %order.number, outcome = decision.outcome(), "订单结算完成");
            }
            Err(ThrottleError::GuardRejected {
                state, retry_in, ..
            }) => {
                warn!(
                    order = %order.number,
                    state = %state,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "积分服务熔断中，跳过订单等待下一轮"
                );
            }
            Err(ThrottleError::Operation(e)) => {
                warn!(
                    order = %order.number,
                    code = e.code(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "订单结算失败，等待下一轮重试"
                );
            }
        }
    }
}
