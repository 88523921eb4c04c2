//! 订单发现端
//!
//! 按固定间隔从账本读取未完成订单，逐笔推入交接队列。
//! 第一次轮询发生在启动后一个间隔，而不是立即执行。
//! 收到停止信号后放弃当前批次剩余订单并关闭队列发送端，结算端据此退出。

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use loyalty_shared::observability::metrics;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ledger::OrderLedger;
use crate::models::Order;

pub struct OrderFeed {
    ledger: Arc<dyn OrderLedger>,
    interval: Duration,
}

impl OrderFeed {
    pub fn new(ledger: Arc<dyn OrderLedger>, interval: Duration) -> Self {
        Self { ledger, interval }
    }

    /// 主循环：直到取消或结算端关闭
    ///
    /// 消费 self，退出时 `tx` 随之释放，队列关闭。
    pub async fn run(self, tx: mpsc::Sender<Order>, cancel: CancellationToken) {
        info!(poll_interval = ?self.interval, "订单发现端已启动");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        // 结算端消费慢时不补发积压的 tick
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("订单发现端收到停止信号");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let flow = self.poll_once(&tx, &cancel).await;
            metrics::set_worker_last_run("order_feed");

            if flow.is_break() {
                break;
            }
        }

        info!("订单发现端已退出");
    }

    /// 执行一轮轮询
    async fn poll_once(
        &self,
        tx: &mpsc::Sender<Order>,
        cancel: &CancellationToken,
    ) -> ControlFlow<()> {
        let orders = tokio::select! {
            biased;
            () = cancel.cancelled() => return ControlFlow::Break(()),
            result = self.ledger.fetch_unprocessed_orders() => match result {
                Ok(orders) => orders,
                Err(e) => {
                    // 本轮跳过，下一个 tick 重试
                    error!(error = %e, "读取未完成订单失败");
                    metrics::record_feed_poll("error", 0);
                    return ControlFlow::Continue(());
                }
            },
        };

        let total = orders.len();
        let mut emitted = 0usize;

        for order in orders {
            if order.status.is_terminal() {
                continue;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(emitted, remaining = total - emitted, "停止信号到达，放弃本批剩余订单");
                    metrics::record_feed_poll("cancelled", emitted);
                    return ControlFlow::Break(());
                }
                sent = tx.send(order) => {
                    if sent.is_err() {
                        warn!("结算端已关闭，订单发现端停止");
                        metrics::record_feed_poll("closed", emitted);
                        return ControlFlow::Break(());
                    }
                    emitted += 1;
                }
            }
        }

        debug!(total, emitted, "本轮订单已推送");
        metrics::record_feed_poll("ok", emitted);
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MockOrderLedger;
    use crate::models::OrderStatus;
    use crate::test_utils::MemoryOrderLedger;
    use loyalty_shared::error::LoyaltyError;

    const INTERVAL: Duration = Duration::from_secs(10);

    fn spawn_feed(
        ledger: Arc<dyn OrderLedger>,
        capacity: usize,
    ) -> (
        mpsc::Receiver<Order>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(OrderFeed::new(ledger, INTERVAL).run(tx, cancel.clone()));
        (rx, cancel, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_waits_one_interval() {
        let ledger = Arc::new(MemoryOrderLedger::new());
        ledger.insert_with_status("A1", 1, OrderStatus::New);

        let (mut rx, cancel, handle) = spawn_feed(ledger.clone(), 10);

        let early = tokio::time::timeout(Duration::from_secs(9), rx.recv()).await;
        assert!(early.is_err(), "no order should be emitted before the first tick");
        assert_eq!(ledger.read_count(), 0);

        let order = rx.recv().await.unwrap();
        assert_eq!(order.number, "A1");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_only_non_terminal_orders_in_order() {
        let ledger = Arc::new(MemoryOrderLedger::new());
        ledger.insert_with_status("1", 1, OrderStatus::New);
        ledger.insert_with_status("2", 1, OrderStatus::Processed);
        ledger.insert_with_status("3", 1, OrderStatus::Processing);

        let (mut rx, cancel, handle) = spawn_feed(ledger, 10);

        assert_eq!(rx.recv().await.unwrap().number, "1");
        assert_eq!(rx.recv().await.unwrap().number, "3");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_error_skips_tick() {
        let mut ledger = MockOrderLedger::new();
        let mut calls = 0;
        ledger
            .expect_fetch_unprocessed_orders()
            .times(2..)
            .returning(move || {
                calls += 1;
                if calls == 1 {
                    Err(LoyaltyError::StoreUnavailable("连接失败".to_string()))
                } else {
                    Ok(vec![Order::new("B2", 1)])
                }
            });

        let (mut rx, cancel, handle) = spawn_feed(Arc::new(ledger), 10);

        let start = Instant::now();
        let order = rx.recv().await.unwrap();
        assert_eq!(order.number, "B2");
        // 第一轮失败，订单在第二个 tick 才出现
        assert!(start.elapsed() >= INTERVAL * 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_ledger_emits_nothing() {
        let ledger = Arc::new(MemoryOrderLedger::new());
        let (mut rx, cancel, handle) = spawn_feed(ledger.clone(), 10);

        let waited = tokio::time::timeout(INTERVAL * 3 + Duration::from_secs(1), rx.recv()).await;
        assert!(waited.is_err());
        assert_eq!(ledger.read_count(), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_closes_queue_and_abandons_batch() {
        let ledger = Arc::new(MemoryOrderLedger::new());
        for n in 0..5 {
            ledger.insert_with_status(&format!("{n}"), 1, OrderStatus::New);
        }

        // 容量为 1，发现端会阻塞在第二笔订单上
        let (mut rx, cancel, handle) = spawn_feed(ledger, 1);

        assert_eq!(rx.recv().await.unwrap().number, "0");
        tokio::time::sleep(Duration::from_millis(10)).await;

        cancel.cancel();
        handle.await.unwrap();

        let mut drained = 0;
        while rx.recv().await.is_some() {
            drained += 1;
        }
        assert!(drained <= 1, "remaining batch must be abandoned");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_consumer_is_gone() {
        let ledger = Arc::new(MemoryOrderLedger::new());
        ledger.insert_with_status("A1", 1, OrderStatus::New);

        let (rx, _cancel, handle) = spawn_feed(ledger, 10);
        drop(rx);

        tokio::time::timeout(INTERVAL * 2, handle)
            .await
            .expect("feed should stop once the queue is closed")
            .unwrap();
    }
}
