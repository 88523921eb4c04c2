//! 测试工具模块
//!
//! 提供内存版订单账本，供单元测试与集成测试注入，不依赖数据库。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use loyalty_shared::error::LoyaltyError;
use parking_lot::Mutex;

use crate::ledger::OrderLedger;
use crate::models::{Order, OrderStatus};

#[derive(Default)]
struct LedgerState {
    orders: HashMap<String, Order>,
    fail_reads: bool,
    fail_writes: bool,
    reads: usize,
    writes: usize,
}

/// 内存订单账本
///
/// 读取顺序按上传时间排序，与 PostgreSQL 实现保持一致。
#[derive(Default)]
pub struct MemoryOrderLedger {
    state: Mutex<LedgerState>,
}

impl MemoryOrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入或覆盖一笔订单
    pub fn insert(&self, order: Order) {
        self.state.lock().orders.insert(order.number.clone(), order);
    }

    /// 按给定状态插入订单，上传时间按插入顺序递增
    pub fn insert_with_status(&self, number: &str, user_id: i64, status: OrderStatus) {
        let mut state = self.state.lock();
        let offset = state.orders.len() as i64;
        let mut order = Order::new(number, user_id);
        order.status = status;
        order.uploaded_at = Utc::now() + Duration::milliseconds(offset);
        state.orders.insert(order.number.clone(), order);
    }

    pub fn get(&self, number: &str) -> Option<Order> {
        self.state.lock().orders.get(number).cloned()
    }

    /// 让后续读取返回存储不可用
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// 让后续回写返回存储不可用
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// 已发生的读取次数
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    /// 成功回写的次数
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }
}

#[async_trait]
impl OrderLedger for MemoryOrderLedger {
    async fn fetch_unprocessed_orders(&self) -> Result<Vec<Order>, LoyaltyError> {
        let mut state = self.state.lock();
        state.reads += 1;
        if state.fail_reads {
            return Err(LoyaltyError::StoreUnavailable("内存账本读取已禁用".to_string()));
        }

        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.uploaded_at);
        Ok(orders)
    }

    async fn record_accrual(
        &self,
        order_number: &str,
        status: OrderStatus,
        accrual: Option<f64>,
    ) -> Result<(), LoyaltyError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(LoyaltyError::StoreUnavailable("内存账本写入已禁用".to_string()));
        }

        let order = state
            .orders
            .get_mut(order_number)
            .ok_or_else(|| LoyaltyError::NotFound {
                entity: "Order".to_string(),
                id: order_number.to_string(),
            })?;
        order.status = status;
        order.accrual = accrual;
        state.writes += 1;
        Ok(())
    }
}
