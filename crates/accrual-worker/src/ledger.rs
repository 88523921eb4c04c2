//! 订单账本端口
//!
//! 结算引擎只需要账本的两项能力：读取未完成订单、回写结算结果。
//! 通过 OrderLedger trait 抽象存储层，测试时可注入内存实现或 mock。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loyalty_shared::error::LoyaltyError;
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use tracing::{debug, instrument};

use crate::models::{Order, OrderStatus};

/// 订单表迁移，编译期嵌入
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// 账本端口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderLedger: Send + Sync {
    /// 读取所有非终态（NEW / PROCESSING）订单
    async fn fetch_unprocessed_orders(&self) -> Result<Vec<Order>, LoyaltyError>;

    /// 回写一笔订单的结算状态与积分
    async fn record_accrual(
        &self,
        order_number: &str,
        status: OrderStatus,
        accrual: Option<f64>,
    ) -> Result<(), LoyaltyError>;
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    number: String,
    user_id: i64,
    accrual: Option<f64>,
    status: String,
    uploaded_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = LoyaltyError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<OrderStatus>()
            .map_err(LoyaltyError::Internal)?;
        Ok(Order {
            number: row.number,
            user_id: row.user_id,
            accrual: row.accrual,
            status,
            uploaded_at: row.uploaded_at,
        })
    }
}

/// PostgreSQL 账本实现
#[derive(Clone)]
pub struct PgOrderLedger {
    pool: PgPool,
}

impl PgOrderLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderLedger for PgOrderLedger {
    #[instrument(skip(self))]
    async fn fetch_unprocessed_orders(&self) -> Result<Vec<Order>, LoyaltyError> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT number, user_id, accrual, status, uploaded_at
            FROM orders
            WHERE status IN ('NEW', 'PROCESSING')
            ORDER BY uploaded_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LoyaltyError::StoreUnavailable(format!("查询未完成订单失败: {e}")))?;

        debug!(count = rows.len(), "读取未完成订单");

        rows.into_iter().map(Order::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn record_accrual(
        &self,
        order_number: &str,
        status: OrderStatus,
        accrual: Option<f64>,
    ) -> Result<(), LoyaltyError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, accrual = $3
            WHERE number = $1
            "#,
        )
        .bind(order_number)
        .bind(status.as_str())
        .bind(accrual)
        .execute(&self.pool)
        .await
        .map_err(|e| LoyaltyError::StoreUnavailable(format!("回写订单积分失败: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(LoyaltyError::NotFound {
                entity: "Order".to_string(),
                id: order_number.to_string(),
            });
        }

        Ok(())
    }
}
