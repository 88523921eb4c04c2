//! 订单积分结算服务
//!
//! 后台轮询未完成订单，向外部积分服务查询结算结果并回写订单账本。
//! 发现端与结算端通过有界队列解耦，对积分服务的调用由限速熔断执行器控制节奏。

pub mod accrual_client;
pub mod engine;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod models;
pub mod reconciler;
pub mod shutdown;
pub mod test_utils;

pub use accrual_client::{AccrualAdapter, AccrualService, HttpAccrualClient};
pub use engine::{AccrualEngine, EngineHandle};
pub use error::AccrualError;
pub use ledger::{OrderLedger, PgOrderLedger};
