//! 订单与积分结算决策模型

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 订单状态
///
/// 状态机：NEW → PROCESSING → {PROCESSED, INVALID}，后两者为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Processing,
    Processed,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Processing => "PROCESSING",
            Self::Processed => "PROCESSED",
            Self::Invalid => "INVALID",
        }
    }

    /// 终态订单不再参与轮询
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Invalid)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "PROCESSING" => Ok(Self::Processing),
            "PROCESSED" => Ok(Self::Processed),
            "INVALID" => Ok(Self::Invalid),
            other => Err(format!("未知的订单状态: {other}")),
        }
    }
}

/// 用户提交的待结算订单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// 订单号（数字串，由上传链路做校验）
    pub number: String,
    pub user_id: i64,
    /// 仅在 PROCESSED 状态下有值
    pub accrual: Option<f64>,
    pub status: OrderStatus,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// 新上传的订单，状态为 NEW
    pub fn new(number: impl Into<String>, user_id: i64) -> Self {
        Self {
            number: number.into(),
            user_id,
            accrual: None,
            status: OrderStatus::New,
            uploaded_at: Utc::now(),
        }
    }
}

/// 积分服务返回的订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    /// 订单已登记，尚未开始计算
    Registered,
    Invalid,
    Processing,
    Processed,
}

impl AccrualStatus {
    /// 映射为本地订单状态；REGISTERED 在本地视为处理中
    pub fn to_order_status(self) -> OrderStatus {
        match self {
            Self::Registered | Self::Processing => OrderStatus::Processing,
            Self::Invalid => OrderStatus::Invalid,
            Self::Processed => OrderStatus::Processed,
        }
    }
}

/// 积分服务 200 响应体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccrualResponse {
    pub order: String,
    pub status: AccrualStatus,
    #[serde(default)]
    pub accrual: Option<f64>,
}

/// 一次查询的分类结果，只在结算端内部流转，不持久化
#[derive(Debug, Clone, PartialEq)]
pub enum AccrualDecision {
    /// 积分服务给出了状态（及金额），需要回写账本
    Decided {
        status: OrderStatus,
        accrual: Option<f64>,
    },
    /// 积分服务尚未登记该订单
    Unknown,
    /// 被限流，需要等待 retry_after
    Throttled { retry_after: Duration },
    /// 无法识别的响应码，记录后忽略
    Unrecognized { status_code: u16 },
}

impl AccrualDecision {
    /// 指标与日志中使用的结果标签
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Decided { .. } => "decided",
            Self::Unknown => "unknown",
            Self::Throttled { .. } => "throttled",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }
}
