//! 积分结算服务专用错误类型
//!
//! 在共享库 LoyaltyError 基础上定义本服务特有的错误变体：
//! 瞬时网络故障与上游响应异常需要区分，前者等待下一轮自然重试，
//! 后者需要保留现场方便排查。

use loyalty_shared::error::LoyaltyError;

/// 积分结算错误
#[derive(Debug, thiserror::Error)]
pub enum AccrualError {
    /// 网络、超时或读取响应体失败，订单保持未完成状态，下一轮轮询重试
    #[error("积分服务请求失败: {0}")]
    TransientIo(String),

    /// 响应体无法解析、订单号不匹配、Retry-After 非法等
    #[error("积分服务响应异常: {0}")]
    MalformedUpstreamResponse(String),

    /// 透传共享库错误（账本读写失败），避免在每个 match 分支手动转换
    #[error(transparent)]
    Ledger(#[from] LoyaltyError),
}

impl AccrualError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientIo(_) => "TRANSIENT_IO",
            Self::MalformedUpstreamResponse(_) => "MALFORMED_UPSTREAM_RESPONSE",
            Self::Ledger(e) => e.code(),
        }
    }

    /// 是否为瞬时故障；上游响应异常通常需要人工排查，重试意义不大
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientIo(_) => true,
            Self::MalformedUpstreamResponse(_) => false,
            Self::Ledger(e) => e.is_retryable(),
        }
    }
}

impl From<reqwest::Error> for AccrualError {
    fn from(err: reqwest::Error) -> Self {
        Self::TransientIo(err.to_string())
    }
}
