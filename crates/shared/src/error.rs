//! 统一错误处理模块
//!
//! 定义各服务共享的基础设施错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum LoyaltyError {
    // ==================== 存储错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    /// 存储层无法应答（连接池耗尽、网络中断等），调用方应跳过本轮而非终止
    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    // ==================== 配置错误 ====================
    /// 配置非法属于启动期致命错误，不应出现在稳态运行中
    #[error("配置错误: {0}")]
    Config(String),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, LoyaltyError>;

impl LoyaltyError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为瞬时故障（下一轮轮询会自然重试）
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::StoreUnavailable(_))
    }
}

impl From<config::ConfigError> for LoyaltyError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
