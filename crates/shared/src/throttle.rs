//! 限速熔断执行器 (Throttled Executor)
//!
//! 把"调用节奏控制"和"熔断"合并为一个状态机，保护对外部服务的调用：
//! 每次受保护调用结束后都会返回一个冷却时间（成功、未就绪、被限流、失败一视同仁），
//! 冷却期内的调用被立即拒绝；连续失败达到阈值后进入熔断（Open），
//! 熔断期满后放行一次探测调用（Half-Open），探测成功即恢复。
//!
//! ## 设计决策
//!
//! - 调用互斥：同一时刻只有一个受保护调用在执行，外部服务只有一份共享的速率额度
//! - 状态读写使用 parking_lot::Mutex，调用串行化使用 tokio::sync::Mutex（需要跨 await 持有）
//! - 时间基于 `tokio::time::Instant`，测试中可以暂停和推进时钟
//! - 内置 Prometheus 指标上报

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 执行器对外可见的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleState {
    /// 可以立即发起调用
    Available,
    /// 处于冷却期，调用被拒绝
    CoolingDown,
    /// 熔断中，调用被拒绝
    Open,
    /// 熔断期满，下一次调用作为探测放行
    HalfOpen,
}

impl std::fmt::Display for ThrottleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::CoolingDown => write!(f, "cooling_down"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// 连续失败多少次后熔断（默认 3）
    pub failure_threshold: u32,
    /// 熔断持续时间（默认 30 秒）
    pub open_duration: Duration,
    /// 执行器名称，用于日志和指标区分不同的外部依赖
    pub name: String,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(30),
            name: "default".to_string(),
        }
    }
}

impl ThrottleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }
}

/// 受保护调用的返回值：结果 + 本次调用之后需要遵守的冷却时间
#[derive(Debug)]
pub struct Paced<T, E> {
    pub cooldown: Duration,
    pub result: Result<T, E>,
}

impl<T, E> Paced<T, E> {
    pub fn ok(value: T, cooldown: Duration) -> Self {
        Self {
            cooldown,
            result: Ok(value),
        }
    }

    pub fn err(error: E, cooldown: Duration) -> Self {
        Self {
            cooldown,
            result: Err(error),
        }
    }
}

/// 单次冷却或熔断的上限，超出的值按上限处理
pub const MAX_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// 把带符号的秒数转换为冷却时间，负数按 0 处理，超过 `MAX_COOLDOWN` 按上限处理
pub fn cooldown_from_secs(secs: i64) -> Duration {
    if secs <= 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(secs as u64).min(MAX_COOLDOWN)
    }
}

/// 计算截止时刻，时长先截断到 `MAX_COOLDOWN`，避免 Instant 溢出
fn deadline(now: Instant, duration: Duration) -> Instant {
    let duration = duration.min(MAX_COOLDOWN);
    now.checked_add(duration).unwrap_or(now)
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Available,
    CoolingDown { until: Instant },
    Open { until: Instant },
    HalfOpen,
}

struct InnerState {
    mode: Mode,
    consecutive_failures: u32,
}

/// 限速熔断执行器
///
/// 线程安全，通过 Arc 在多个调用方之间共享。
/// 典型用法：
/// ```ignore
/// let executor = ThrottledExecutor::new(ThrottleConfig::new("accrual"));
/// let outcome = executor
///     .run(|| async { Paced::ok(42, Duration::from_secs(2)) })
///     .await;
/// ```
pub struct ThrottledExecutor {
    config: ThrottleConfig,
    /// 串行化受保护调用，跨 await 持有
    call_lock: tokio::sync::Mutex<()>,
    inner: Mutex<InnerState>,
}

impl ThrottledExecutor {
    pub fn new(config: ThrottleConfig) -> Self {
        info!(
            name = %config.name,
            failure_threshold = config.failure_threshold,
            open_duration_ms = config.open_duration.as_millis() as u64,
            "限速熔断执行器已创建"
        );

        Self {
            config,
            call_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(InnerState {
                mode: Mode::Available,
                consecutive_failures: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// 获取当前状态（用于监控和日志）
    pub fn state(&self) -> ThrottleState {
        let inner = self.inner.lock();
        let now = Instant::now();
        match inner.mode {
            Mode::Available => ThrottleState::Available,
            Mode::CoolingDown { until } if now >= until => ThrottleState::Available,
            Mode::CoolingDown { .. } => ThrottleState::CoolingDown,
            Mode::Open { until } if now >= until => ThrottleState::HalfOpen,
            Mode::Open { .. } => ThrottleState::Open,
            Mode::HalfOpen => ThrottleState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// 冷却期剩余时间；不在冷却期（包括熔断中）返回 None
    ///
    /// 调用方可以据此先等待冷却结束再发起调用，熔断则应直接快速失败。
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match inner.mode {
            Mode::CoolingDown { until } => {
                let now = Instant::now();
                (until > now).then(|| until - now)
            }
            _ => None,
        }
    }

    /// 执行受保护的异步调用
    ///
    /// 冷却或熔断期间直接返回 `GuardRejected`，不会调用 `op`。
    /// 否则执行 `op`，按其返回的冷却时间进入冷却期；返回错误时累加连续失败计数，
    /// 达到阈值后熔断。
    pub async fn run<F, Fut, T, E>(&self, op: F) -> Result<T, ThrottleError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Paced<T, E>>,
    {
        let _serial = self.call_lock.lock().await;

        if let Err((state, retry_in)) = self.acquire() {
            record_throttle_rejection(&self.config.name, state);
            debug!(
                name = %self.config.name,
                state = %state,
                retry_in_ms = retry_in.as_millis() as u64,
                "调用被限速熔断执行器拒绝"
            );
            return Err(ThrottleError::GuardRejected {
                name: self.config.name.clone(),
                state,
                retry_in,
            });
        }

        let Paced { cooldown, result } = op().await;
        self.settle(cooldown, result.is_ok());

        result.map_err(ThrottleError::Operation)
    }

    /// 判断能否放行本次调用，必要时推进状态
    fn acquire(&self) -> Result<(), (ThrottleState, Duration)> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.mode {
            Mode::Available => Ok(()),
            Mode::CoolingDown { until } => {
                if now >= until {
                    inner.mode = Mode::Available;
                    Ok(())
                } else {
                    Err((ThrottleState::CoolingDown, until - now))
                }
            }
            Mode::Open { until } => {
                if now >= until {
                    self.transition_to(&mut inner, Mode::HalfOpen);
                    Ok(())
                } else {
                    Err((ThrottleState::Open, until - now))
                }
            }
            // 上一次探测在完成前被取消，call_lock 保证此刻没有其他探测在途
            Mode::HalfOpen => Ok(()),
        }
    }

    /// 根据调用结果更新状态
    fn settle(&self, cooldown: Duration, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let probing = matches!(inner.mode, Mode::HalfOpen);

        if success {
            inner.consecutive_failures = 0;
            let next = cooling_mode(now, cooldown);
            if probing {
                self.transition_to(&mut inner, next);
            } else {
                inner.mode = next;
            }
            debug!(
                name = %self.config.name,
                cooldown_ms = cooldown.as_millis() as u64,
                "受保护调用成功，进入冷却"
            );
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if probing || inner.consecutive_failures >= self.config.failure_threshold {
            let until = deadline(now, self.config.open_duration.max(cooldown));
            self.transition_to(&mut inner, Mode::Open { until });
        } else {
            inner.mode = cooling_mode(now, cooldown);
            debug!(
                name = %self.config.name,
                consecutive_failures = inner.consecutive_failures,
                cooldown_ms = cooldown.as_millis() as u64,
                "受保护调用失败，进入冷却"
            );
        }
    }

    /// 熔断相关的状态转换（在锁内调用）
    fn transition_to(&self, inner: &mut InnerState, new_mode: Mode) {
        let old_state = state_of(inner.mode);
        inner.mode = new_mode;
        let new_state = state_of(new_mode);

        record_throttle_transition(&self.config.name, old_state, new_state);

        match new_mode {
            Mode::Open { .. } => {
                warn!(
                    name = %self.config.name,
                    from = %old_state,
                    consecutive_failures = inner.consecutive_failures,
                    open_duration_ms = self.config.open_duration.as_millis() as u64,
                    "熔断器跳闸：后续调用将被拒绝直到熔断期结束"
                );
            }
            Mode::HalfOpen => {
                info!(name = %self.config.name, "熔断期结束：放行一次探测调用");
            }
            Mode::Available | Mode::CoolingDown { .. } => {
                info!(name = %self.config.name, "探测调用成功：外部服务已恢复");
            }
        }
    }
}

fn cooling_mode(now: Instant, cooldown: Duration) -> Mode {
    if cooldown.is_zero() {
        Mode::Available
    } else {
        Mode::CoolingDown {
            until: deadline(now, cooldown),
        }
    }
}

fn state_of(mode: Mode) -> ThrottleState {
    match mode {
        Mode::Available => ThrottleState::Available,
        Mode::CoolingDown { .. } => ThrottleState::CoolingDown,
        Mode::Open { .. } => ThrottleState::Open,
        Mode::HalfOpen => ThrottleState::HalfOpen,
    }
}

/// 执行器错误
#[derive(Debug)]
pub enum ThrottleError<E> {
    /// 冷却或熔断期间调用被拒绝，受保护操作没有执行
    GuardRejected {
        name: String,
        state: ThrottleState,
        retry_in: Duration,
    },
    /// 受保护操作本身失败
    Operation(E),
}

impl<E> ThrottleError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::GuardRejected { .. })
    }
}

impl<E: std::fmt::Display> std::fmt::Display for ThrottleError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GuardRejected {
                name,
                state,
                retry_in,
            } => write!(
                f,
                "执行器 '{}' 处于 {} 状态，调用被拒绝（{}ms 后可重试）",
                name,
                state,
                retry_in.as_millis()
            ),
            Self::Operation(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::fmt::Display + std::fmt::Debug> std::error::Error for ThrottleError<E> {}

// ─── Prometheus 指标 ─────────────────────────────────────────────────

fn record_throttle_transition(name: &str, from: ThrottleState, to: ThrottleState) {
    metrics::counter!(
        "throttle_transitions_total",
        "name" => name.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);

    let state_value = match to {
        ThrottleState::Available | ThrottleState::CoolingDown => 0.0,
        ThrottleState::HalfOpen => 1.0,
        ThrottleState::Open => 2.0,
    };
    metrics::gauge!("throttle_breaker_state", "name" => name.to_string()).set(state_value);
}

fn record_throttle_rejection(name: &str, state: ThrottleState) {
    metrics::counter!(
        "throttle_rejections_total",
        "name" => name.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}
