//! 积分服务客户端与响应分类
//!
//! 分三层：
//! - `AccrualService`：一次 HTTP 往返，只负责取回状态码、Retry-After 和响应体
//! - `classify_reply`：把原始响应归类为 `AccrualDecision`，纯函数，便于测试
//! - `AccrualAdapter`：组合上面两者与账本，完成回写并给出本次调用之后的冷却时间
//!
//! 每种结果都会产生冷却时间（成功、未登记、被限流、失败），
//! 由限速熔断执行器统一控制调用节奏。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use loyalty_shared::config::AccrualConfig;
use loyalty_shared::observability::metrics;
use loyalty_shared::throttle::{Paced, cooldown_from_secs};
use tracing::{debug, info, warn};

use crate::error::AccrualError;
use crate::ledger::OrderLedger;
use crate::models::{AccrualDecision, AccrualResponse, AccrualStatus, Order};

/// 一次 HTTP 往返的原始结果
#[derive(Debug, Clone, PartialEq)]
pub struct AccrualReply {
    pub status_code: u16,
    pub retry_after: Option<String>,
    pub body: String,
}

/// 积分服务调用的抽象接口，测试时可替换为桩实现
#[async_trait]
pub trait AccrualService: Send + Sync {
    /// 按订单号查询积分服务
    async fn fetch(&self, order_number: &str) -> Result<AccrualReply, AccrualError>;
}

/// 基于 reqwest 的积分服务客户端
///
/// reqwest::Client 内部带连接池，clone 是廉价操作。
#[derive(Clone)]
pub struct HttpAccrualClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccrualClient {
    pub fn new(config: &AccrualConfig) -> Result<Self, AccrualError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AccrualError::TransientIo(format!("创建 HTTP 客户端失败: {e}")))?;

        let base_url = config.normalized_base_url();
        info!(base_url = %base_url, "积分服务客户端已初始化");

        Ok(Self { client, base_url })
    }

    fn order_url(&self, order_number: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, order_number)
    }
}

#[async_trait]
impl AccrualService for HttpAccrualClient {
    async fn fetch(&self, order_number: &str) -> Result<AccrualReply, AccrualError> {
        let url = self.order_url(order_number);
        debug!(order = order_number, url = %url, "查询积分服务");

        let response = self.client.get(&url).send().await?;

        let status_code = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string());
        let body = response.text().await?;

        Ok(AccrualReply {
            status_code,
            retry_after,
            body,
        })
    }
}

/// 把原始响应归类为结算决策
///
/// 200 响应体无法解析或订单号不一致、429 缺少合法的 Retry-After 时返回错误。
pub fn classify_reply(
    order_number: &str,
    reply: &AccrualReply,
) -> Result<AccrualDecision, AccrualError> {
    match reply.status_code {
        200 => {
            let response: AccrualResponse = serde_json::from_str(&reply.body).map_err(|e| {
                AccrualError::MalformedUpstreamResponse(format!("响应体解析失败: {e}"))
            })?;

            if response.order != order_number {
                return Err(AccrualError::MalformedUpstreamResponse(format!(
                    "响应订单号不一致: 请求 {}, 返回 {}",
                    order_number, response.order
                )));
            }

            let status = response.status.to_order_status();
            // 积分只在 PROCESSED 时落库，上游缺省金额按 0 处理
            let accrual = match response.status {
                AccrualStatus::Processed => {
                    let amount = response.accrual.unwrap_or(0.0);
                    if !amount.is_finite() || amount < 0.0 {
                        return Err(AccrualError::MalformedUpstreamResponse(format!(
                            "非法的积分金额: {amount}"
                        )));
                    }
                    Some(amount)
                }
                _ => None,
            };

            Ok(AccrualDecision::Decided { status, accrual })
        }
        204 => Ok(AccrualDecision::Unknown),
        429 => {
            let retry_after = parse_retry_after(reply.retry_after.as_deref())?;
            Ok(AccrualDecision::Throttled { retry_after })
        }
        _ => Ok(AccrualDecision::Unrecognized {
            status_code: reply.status_code,
        }),
    }
}

/// 解析 Retry-After（整秒），缺失、非数字、零或负数都视为上游信号异常
///
/// 超过 `MAX_COOLDOWN` 的值按上限处理。
pub fn parse_retry_after(value: Option<&str>) -> Result<Duration, AccrualError> {
    let raw = value.ok_or_else(|| {
        AccrualError::MalformedUpstreamResponse("限流响应缺少 Retry-After".to_string())
    })?;

    let secs: i64 = raw.trim().parse().map_err(|_| {
        AccrualError::MalformedUpstreamResponse(format!("Retry-After 不是整数秒: {raw}"))
    })?;

    if secs <= 0 {
        return Err(AccrualError::MalformedUpstreamResponse(format!(
            "Retry-After 必须为正数: {secs}"
        )));
    }

    let cooldown = cooldown_from_secs(secs);
    if cooldown.as_secs() < secs as u64 {
        warn!(retry_after = secs, capped_secs = cooldown.as_secs(), "Retry-After 过大，按上限处理");
    }
    Ok(cooldown)
}

/// 积分协议适配器
///
/// 一笔订单一次往返：查询 → 分类 → 回写 → 给出冷却时间。
/// 使用 trait object 而非泛型参数，避免泛型传播到结算端和引擎。
pub struct AccrualAdapter {
    service: Arc<dyn AccrualService>,
    ledger: Arc<dyn OrderLedger>,
    error_cooldown: Duration,
    success_cooldown: Duration,
}

impl AccrualAdapter {
    pub fn new(
        service: Arc<dyn AccrualService>,
        ledger: Arc<dyn OrderLedger>,
        config: &AccrualConfig,
    ) -> Self {
        Self {
            service,
            ledger,
            error_cooldown: config.error_cooldown(),
            success_cooldown: config.success_cooldown(),
        }
    }

    /// 对单笔订单完成一次结算尝试
    pub async fn reconcile(&self, order: &Order) -> Paced<AccrualDecision, AccrualError> {
        let start = Instant::now();

        let reply = match self.service.fetch(&order.number).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(order = %order.number, error = %e, "积分服务请求失败");
                metrics::record_accrual_request("transport_error", start.elapsed().as_secs_f64());
                return Paced::err(e, self.error_cooldown);
            }
        };

        let decision = match classify_reply(&order.number, &reply) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    order = %order.number,
                    status = reply.status_code,
                    retry_after = ?reply.retry_after,
                    body = %reply.body,
                    error = %e,
                    "积分服务响应异常"
                );
                metrics::record_accrual_request("malformed", start.elapsed().as_secs_f64());
                return Paced::err(e, self.error_cooldown);
            }
        };

        metrics::record_accrual_request(decision.outcome(), start.elapsed().as_secs_f64());

        match &decision {
            AccrualDecision::Decided { status, accrual } => {
                if let Err(e) = self
                    .ledger
                    .record_accrual(&order.number, *status, *accrual)
                    .await
                {
                    warn!(order = %order.number, error = %e, "回写订单积分失败");
                    return Paced::err(e.into(), self.error_cooldown);
                }

                info!(
                    order = %order.number,
                    user_id = order.user_id,
                    status = %status,
                    accrual = ?accrual,
                    "订单积分已回写"
                );
                Paced::ok(decision, self.success_cooldown)
            }
            AccrualDecision::Unknown => {
                debug!(order = %order.number, "积分服务尚未登记该订单");
                Paced::ok(decision, Duration::ZERO)
            }
            AccrualDecision::Throttled { retry_after } => {
                let cooldown = *retry_after;
                warn!(
                    order = %order.number,
                    retry_after_secs = cooldown.as_secs(),
                    "积分服务限流"
                );
                Paced::ok(decision, cooldown)
            }
            AccrualDecision::Unrecognized { status_code } => {
                warn!(
                    status = status_code,
                    order = %order.number,
                    body = %reply.body,
                    "积分服务返回无法识别的响应"
                );
                Paced::ok(decision, Duration::ZERO)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MockOrderLedger;
    use crate::models::OrderStatus;
    use loyalty_shared::error::LoyaltyError;
    use loyalty_shared::throttle::MAX_COOLDOWN;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reply(status_code: u16, retry_after: Option<&str>, body: &str) -> AccrualReply {
        AccrualReply {
            status_code,
            retry_after: retry_after.map(str::to_string),
            body: body.to_string(),
        }
    }

    /// 桩实现：固定返回同一个结果
    struct StubAccrualService {
        reply: Result<AccrualReply, String>,
    }

    impl StubAccrualService {
        fn replying(reply: AccrualReply) -> Self {
            Self { reply: Ok(reply) }
        }

        fn failing(message: &str) -> Self {
            Self {
                reply: Err(message.to_string()),
            }
        }
    }

    #[async_trait]
    impl AccrualService for StubAccrualService {
        async fn fetch(&self, _order_number: &str) -> Result<AccrualReply, AccrualError> {
            self.reply.clone().map_err(AccrualError::TransientIo)
        }
    }

    fn make_adapter(service: StubAccrualService, ledger: MockOrderLedger) -> AccrualAdapter {
        AccrualAdapter::new(Arc::new(service), Arc::new(ledger), &AccrualConfig::default())
    }

    // ─── classify_reply ─────────────────────────────────────────────

    #[test]
    fn test_classify_processed() {
        let decision = classify_reply(
            "A1",
            &reply(200, None, r#"{"order":"A1","status":"PROCESSED","accrual":500}"#),
        )
        .unwrap();
        assert_eq!(
            decision,
            AccrualDecision::Decided {
                status: OrderStatus::Processed,
                accrual: Some(500.0),
            }
        );
    }

    #[test]
    fn test_classify_non_terminal_drops_amount() {
        let decision = classify_reply(
            "A1",
            &reply(200, None, r#"{"order":"A1","status":"REGISTERED","accrual":10}"#),
        )
        .unwrap();
        assert_eq!(
            decision,
            AccrualDecision::Decided {
                status: OrderStatus::Processing,
                accrual: None,
            }
        );
    }

    #[test]
    fn test_classify_processed_without_amount_defaults_to_zero() {
        let decision =
            classify_reply("A1", &reply(200, None, r#"{"order":"A1","status":"PROCESSED"}"#))
                .unwrap();
        assert_eq!(
            decision,
            AccrualDecision::Decided {
                status: OrderStatus::Processed,
                accrual: Some(0.0),
            }
        );
    }

    #[test]
    fn test_classify_bad_body_is_malformed() {
        let err = classify_reply("A1", &reply(200, None, "not json")).unwrap_err();
        assert!(matches!(err, AccrualError::MalformedUpstreamResponse(_)));

        let err = classify_reply(
            "A1",
            &reply(200, None, r#"{"order":"Z9","status":"INVALID"}"#),
        )
        .unwrap_err();
        assert!(err.to_string().contains("订单号不一致"));
    }

    #[test]
    fn test_classify_no_content_and_unrecognized() {
        assert_eq!(
            classify_reply("B2", &reply(204, None, "")).unwrap(),
            AccrualDecision::Unknown
        );
        assert_eq!(
            classify_reply("B2", &reply(500, None, "internal error")).unwrap(),
            AccrualDecision::Unrecognized { status_code: 500 }
        );
    }

    #[test]
    fn test_classify_throttled() {
        assert_eq!(
            classify_reply("C3", &reply(429, Some("5"), "")).unwrap(),
            AccrualDecision::Throttled {
                retry_after: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_invalid_retry_after_is_malformed() {
        for value in [None, Some("0"), Some("-3"), Some("soon")] {
            let err = classify_reply("C3", &reply(429, value, "")).unwrap_err();
            assert!(
                matches!(err, AccrualError::MalformedUpstreamResponse(_)),
                "Retry-After {value:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_huge_retry_after_is_capped() {
        assert_eq!(
            parse_retry_after(Some("9223372036854775807")).unwrap(),
            MAX_COOLDOWN
        );
        assert_eq!(
            classify_reply("C3", &reply(429, Some("86400"), "")).unwrap(),
            AccrualDecision::Throttled {
                retry_after: MAX_COOLDOWN
            }
        );
        // 超出 i64 范围的数字无法解析
        assert!(parse_retry_after(Some("99999999999999999999")).is_err());
    }

    // ─── AccrualAdapter ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_decided_writes_back_with_success_cooldown() {
        let mut ledger = MockOrderLedger::new();
        ledger
            .expect_record_accrual()
            .withf(|number, status, accrual| {
                number.to_string() == "A1"
                    && *status == OrderStatus::Processed
                    && *accrual == Some(500.0)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let adapter = make_adapter(
            StubAccrualService::replying(reply(
                200,
                None,
                r#"{"order":"A1","status":"PROCESSED","accrual":500}"#,
            )),
            ledger,
        );

        let paced = adapter.reconcile(&Order::new("A1", 1)).await;
        assert_eq!(paced.cooldown, Duration::from_secs(2));
        assert!(matches!(
            paced.result,
            Ok(AccrualDecision::Decided {
                status: OrderStatus::Processed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_unknown_does_not_write_back() {
        let mut ledger = MockOrderLedger::new();
        ledger.expect_record_accrual().times(0);

        let adapter = make_adapter(StubAccrualService::replying(reply(204, None, "")), ledger);

        let paced = adapter.reconcile(&Order::new("B2", 1)).await;
        assert_eq!(paced.cooldown, Duration::ZERO);
        assert_eq!(paced.result.unwrap(), AccrualDecision::Unknown);
    }

    #[tokio::test]
    async fn test_throttled_uses_retry_after_as_cooldown() {
        let mut ledger = MockOrderLedger::new();
        ledger.expect_record_accrual().times(0);

        let adapter = make_adapter(
            StubAccrualService::replying(reply(429, Some("5"), "")),
            ledger,
        );

        let paced = adapter.reconcile(&Order::new("C3", 1)).await;
        assert_eq!(paced.cooldown, Duration::from_secs(5));
        assert!(paced.result.is_ok());
    }

    #[tokio::test]
    async fn test_missing_retry_after_applies_error_cooldown() {
        let mut ledger = MockOrderLedger::new();
        ledger.expect_record_accrual().times(0);

        let adapter = make_adapter(StubAccrualService::replying(reply(429, None, "")), ledger);

        let paced = adapter.reconcile(&Order::new("C3", 1)).await;
        assert_eq!(paced.cooldown, Duration::from_secs(2));
        assert!(matches!(
            paced.result,
            Err(AccrualError::MalformedUpstreamResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_unrecognized_is_not_an_error() {
        let mut ledger = MockOrderLedger::new();
        ledger.expect_record_accrual().times(0);

        let adapter = make_adapter(
            StubAccrualService::replying(reply(503, None, "maintenance")),
            ledger,
        );

        let paced = adapter.reconcile(&Order::new("D4", 1)).await;
        assert_eq!(paced.cooldown, Duration::ZERO);
        assert_eq!(
            paced.result.unwrap(),
            AccrualDecision::Unrecognized { status_code: 503 }
        );
    }

    #[tokio::test]
    async fn test_transport_failure_applies_error_cooldown() {
        let mut ledger = MockOrderLedger::new();
        ledger.expect_record_accrual().times(0);

        let service = StubAccrualService::failing("connection refused");
        let adapter = make_adapter(service, ledger);

        let paced = adapter.reconcile(&Order::new("E5", 1)).await;
        assert_eq!(paced.cooldown, Duration::from_secs(2));
        assert!(matches!(paced.result, Err(AccrualError::TransientIo(_))));
    }

    #[tokio::test]
    async fn test_write_back_failure_is_propagated() {
        let mut ledger = MockOrderLedger::new();
        ledger.expect_record_accrual().times(1).returning(|number, _, _| {
            Err(LoyaltyError::NotFound {
                entity: "Order".to_string(),
                id: number.to_string(),
            })
        });

        let adapter = make_adapter(
            StubAccrualService::replying(reply(
                200,
                None,
                r#"{"order":"F6","status":"INVALID"}"#,
            )),
            ledger,
        );

        let paced = adapter.reconcile(&Order::new("F6", 1)).await;
        assert_eq!(paced.cooldown, Duration::from_secs(2));
        assert!(matches!(
            paced.result,
            Err(AccrualError::Ledger(LoyaltyError::NotFound { .. }))
        ));
    }

    // ─── HttpAccrualClient ──────────────────────────────────────────

    fn client_for(base_url: String) -> HttpAccrualClient {
        let config = AccrualConfig {
            base_url,
            request_timeout_secs: 2,
            ..Default::default()
        };
        HttpAccrualClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_http_client_reads_status_header_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/orders/C3"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "5"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/orders/A1"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"order":"A1","status":"PROCESSED","accrual":500}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let client = client_for(server.uri());

        let throttled = client.fetch("C3").await.unwrap();
        assert_eq!(throttled.status_code, 429);
        assert_eq!(throttled.retry_after.as_deref(), Some("5"));

        let decided = client.fetch("A1").await.unwrap();
        assert_eq!(decided.status_code, 200);
        assert!(decided.body.contains("PROCESSED"));
    }

    #[tokio::test]
    async fn test_http_client_connection_failure_is_transient() {
        // 绑定后立即释放端口，保证该地址上没有监听者
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(format!("127.0.0.1:{}", addr.port()));
        let err = client.fetch("A1").await.unwrap_err();
        assert!(matches!(err, AccrualError::TransientIo(_)));
    }
}
