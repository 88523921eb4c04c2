//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册通用指标，描述会出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "accrual_requests_total",
        "Accrual service round trips by outcome"
    );
    metrics::describe_histogram!(
        "accrual_request_duration_seconds",
        "Accrual service round trip duration in seconds"
    );
    metrics::describe_counter!("order_feed_polls_total", "Order feed polling ticks by result");
    metrics::describe_counter!(
        "order_feed_orders_emitted_total",
        "Orders handed to the reconciler"
    );
    metrics::describe_counter!(
        "throttle_transitions_total",
        "Throttled executor breaker transitions"
    );
    metrics::describe_counter!(
        "throttle_rejections_total",
        "Calls rejected by the throttled executor"
    );
    metrics::describe_gauge!("throttle_breaker_state", "0=closed, 1=half_open, 2=open");
    metrics::describe_gauge!(
        "worker_last_run_timestamp",
        "Unix timestamp of the last worker loop iteration"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次积分服务往返
#[inline]
pub fn record_accrual_request(outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "accrual_requests_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "accrual_request_duration_seconds",
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

/// 记录一次订单发现轮询
#[inline]
pub fn record_feed_poll(status: &str, emitted: usize) {
    metrics::counter!("order_feed_polls_total", "status" => status.to_string()).increment(1);
    metrics::counter!("order_feed_orders_emitted_total").increment(emitted as u64);
}

/// 记录后台任务最近一次运行时间，供告警判断任务是否存活
#[inline]
pub fn set_worker_last_run(worker: &str) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    metrics::gauge!("worker_last_run_timestamp", "worker" => worker.to_string()).set(now);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_accrual_request("decided", 0.1);
        record_feed_poll("ok", 3);
        set_worker_last_run("order_feed");
    }
}
