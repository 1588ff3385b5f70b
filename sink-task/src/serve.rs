//! HTTP surface of the binary: health checks and the prometheus scrape
//! endpoint for the task's metrics.

use axum::{routing::get, Router};
use futures::future::ready;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::metrics_consts::{BATCH_SIZE, OFFSET_COMMIT_TIME_MS};

/// Records per `put`, up to a little over the default poll cap.
const BATCH_SIZE_BUCKETS: &[f64] = &[
    0.0, 1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
];

/// Commit latency in milliseconds, up to past the default commit timeout.
const COMMIT_TIME_MS_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

fn recorder_builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(BATCH_SIZE.to_string()), BATCH_SIZE_BUCKETS)?
        .set_buckets_for_metric(
            Matcher::Full(OFFSET_COMMIT_TIME_MS.to_string()),
            COMMIT_TIME_MS_BUCKETS,
        )
}

/// Install the process-wide recorder. Call once, before the task starts.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    recorder_builder()?.install_recorder()
}

pub fn router(recorder: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(|| ready("sink task")))
        .route("/_readiness", get(|| ready("ok")))
        .route("/_liveness", get(|| ready("ok")))
        .route("/metrics", get(move || ready(recorder.render())))
}

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_histograms_render_as_buckets() {
        let recorder = recorder_builder().unwrap().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            metrics::histogram!(OFFSET_COMMIT_TIME_MS, "task" => "log-sink-0").record(120.0);
            metrics::histogram!(BATCH_SIZE, "task" => "log-sink-0").record(3.0);
        });

        let rendered = handle.render();
        assert!(rendered.contains(&format!("{OFFSET_COMMIT_TIME_MS}_bucket")));
        assert!(rendered.contains(&format!("{BATCH_SIZE}_bucket")));
        assert!(!rendered.contains("quantile"));
    }
}
