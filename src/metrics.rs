use std::sync::LazyLock;

use prometheus::*;

static METRIC_INGEST_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("imrag_ingest_count", "count of ingested images by outcome", &[
        "outcome"
    ])
    .unwrap()
});

static METRIC_COMPENSATION_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "imrag_compensation_count",
        "count of compensating vector deletes by outcome",
        &["outcome"]
    )
    .unwrap()
});

static METRIC_ORPHAN_VECTOR_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "imrag_orphan_vector_count",
        "count of vectors left in the index without a metadata row",
        &["step"]
    )
    .unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!("imrag_search_duration", "duration of the search in seconds", &[
        "source"
    ])
    .unwrap()
});

static METRIC_SEARCH_RESULT_COUNT: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "imrag_search_result_count",
        "number of matches returned by a search",
        vec![0.0, 1.0, 5.0, 10.0, 20.0, 50.0, 100.0]
    )
    .unwrap()
});

static METRIC_SEARCH_DROPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "imrag_search_dropped_count",
        "count of search candidates dropped after metadata resolution",
        &["reason"]
    )
    .unwrap()
});

/// 增加图片入库结果计数，`outcome` 为失败的步骤或 `ok`
pub fn inc_ingest(outcome: &str) {
    METRIC_INGEST_COUNT.with_label_values(&[outcome]).inc();
}

pub fn inc_compensation(success: bool) {
    let outcome = if success { "ok" } else { "failed" };
    METRIC_COMPENSATION_COUNT.with_label_values(&[outcome]).inc();
}

pub fn inc_orphan_vector(step: &str) {
    METRIC_ORPHAN_VECTOR_COUNT.with_label_values(&[step]).inc();
}

pub fn observe_search_duration(source: &str, duration: f32) {
    METRIC_SEARCH_DURATION.with_label_values(&[source]).observe(duration as f64);
}

pub fn observe_search_results(count: usize) {
    METRIC_SEARCH_RESULT_COUNT.observe(count as f64);
}

pub fn inc_search_dropped(reason: &str, count: usize) {
    if count > 0 {
        METRIC_SEARCH_DROPPED.with_label_values(&[reason]).inc_by(count as u64);
    }
}

/// 以文本格式导出所有指标
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&prometheus::gather()).unwrap_or_default()
}
