use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;

pub const LINES_READ: &str = "lines_read_total";
pub const LINE_APPEND_FAILURES: &str = "line_append_failures_total";
pub const TAIL_ERRORS: &str = "tail_errors_total";

pub const LINES_WRITTEN: &str = "lines_written_total";
pub const CLAIM_FAILURES: &str = "claim_failures_total";
pub const MALFORMED_ENTRIES: &str = "entries_malformed_total";
pub const SINK_WRITE_FAILURES: &str = "sink_write_failures_total";
pub const ACK_FAILURES: &str = "ack_failures_total";
pub const RECLAIMED_ENTRIES: &str = "entries_reclaimed_total";
pub const POISONED_ENTRIES: &str = "entries_poisoned";

/// Serve a `Router` on an already bound listener, so that binding errors surface at startup.
pub async fn serve(router: Router, listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the process-wide recorder and add the prometheus endpoint to a router.
/// Touches global state, so it must be called once per process.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router.route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    ))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()?;
    describe_metrics();

    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(LINES_READ, "Total number of lines read");
    metrics::describe_counter!(
        LINE_APPEND_FAILURES,
        "Lines that could not be appended to the stream"
    );
    metrics::describe_counter!(TAIL_ERRORS, "Errors reading the input file");
    metrics::describe_counter!(LINES_WRITTEN, "Total number of lines written");
    metrics::describe_counter!(CLAIM_FAILURES, "Failed attempts to claim entries");
    metrics::describe_counter!(MALFORMED_ENTRIES, "Entries skipped for lacking a text line");
    metrics::describe_counter!(SINK_WRITE_FAILURES, "Lines that could not be written");
    metrics::describe_counter!(
        ACK_FAILURES,
        "Written lines whose entry was not acknowledged"
    );
    metrics::describe_counter!(RECLAIMED_ENTRIES, "Entries taken over from idle consumers");
    metrics::describe_gauge!(
        POISONED_ENTRIES,
        "Pending entries left alone after reaching the delivery limit"
    );
}
