//! Report rendering.

use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

use vinfra_runtime::RunReport;

/// Render the run report as summary + per-kind tables.
pub fn render_report(report: &RunReport) -> String {
    let mut summary = Table::new();
    summary
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Metric", "Value"]);
    summary.add_row(vec![
        "Jobs in trace".to_string(),
        report.jobs_total.to_string(),
    ]);
    summary.add_row(vec![
        "Jobs dispatched".to_string(),
        report.jobs_dispatched.to_string(),
    ]);
    summary.add_row(vec![
        "Jobs completed".to_string(),
        report.jobs_done.to_string(),
    ]);
    summary.add_row(vec![
        "Average queue time".to_string(),
        format!("{:.1} s", report.average_queue_ms / 1_000.0),
    ]);
    summary.add_row(vec![
        "Simulated time".to_string(),
        format!("{:.1} s", report.finished_at_ms as f64 / 1_000.0),
    ]);
    summary.add_row(vec![
        "VMs created".to_string(),
        report.vms_created.to_string(),
    ]);
    summary.add_row(vec![
        "VMs still live".to_string(),
        report.vms_live.to_string(),
    ]);
    summary.add_row(vec![
        "Park core utilization".to_string(),
        format!("{:.1} %", report.park_core_utilization * 100.0),
    ]);

    if report.pool_sizes.is_empty() {
        return summary.to_string();
    }

    let mut pools = Table::new();
    pools
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Kind", "Pool size"]);
    for (kind, size) in &report.pool_sizes {
        pools.add_row(vec![kind.clone(), size.to_string()]);
    }

    format!("{summary}\n{pools}")
}
