//! Adapter metrics.
//!
//! Uses the `metrics` facade; the embedding application decides which
//! recorder (if any) to install.  Call [`describe_metrics`] once after
//! installing it.

use metrics::{counter, describe_counter, describe_gauge, gauge};

// -- Metric name constants ----------------------------------------------------

/// Total uploads (counter). Labels: status.
pub const UPLOADS_TOTAL: &str = "gcs_attachments_uploads_total";

/// Total deletes (counter). Labels: status.
pub const DELETES_TOTAL: &str = "gcs_attachments_deletes_total";

/// Total credential exchanges (counter). Labels: status.
pub const AUTH_TOTAL: &str = "gcs_attachments_auth_total";

/// Operations waiting for the credential exchange, summed over all
/// adapter instances (gauge).
pub const PENDING_OPERATIONS: &str = "gcs_attachments_pending_operations";

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(UPLOADS_TOTAL, "Total attachment uploads by outcome");
    describe_counter!(DELETES_TOTAL, "Total attachment deletes by outcome");
    describe_counter!(AUTH_TOTAL, "Total credential exchanges by outcome");
    describe_gauge!(
        PENDING_OPERATIONS,
        "Operations queued until the adapter is connected"
    );
}

fn status<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() {
        "ok"
    } else {
        "error"
    }
}

pub(crate) fn record_upload<T, E>(result: &Result<T, E>) {
    counter!(UPLOADS_TOTAL, "status" => status(result)).increment(1);
}

pub(crate) fn record_delete<T, E>(result: &Result<T, E>) {
    counter!(DELETES_TOTAL, "status" => status(result)).increment(1);
}

pub(crate) fn record_auth<T, E>(result: &Result<T, E>) {
    counter!(AUTH_TOTAL, "status" => status(result)).increment(1);
}

pub(crate) fn pending_queued() {
    gauge!(PENDING_OPERATIONS).increment(1.0);
}

pub(crate) fn pending_drained(count: usize) {
    gauge!(PENDING_OPERATIONS).decrement(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [UPLOADS_TOTAL, DELETES_TOTAL, AUTH_TOTAL, PENDING_OPERATIONS] {
            assert!(name.starts_with("gcs_attachments_"));
        }
    }

    #[test]
    fn test_status_label() {
        assert_eq!(status::<(), ()>(&Ok(())), "ok");
        assert_eq!(status::<(), ()>(&Err(())), "error");
    }

    #[test]
    fn test_record_without_recorder_is_noop() {
        describe_metrics();
        record_upload::<(), ()>(&Ok(()));
        record_delete::<(), ()>(&Err(()));
        pending_queued();
        pending_drained(1);
    }
}
