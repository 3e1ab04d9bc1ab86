//! Headers stamped on messages leaving the receive loop after a failure.

use chrono::{DateTime, Utc};

use conveyor_common::{Headers, headers};

use crate::action::FailureRecord;

/// Describe the failure on a message about to be moved to the error queue.
///
/// `failed_queue` is the queue the message was received from so operators
/// can return it there.
pub fn apply_fault_headers(
    headers: &mut Headers,
    failed_queue: &str,
    error: &anyhow::Error,
    record: &FailureRecord,
) {
    headers.insert(headers::FAILED_QUEUE.into(), failed_queue.into());
    headers.insert(headers::EXCEPTION_MESSAGE.into(), error.to_string());
    headers.insert(headers::EXCEPTION_CHAIN.into(), format!("{error:#}"));
    headers.insert(
        headers::TIME_OF_FAILURE.into(),
        record.last_failure.to_rfc3339(),
    );
    headers.insert(
        headers::PROCESSING_ATTEMPTS.into(),
        record.attempts.to_string(),
    );
}

/// Record that the message is being handed back for delayed retry number
/// `retry`.
pub fn apply_delayed_retry_headers(headers: &mut Headers, retry: u32, now: DateTime<Utc>) {
    headers.insert(headers::DELAYED_RETRIES.into(), retry.to_string());
    headers.insert(headers::DELAYED_RETRIES_TIMESTAMP.into(), now.to_rfc3339());
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, anyhow::Context as _};

    #[test]
    fn fault_headers_describe_the_failure() {
        let error = Err::<(), _>(anyhow::anyhow!("connection refused"))
            .context("saving order")
            .unwrap_err();
        let mut record = FailureRecord::new(Utc::now());
        record.attempts = 4;

        let mut headers = Headers::new();
        apply_fault_headers(&mut headers, "Sales", &error, &record);

        assert_eq!(headers[headers::FAILED_QUEUE], "Sales");
        assert_eq!(headers[headers::EXCEPTION_MESSAGE], "saving order");
        assert_eq!(
            headers[headers::EXCEPTION_CHAIN],
            "saving order: connection refused"
        );
        assert_eq!(headers[headers::PROCESSING_ATTEMPTS], "4");
        assert!(headers.contains_key(headers::TIME_OF_FAILURE));
    }

    #[test]
    fn delayed_retry_number_is_written() {
        let mut headers = Headers::new();
        apply_delayed_retry_headers(&mut headers, 2, Utc::now());
        assert_eq!(headers[headers::DELAYED_RETRIES], "2");
    }
}
