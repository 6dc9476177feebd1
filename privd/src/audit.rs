//! Call logging around every exposed operation.

use crate::error::Fault;
use privd_log::error;
use std::future::Future;

/// Run an operation and log its failure.
///
/// The fault is returned to the caller unchanged; the log record is
/// the daemon's audit trail of failed privileged calls.
pub async fn logged<F, T>(name: &str, call: F) -> Result<T, Fault>
where
    F: Future<Output = Result<T, Fault>>,
{
    let result = call.await;
    if let Err(fault) = &result {
        error!("Error in {}", name; "fault" => %fault, "detail" => ?fault);
    }
    result
}
