//! The mutating operations of the job state machine.
//!
//! Every operation takes the job's mutex before reading the job and releases it after its last
//! write. Notifications about the resulting job state are sent once the mutex is released.
use crate::store::{LockGuard, StoreError};

use super::OperationError;

pub mod cancel;
pub mod delete;
pub mod fail;
pub mod notification;
pub mod restart;
pub mod start;

/// Releases the job's mutex and hands back the outcome of the work done while holding it.
///
/// An error from the work takes precedence over an error releasing the mutex.
async fn release<T>(
    lock: LockGuard,
    result: Result<T, OperationError>,
) -> Result<T, OperationError> {
    let released: Result<(), StoreError> = lock.release().await;
    let value = result?;
    released?;
    Ok(value)
}
