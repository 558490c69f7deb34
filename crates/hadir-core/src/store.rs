//! Attendance persistence interface.

use std::future::Future;

use crate::types::{AttendanceRecord, EnrolledIdentity};

/// Durable store of enrolled identities and attendance history.
///
/// `commit` performs no retries of its own; the coordinator owns retry policy.
/// Implementations are cheap to clone so a commit can run as its own task.
pub trait AttendanceStore: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// All enrolled identities, in enrollment order.
    fn fetch_enrolled_identities(
        &self,
    ) -> impl Future<Output = Result<Vec<EnrolledIdentity>, Self::Error>> + Send;

    /// Record one attendance event for `identity`.
    fn commit(
        &self,
        identity: &EnrolledIdentity,
    ) -> impl Future<Output = Result<AttendanceRecord, Self::Error>> + Send;
}
