//! Job tracking record.

use serde::{Deserialize, Serialize};

/// Immutable identification of one job, created by the job loop and read by
/// the dispatcher and every deferred step.
///
/// `rcid` is the request correlation id; the dispatcher uses it to reject a
/// redelivered job while the first delivery is still in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracking {
    /// Beanstalk-style numeric job id.
    pub bjid: i64,
    /// Runner job number.
    pub rjnr: String,
    /// Runner job id.
    pub rjid: String,
    /// Request correlation id; the dispatcher's deduplication key.
    pub rcid: String,
    /// Dispatching process identifier.
    pub dpi: String,
    /// User-agent string attached to outbound requests made for this job.
    pub ua: String,
}

impl Tracking {
    /// Tag used to correlate log lines for this job.
    #[must_use]
    pub fn log_tag(&self) -> String {
        format!("{}-{}", self.bjid, self.rjid)
    }
}
