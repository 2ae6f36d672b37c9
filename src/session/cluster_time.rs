use std::sync::{Mutex, PoisonError};

use bson::{Document, Timestamp};
use derive_where::derive_where;
use serde::{Deserialize, Serialize};

/// Struct modeling a cluster time reported by the server.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[derive_where(PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    #[derive_where(skip)]
    pub(crate) signature: Document,
}

impl ClusterTime {
    /// Parses the `$clusterTime` field of a server response, if present and well formed.
    pub(crate) fn from_response(response: &Document) -> Option<Self> {
        let document = response.get_document("$clusterTime").ok()?;
        bson::from_document(document.clone()).ok()
    }

    pub(crate) fn to_document(&self) -> Document {
        bson::doc! {
            "clusterTime": self.cluster_time,
            "signature": self.signature.clone(),
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.cluster_time
    }
}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Returns whichever of the two cluster times is later.
pub(crate) fn max_cluster_time(
    lhs: Option<ClusterTime>,
    rhs: Option<ClusterTime>,
) -> Option<ClusterTime> {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => Some(std::cmp::max(lhs, rhs)),
        (lhs, rhs) => lhs.or(rhs),
    }
}

/// The latest cluster time observed by any operation against a deployment. Shared between
/// operations; updates only ever move it forward, so concurrent updates commute.
#[derive(Debug, Default)]
pub struct ClusterClock {
    cluster_time: Mutex<Option<ClusterTime>>,
}

impl ClusterClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest cluster time seen so far.
    pub fn get(&self) -> Option<ClusterTime> {
        self.cluster_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the stored cluster time with `to` if `to` is later.
    pub fn advance(&self, to: &ClusterTime) {
        let mut current = self
            .cluster_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().map(|ct| ct < to).unwrap_or(true) {
            *current = Some(to.clone());
        }
    }
}
