use serde::{Deserialize, Serialize};
use std::fmt;

/// Sender-scoped, monotonically increasing message id.
///
/// Ordering is only meaningful between ids minted by the same sender.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
