//! UUID v7 helpers for time-ordered identifiers.
//!
//! Queue jobs and work records use UUIDv7 so that identifiers sort by
//! creation time, which keeps b-tree inserts append-mostly.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use reposcan_core::uuid_utils::new_v7;
///
/// let a = new_v7();
/// let b = new_v7();
/// assert_eq!(a.get_version_num(), 7);
/// assert_ne!(a, b);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}
