//! Root owner resolution
//!
//! Walks controller ownership references upward (Pod -> ReplicaSet ->
//! Deployment, Pod -> Job -> CronJob, ...) until an object with no owner is
//! found. The walk is bounded so ownership cycles terminate.

use super::ClusterReader;
use crate::error::OwnerError;
use crate::models::{ObjectInfo, OwnerReference};
use tracing::trace;

/// Maximum number of objects fetched while looking for a root owner
pub const MAX_OWNER_DEPTH: usize = 10;

/// Resolve the topmost controller reachable from `start`
///
/// Follows the first owner reference of each fetched object. Fails with
/// `MaxDepthExceeded` when `MAX_OWNER_DEPTH` objects have been fetched and
/// the last one still has an owner.
pub async fn resolve_root_owner<R>(
    reader: &R,
    namespace: &str,
    start: &OwnerReference,
) -> Result<ObjectInfo, OwnerError>
where
    R: ClusterReader + ?Sized,
{
    let mut current = start.clone();

    for depth in 0..MAX_OWNER_DEPTH {
        let obj = reader.get_owner(namespace, &current).await?;
        match obj.owner_references.first() {
            None => return Ok(obj),
            Some(next) => {
                trace!(depth, from = %obj.name, to = %next.name, "Following owner reference");
                current = next.clone();
            }
        }
    }

    Err(OwnerError::MaxDepthExceeded {
        name: current.name,
        depth: MAX_OWNER_DEPTH,
    })
}
