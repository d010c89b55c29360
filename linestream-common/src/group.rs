use tracing::info;

use crate::error::GroupError;
use crate::log::{GroupCreation, LogClient};

/// Make sure `group` exists on `stream`, creating both if needed.
///
/// A new group only sees entries appended after its creation. Calling this for an existing group
/// is a no-op and leaves its cursor where it was. It must complete before any worker of the group
/// claims entries.
pub async fn ensure_group(
    log: &dyn LogClient,
    stream: &str,
    group: &str,
) -> Result<(), GroupError> {
    match log.create_group(stream, group).await {
        Ok(GroupCreation::Created) => {
            info!(
                "created consumer group {} on stream {}",
                group, stream
            );
            Ok(())
        }
        Ok(GroupCreation::AlreadyExists) => {
            info!(
                "consumer group {} already exists on stream {}",
                group, stream
            );
            Ok(())
        }
        Err(error) => Err(GroupError::GroupBootstrapFailed {
            stream: stream.to_owned(),
            group: group.to_owned(),
            error,
        }),
    }
}
