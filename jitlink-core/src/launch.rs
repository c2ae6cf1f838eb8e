//! Direct app launch, no debugger involved.

use tracing::info;

use crate::bundle::BundleId;
use crate::error::LinkError;
use crate::proto::apps::{AppServiceReply, AppServiceRequest};
use crate::transport::SharedChannel;

/// Launch-without-debug client.
#[derive(Clone)]
pub struct LaunchService {
    channel: SharedChannel,
}

impl LaunchService {
    pub fn new(channel: SharedChannel) -> Self {
        Self { channel }
    }

    /// Ask the device to launch `bundle_id`.
    ///
    /// Fails with [`LinkError::AppNotFound`] for unknown bundles, or
    /// [`LinkError::LaunchRefused`] when the launch daemon declines
    /// (app already running exclusively, daemon error); the refusal
    /// reason is preserved for display.
    pub async fn launch_without_debug(&self, bundle_id: &BundleId) -> Result<(), LinkError> {
        let request = AppServiceRequest::Launch {
            bundle_id: bundle_id.to_string(),
        };
        let reply = self.channel.exchange(request.to_bytes()?.into()).await?;
        match AppServiceReply::from_bytes(&reply)? {
            AppServiceReply::Launched { pid, .. } => {
                info!(%bundle_id, pid, "launch requested");
                Ok(())
            }
            AppServiceReply::UnknownBundle { .. } => {
                Err(LinkError::AppNotFound(bundle_id.to_string()))
            }
            AppServiceReply::LaunchRefused { reason, .. } => Err(LinkError::LaunchRefused {
                bundle_id: bundle_id.to_string(),
                reason,
            }),
            AppServiceReply::Error { message } => Err(LinkError::Protocol(message)),
            other => Err(LinkError::Protocol(format!(
                "unexpected launch reply: {other:?}"
            ))),
        }
    }
}
