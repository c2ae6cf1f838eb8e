//! Per-app icon fetching and decoding.
//!
//! The device hands back encoded icon bytes; turning those into pixel
//! data is a boundary concern behind the [`IconDecoder`] trait. The
//! bundled [`PngIconDecoder`] covers the common case.

use std::sync::Arc;

use crate::bundle::BundleId;
use crate::error::LinkError;
use crate::proto::apps::{AppServiceReply, AppServiceRequest};
use crate::transport::SharedChannel;

// ── Decoding seam ────────────────────────────────────────────────

/// Decoded icon pixels, RGBA8 row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedIcon {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Turns raw icon bytes from the device into pixels.
pub trait IconDecoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<DecodedIcon, LinkError>;
}

/// Default decoder for PNG icon payloads.
#[derive(Debug, Default)]
pub struct PngIconDecoder;

impl IconDecoder for PngIconDecoder {
    fn decode(&self, data: &[u8]) -> Result<DecodedIcon, LinkError> {
        let image = image::load_from_memory_with_format(data, image::ImageFormat::Png)
            .map_err(|e| LinkError::Protocol(format!("icon data did not decode: {e}")))?;
        let rgba = image.to_rgba8();
        Ok(DecodedIcon {
            width: rgba.width(),
            height: rgba.height(),
            rgba: rgba.into_raw(),
        })
    }
}

// ── Service ──────────────────────────────────────────────────────

/// Icon fetch client.
#[derive(Clone)]
pub struct IconService {
    channel: SharedChannel,
    decoder: Arc<dyn IconDecoder>,
}

impl IconService {
    pub fn new(channel: SharedChannel, decoder: Arc<dyn IconDecoder>) -> Self {
        Self { channel, decoder }
    }

    /// Fetch and decode the icon for `bundle_id`.
    ///
    /// Fails with [`LinkError::AppNotFound`] for unknown bundles and
    /// [`LinkError::IconUnavailable`] when the device holds no icon
    /// data for the app; icon data is never silently empty.
    pub async fn icon(&self, bundle_id: &BundleId) -> Result<DecodedIcon, LinkError> {
        let request = AppServiceRequest::FetchIcon {
            bundle_id: bundle_id.to_string(),
        };
        let reply = self.channel.exchange(request.to_bytes()?.into()).await?;
        match AppServiceReply::from_bytes(&reply)? {
            AppServiceReply::Icon { data, .. } => {
                if data.is_empty() {
                    return Err(LinkError::IconUnavailable(bundle_id.to_string()));
                }
                self.decoder.decode(&data)
            }
            AppServiceReply::NoIcon { .. } => {
                Err(LinkError::IconUnavailable(bundle_id.to_string()))
            }
            AppServiceReply::UnknownBundle { .. } => {
                Err(LinkError::AppNotFound(bundle_id.to_string()))
            }
            AppServiceReply::Error { message } => Err(LinkError::Protocol(message)),
            other => Err(LinkError::Protocol(format!(
                "unexpected icon reply: {other:?}"
            ))),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
