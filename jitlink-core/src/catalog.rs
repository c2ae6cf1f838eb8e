//! Installed-application catalog queries.
//!
//! Read-only lookups against the device's app inventory, returning a
//! typed mapping from bundle identifier to display name. Shares the
//! app-service sub-channel with icon fetches and launches.

use std::collections::BTreeMap;

use crate::bundle::BundleId;
use crate::error::LinkError;
use crate::proto::apps::{AppRecord, AppScope, AppServiceReply, AppServiceRequest};
use crate::transport::SharedChannel;

/// Catalog query client.
#[derive(Clone)]
pub struct AppCatalogService {
    channel: SharedChannel,
}

impl AppCatalogService {
    pub fn new(channel: SharedChannel) -> Self {
        Self { channel }
    }

    /// User-installed apps.
    pub async fn list_user_apps(&self) -> Result<BTreeMap<BundleId, String>, LinkError> {
        self.list(AppScope::User).await
    }

    /// User and visible system apps.
    pub async fn list_all_apps(&self) -> Result<BTreeMap<BundleId, String>, LinkError> {
        self.list(AppScope::All).await
    }

    /// System apps hidden from the home screen.
    pub async fn list_hidden_system_apps(&self) -> Result<BTreeMap<BundleId, String>, LinkError> {
        self.list(AppScope::HiddenSystem).await
    }

    async fn list(&self, scope: AppScope) -> Result<BTreeMap<BundleId, String>, LinkError> {
        let records = self.records(scope).await?;
        Ok(records
            .into_iter()
            .map(|record| (BundleId::from(record.bundle_id), record.display_name))
            .collect())
    }

    async fn records(&self, scope: AppScope) -> Result<Vec<AppRecord>, LinkError> {
        let request = AppServiceRequest::ListApps { scope };
        let reply = self.channel.exchange(request.to_bytes()?.into()).await?;
        match AppServiceReply::from_bytes(&reply)? {
            AppServiceReply::Apps { apps } => Ok(apps),
            AppServiceReply::Error { message } => Err(LinkError::Protocol(message)),
            other => Err(LinkError::Protocol(format!(
                "unexpected catalog reply: {other:?}"
            ))),
        }
    }

    /// Look a bundle identifier up across every scope.
    ///
    /// Used to resolve a debug target before launching it.
    pub async fn resolve(&self, bundle_id: &BundleId) -> Result<Option<AppRecord>, LinkError> {
        for scope in [AppScope::All, AppScope::HiddenSystem] {
            let found = self
                .records(scope)
                .await?
                .into_iter()
                .find(|record| record.bundle_id == bundle_id.as_str());
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }
}
