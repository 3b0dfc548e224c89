use super::{
    EventSink, FetchModelsPayload, OutboundEvent, ProtocolError, SessionHandler,
    SETTINGS_LOADED, SETTINGS_SAVED, UPDATE_MODEL_LIST,
};
use crate::llm::capabilities::{classify, static_catalog, ModelCatalog};
use crate::llm::Endpoint;
use crate::settings::{mask_api_key, AppSettings};
use serde_json::json;
use tracing::{info, warn};

impl SessionHandler {
    fn post_settings(&self, view: &dyn EventSink, settings: &AppSettings) -> Result<(), ProtocolError> {
        let masked = serde_json::to_value(settings.masked())?;
        view.post(OutboundEvent::new(SETTINGS_LOADED, masked));
        Ok(())
    }

    pub(super) fn load_settings(&self, view: &dyn EventSink) -> Result<(), ProtocolError> {
        let settings = self.db.load_settings()?;
        self.post_settings(view, &settings)
    }

    pub(super) fn save_settings(
        &self,
        view: &dyn EventSink,
        mut settings: AppSettings,
    ) -> Result<(), ProtocolError> {
        let stored = self.db.load_settings()?;
        settings.restore_masked_keys(&stored);
        self.db.save_settings(&settings)?;
        info!(provider = settings.models.provider.name(), "settings saved");
        view.post(OutboundEvent::new(SETTINGS_SAVED, json!({ "ok": true })));
        Ok(())
    }

    pub(super) fn reset_settings(&self, view: &dyn EventSink) -> Result<(), ProtocolError> {
        self.db.reset_settings()?;
        info!("settings reset to defaults");
        self.post_settings(view, &AppSettings::default())
    }

    /// Lists the provider's models. An empty or failed listing falls back to
    /// the built-in catalog.
    pub(super) async fn fetch_models(
        &self,
        view: &dyn EventSink,
        payload: FetchModelsPayload,
    ) -> Result<(), ProtocolError> {
        let provider = payload.provider;
        let stored = self.db.load_settings()?;
        let stored_key = stored
            .models
            .provider_settings
            .get(provider.name())
            .map(|r| r.api_key.clone())
            .unwrap_or_default();
        let api_key = if payload.api_key.is_empty() || payload.api_key == mask_api_key(&stored_key) {
            stored_key
        } else {
            payload.api_key
        };
        let endpoint = Endpoint {
            provider,
            api_key,
            base_url: Some(payload.base_url).filter(|u| !u.trim().is_empty()),
        };

        let catalog = match self.backend.list_models(&endpoint).await {
            Ok(ids) if !ids.is_empty() => classify(provider, &ids),
            Ok(_) => {
                warn!(provider = provider.name(), "empty model listing, using built-in list");
                static_catalog(provider)
            }
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "model listing failed, using built-in list");
                static_catalog(provider)
            }
        };
        post_catalog(view, &catalog)
    }
}

fn post_catalog(view: &dyn EventSink, catalog: &ModelCatalog) -> Result<(), ProtocolError> {
    view.post(OutboundEvent::new(
        UPDATE_MODEL_LIST,
        serde_json::to_value(catalog)?,
    ));
    Ok(())
}
