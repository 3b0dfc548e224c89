use crate::db::{Database, StoreError};
use crate::llm::{Endpoint, ProviderKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Settings row key holding the whole record as JSON.
pub const SETTINGS_KEY: &str = "customSettings";

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an expert code assistant. Answer coding relevant topics only.";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub general: GeneralSettings,
    pub models: ModelSettings,
    pub prompts: Vec<PromptDef>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneralSettings {
    pub temperature: f32,
    pub max_context_messages: usize,
    pub system_prompt: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    pub text_model: String,
    pub image_model: String,
    pub base_url: String,
    pub api_key: String,
    pub provider: ProviderKind,
    /// Per-provider records keyed by provider name.
    pub provider_settings: BTreeMap<String, ProviderSettings>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    pub api_key: String,
    pub base_url: String,
    pub text_model: String,
    pub image_model: String,
}

/// One named system-prompt stage of the pipeline.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptDef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub order: i64,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_context_messages: 10,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl ProviderSettings {
    pub fn defaults_for(provider: ProviderKind) -> Self {
        let (text_model, image_model) = match provider {
            ProviderKind::OpenAI => ("gpt-4o", "gpt-4o"),
            ProviderKind::Gemini => ("gemini-1.5-pro", "gemini-1.5-flash"),
        };
        Self {
            api_key: String::new(),
            base_url: provider.default_base_url().to_string(),
            text_model: text_model.to_string(),
            image_model: image_model.to_string(),
        }
    }
}

fn default_provider_settings() -> BTreeMap<String, ProviderSettings> {
    ProviderKind::ALL
        .iter()
        .map(|p| (p.name().to_string(), ProviderSettings::defaults_for(*p)))
        .collect()
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            text_model: "gpt-4o".to_string(),
            image_model: "gpt-4o".to_string(),
            base_url: String::new(),
            api_key: String::new(),
            provider: ProviderKind::OpenAI,
            provider_settings: default_provider_settings(),
        }
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            general: GeneralSettings::default(),
            models: ModelSettings::default(),
            prompts: Vec::new(),
        }
    }
}

impl AppSettings {
    /// Parses a stored record, filling anything missing from the defaults.
    pub fn from_stored(raw: &str) -> Result<Self, serde_json::Error> {
        let mut settings: AppSettings = serde_json::from_str(raw)?;
        settings.fill_provider_defaults();
        Ok(settings)
    }

    fn fill_provider_defaults(&mut self) {
        for (name, defaults) in default_provider_settings() {
            self.models.provider_settings.entry(name).or_insert(defaults);
        }
    }

    fn active_provider_record(&self) -> Option<&ProviderSettings> {
        self.models.provider_settings.get(self.models.provider.name())
    }

    /// Credentials and base URL for the active provider. Top-level values win
    /// over the provider record when set.
    pub fn endpoint(&self) -> Endpoint {
        let record = self.active_provider_record();
        let api_key = non_empty(&self.models.api_key)
            .or_else(|| record.and_then(|r| non_empty(&r.api_key)))
            .unwrap_or_default();
        let base_url = non_empty(&self.models.base_url)
            .or_else(|| record.and_then(|r| non_empty(&r.base_url)));
        Endpoint {
            provider: self.models.provider,
            api_key,
            base_url,
        }
    }

    pub fn text_model(&self) -> String {
        non_empty(&self.models.text_model)
            .or_else(|| self.active_provider_record().and_then(|r| non_empty(&r.text_model)))
            .unwrap_or_else(|| ModelSettings::default().text_model)
    }

    pub fn image_model(&self) -> String {
        non_empty(&self.models.image_model)
            .or_else(|| self.active_provider_record().and_then(|r| non_empty(&r.image_model)))
            .unwrap_or_else(|| ModelSettings::default().image_model)
    }

    /// Copy with API keys shortened to `abcd...wxyz` for display.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.models.api_key = mask_api_key(&copy.models.api_key);
        for record in copy.models.provider_settings.values_mut() {
            record.api_key = mask_api_key(&record.api_key);
        }
        copy
    }

    /// Keys that come back exactly as [`masked`](Self::masked) rendered them
    /// keep the stored secret.
    pub fn restore_masked_keys(&mut self, stored: &AppSettings) {
        if is_masked_echo(&self.models.api_key, &stored.models.api_key) {
            self.models.api_key = stored.models.api_key.clone();
        }
        for (name, record) in self.models.provider_settings.iter_mut() {
            if let Some(previous) = stored.models.provider_settings.get(name) {
                if is_masked_echo(&record.api_key, &previous.api_key) {
                    record.api_key = previous.api_key.clone();
                }
            }
        }
    }
}

fn is_masked_echo(incoming: &str, stored: &str) -> bool {
    !stored.is_empty() && incoming != stored && incoming == mask_api_key(stored)
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn mask_api_key(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        value.to_string()
    }
}

// ── Settings record ──

impl Database {
    /// Current settings snapshot. A missing or unreadable record yields the
    /// defaults.
    pub fn load_settings(&self) -> Result<AppSettings, StoreError> {
        let Some(raw) = self.get_setting(SETTINGS_KEY)? else {
            return Ok(AppSettings::default());
        };
        match AppSettings::from_stored(&raw) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!(error = %e, "stored settings unreadable, using defaults");
                Ok(AppSettings::default())
            }
        }
    }

    pub fn save_settings(&self, settings: &AppSettings) -> Result<(), StoreError> {
        let raw = serde_json::to_string(settings)?;
        self.set_setting(SETTINGS_KEY, &raw)
    }

    pub fn reset_settings(&self) -> Result<(), StoreError> {
        self.delete_setting(SETTINGS_KEY)
    }
}
