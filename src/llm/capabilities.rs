//! Which models a provider offers for text and for vision, and which of them
//! need special request shaping.

use super::ProviderKind;
use serde::Serialize;

/// Temperature the provider applies when none may be chosen.
pub const PROVIDER_DEFAULT_TEMPERATURE: f32 = 1.0;

/// Model families that reject a custom sampling temperature.
const REASONING_PREFIXES: &[&str] = &["o1", "o3", "o4", "gpt-5"];

struct ProviderRules {
    provider: ProviderKind,
    /// Ids must start with one of these (empty = any id).
    allowed_prefixes: &'static [&'static str],
    /// Ids must contain this (empty = any id).
    family: &'static str,
    excluded: &'static [&'static str],
    vision_markers: &'static [&'static str],
    /// With a non-empty `family`, vision also requires one of these.
    vision_qualifiers: &'static [&'static str],
    text_excluded: &'static [&'static str],
    static_text: &'static [&'static str],
    static_vision: &'static [&'static str],
}

const RULES: &[ProviderRules] = &[
    ProviderRules {
        provider: ProviderKind::OpenAI,
        allowed_prefixes: &["gpt-3.5", "gpt-4", "gpt-5"],
        family: "",
        excluded: &[],
        vision_markers: &["gpt-4o", "gpt-4-turbo", "vision", "gpt-5"],
        vision_qualifiers: &[],
        text_excluded: &["vision", "audio"],
        static_text: &["gpt-5", "gpt-4o", "gpt-4-turbo", "gpt-3.5-turbo"],
        static_vision: &["gpt-4o", "gpt-4-turbo"],
    },
    ProviderRules {
        provider: ProviderKind::Gemini,
        allowed_prefixes: &[],
        family: "gemini",
        excluded: &["embedding"],
        vision_markers: &[],
        vision_qualifiers: &["1.5", "vision"],
        text_excluded: &[],
        static_text: &["gemini-3.5-pro", "gemini-2.5-pro"],
        static_vision: &["gemini-3.5-pro", "gemini-2.5-pro"],
    },
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCatalog {
    pub text_models: Vec<String>,
    pub image_models: Vec<String>,
}

fn rules_for(provider: ProviderKind) -> Option<&'static ProviderRules> {
    RULES.iter().find(|r| r.provider == provider)
}

impl ProviderRules {
    fn admits(&self, id: &str) -> bool {
        let lower = id.to_lowercase();
        if self.excluded.iter().any(|x| lower.contains(x)) {
            return false;
        }
        if !self.family.is_empty() && !id.contains(self.family) {
            return false;
        }
        self.allowed_prefixes.is_empty() || self.allowed_prefixes.iter().any(|p| id.starts_with(p))
    }

    fn is_vision(&self, id: &str) -> bool {
        if !self.admits(id) {
            return false;
        }
        if self.static_vision.contains(&id) {
            return true;
        }
        if !self.vision_qualifiers.is_empty() {
            return self.vision_qualifiers.iter().any(|q| id.contains(q));
        }
        self.vision_markers.iter().any(|m| id.contains(m))
    }

    fn is_text(&self, id: &str) -> bool {
        self.admits(id) && !self.text_excluded.iter().any(|x| id.contains(x))
    }
}

/// Splits a raw model listing into text and vision lists, each sorted.
pub fn classify(provider: ProviderKind, ids: &[String]) -> ModelCatalog {
    let Some(rules) = rules_for(provider) else {
        let mut all = ids.to_vec();
        all.sort();
        return ModelCatalog {
            text_models: all.clone(),
            image_models: all,
        };
    };
    let mut text_models: Vec<String> = ids.iter().filter(|id| rules.is_text(id)).cloned().collect();
    let mut image_models: Vec<String> =
        ids.iter().filter(|id| rules.is_vision(id)).cloned().collect();
    text_models.sort();
    image_models.sort();
    ModelCatalog {
        text_models,
        image_models,
    }
}

/// Built-in lists shown before a live listing has been fetched.
pub fn static_catalog(provider: ProviderKind) -> ModelCatalog {
    rules_for(provider)
        .map(|rules| ModelCatalog {
            text_models: rules.static_text.iter().map(|s| s.to_string()).collect(),
            image_models: rules.static_vision.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap_or_default()
}

/// Whether `model` on `provider` accepts image content parts.
pub fn is_vision_capable(provider: ProviderKind, model: &str) -> bool {
    rules_for(provider).is_some_and(|rules| rules.is_vision(model))
}

pub fn is_reasoning_model(model: &str) -> bool {
    let lower = model.to_lowercase();
    REASONING_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Sampling temperature actually sent for `model`.
pub fn effective_temperature(model: &str, configured: f32) -> f32 {
    if is_reasoning_model(model) {
        PROVIDER_DEFAULT_TEMPERATURE
    } else {
        configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_openai_classification() {
        let listing = ids(&[
            "gpt-4o",
            "gpt-4o-audio-preview",
            "gpt-3.5-turbo",
            "gpt-4-vision-preview",
            "dall-e-3",
            "text-embedding-3-small",
            "gpt-4-turbo",
        ]);
        let catalog = classify(ProviderKind::OpenAI, &listing);
        assert_eq!(
            catalog.text_models,
            ids(&["gpt-3.5-turbo", "gpt-4-turbo", "gpt-4o"])
        );
        assert_eq!(
            catalog.image_models,
            ids(&["gpt-4-turbo", "gpt-4-vision-preview", "gpt-4o", "gpt-4o-audio-preview"])
        );
    }

    #[test]
    fn test_gemini_classification() {
        let listing = ids(&[
            "gemini-1.5-flash",
            "gemini-1.0-pro",
            "text-embedding-004",
            "gemini-embedding-exp",
        ]);
        let catalog = classify(ProviderKind::Gemini, &listing);
        assert_eq!(catalog.text_models, ids(&["gemini-1.0-pro", "gemini-1.5-flash"]));
        assert_eq!(catalog.image_models, ids(&["gemini-1.5-flash"]));
    }

    #[test]
    fn test_vision_capability_table() {
        assert!(is_vision_capable(ProviderKind::OpenAI, "gpt-4o"));
        assert!(is_vision_capable(ProviderKind::OpenAI, "gpt-4o-mini"));
        assert!(!is_vision_capable(ProviderKind::OpenAI, "gpt-3.5-turbo"));
        assert!(!is_vision_capable(ProviderKind::OpenAI, "o1-mini"));
        assert!(is_vision_capable(ProviderKind::Gemini, "gemini-1.5-pro"));
        assert!(is_vision_capable(ProviderKind::Gemini, "gemini-2.5-pro"));
        assert!(!is_vision_capable(ProviderKind::Gemini, "gemini-1.0-pro"));
    }

    #[test]
    fn test_reasoning_models_use_provider_temperature() {
        assert_eq!(effective_temperature("o1-preview", 0.2), PROVIDER_DEFAULT_TEMPERATURE);
        assert_eq!(effective_temperature("gpt-5-mini", 0.2), PROVIDER_DEFAULT_TEMPERATURE);
        assert_eq!(effective_temperature("gpt-4o", 0.2), 0.2);
    }

    #[test]
    fn test_static_catalog() {
        let catalog = static_catalog(ProviderKind::OpenAI);
        assert!(catalog.text_models.contains(&"gpt-4o".to_string()));
        assert_eq!(catalog.image_models, ids(&["gpt-4o", "gpt-4-turbo"]));
    }
}
