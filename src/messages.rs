//! Localized text shown to the commenter when a submission is queued.

use std::collections::HashMap;

pub const DEFAULT_QUEUED_MESSAGE: &str = "Your comment will be submitted once you are back online!";

/// Locale → queued-submission message.
///
/// Locales use WordPress form (`de_DE`, `pt_BR`). Lookup falls back from the
/// full locale to its language (`de`) and then to the default message.
#[derive(Debug, Clone)]
pub struct MessageCatalog {
    default: String,
    translations: HashMap<String, String>,
}

impl Default for MessageCatalog {
    fn default() -> Self {
        Self {
            default: DEFAULT_QUEUED_MESSAGE.to_owned(),
            translations: HashMap::new(),
        }
    }
}

impl MessageCatalog {
    #[must_use]
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            translations: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_translation(mut self, locale: impl AsRef<str>, message: impl Into<String>) -> Self {
        self.translations
            .insert(normalize_locale(locale.as_ref()), message.into());
        self
    }

    #[must_use]
    pub fn resolve(&self, locale: Option<&str>) -> &str {
        let Some(locale) = locale else {
            return &self.default;
        };
        let locale = normalize_locale(locale);
        if let Some(message) = self.translations.get(&locale) {
            return message;
        }
        locale
            .split_once('_')
            .and_then(|(lang, _)| self.translations.get(lang))
            .map_or(&self.default, |message| message)
    }
}

fn normalize_locale(locale: &str) -> String {
    locale.trim().replace('-', "_").to_ascii_lowercase()
}
