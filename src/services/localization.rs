//! Human-readable messages for failures surfaced to end users.

use std::collections::HashMap;

/// Message key used when an export runs out of memory.
pub const OUT_OF_MEMORY: &str = "export.error.out_of_memory";

pub trait Localizer: Send + Sync {
    fn localize(&self, key: &str, locale: &str) -> String;
}

/// In-memory catalog keyed by language.
///
/// Lookups try the full locale (`fr-CA`), then its language (`fr`), then
/// English, and finally return the key itself.
#[derive(Debug, Clone)]
pub struct MessageCatalog {
    messages: HashMap<(String, String), String>,
}

impl Default for MessageCatalog {
    fn default() -> Self {
        let mut catalog = Self::empty();
        catalog.insert(
            "en",
            OUT_OF_MEMORY,
            "The archive is too large to be prepared. Try exporting fewer files at once.",
        );
        catalog.insert(
            "fr",
            OUT_OF_MEMORY,
            "L'archive est trop volumineuse pour être préparée. Essayez d'exporter moins de fichiers à la fois.",
        );
        catalog.insert(
            "de",
            OUT_OF_MEMORY,
            "Das Archiv ist zu groß. Exportieren Sie weniger Dateien auf einmal.",
        );
        catalog.insert(
            "es",
            OUT_OF_MEMORY,
            "El archivo es demasiado grande para prepararlo. Intente exportar menos archivos a la vez.",
        );
        catalog
    }
}

impl MessageCatalog {
    pub fn empty() -> Self {
        Self {
            messages: HashMap::new(),
        }
    }

    pub fn insert(&mut self, locale: &str, key: &str, message: impl Into<String>) {
        self.messages
            .insert((locale.to_ascii_lowercase(), key.to_string()), message.into());
    }

    fn lookup(&self, locale: &str, key: &str) -> Option<&String> {
        self.messages.get(&(locale.to_ascii_lowercase(), key.to_string()))
    }
}

impl Localizer for MessageCatalog {
    fn localize(&self, key: &str, locale: &str) -> String {
        let language = locale.split(['-', '_']).next().unwrap_or(locale);
        self.lookup(locale, key)
            .or_else(|| self.lookup(language, key))
            .or_else(|| self.lookup("en", key))
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }
}
