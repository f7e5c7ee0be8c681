//! User preference lookup

use super::Feature;
use std::collections::HashMap;
use std::sync::RwLock;

/// Read access to the host's preference store
pub trait Preferences: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;

    /// `"true"` / `"false"`; anything else counts as unset
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_string(key)?.trim().parse().ok()
    }
}

/// Preference key selecting the mediator for `language`
pub fn mediator_pref_key(language: &str) -> String {
    format!("codeintel.mediator.{}", language)
}

/// Preference key switching `feature` on or off
pub fn feature_pref_key(feature: Feature) -> String {
    format!("codeintel.{}.enabled", feature)
}

/// Features are enabled unless the preference turns them off
pub fn is_feature_enabled(prefs: &dyn Preferences, feature: Feature) -> bool {
    prefs.get_bool(&feature_pref_key(feature)).unwrap_or(true)
}

/// In-memory preference store
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_string(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.into(), value.into());
        }
    }

    pub fn set_bool(&self, key: impl Into<String>, value: bool) {
        self.set_string(key, value.to_string());
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
    }
}

impl Preferences for MemoryPreferences {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_preferences() {
        let prefs = MemoryPreferences::new();
        let key = mediator_pref_key("Python3");
        assert_eq!(key, "codeintel.mediator.Python3");

        assert_eq!(prefs.get_string(&key), None);
        prefs.set_string(&key, "codeintel/service/mediator/legacy");
        assert_eq!(
            prefs.get_string(&key).as_deref(),
            Some("codeintel/service/mediator/legacy")
        );
        prefs.remove(&key);
        assert_eq!(prefs.get_string(&key), None);
    }

    #[test]
    fn test_feature_enabled_by_default() {
        let prefs = MemoryPreferences::new();
        let key = feature_pref_key(Feature::Gotodef);
        assert_eq!(key, "codeintel.gotodef.enabled");
        assert!(is_feature_enabled(&prefs, Feature::Gotodef));

        prefs.set_bool(&key, false);
        assert!(!is_feature_enabled(&prefs, Feature::Gotodef));
        assert!(is_feature_enabled(&prefs, Feature::Jumpsections));

        prefs.set_string(&key, "maybe");
        assert_eq!(prefs.get_bool(&key), None);
        assert!(is_feature_enabled(&prefs, Feature::Gotodef));
    }
}
