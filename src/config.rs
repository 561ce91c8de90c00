//! Workspace configuration store
//!
//! Backs `workspace/configuration` requests: a global settings object plus
//! scope-specific overlays keyed by URI prefix. Lookups deep-merge global
//! settings with every overlay whose scope prefixes the requested URI,
//! applied in order of increasing prefix length.

use serde_json::{Map, Value};
use tracing::warn;

/// Merge `patch` into `base` recursively; non-object values replace.
pub fn deep_merge(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, patch_value) in patch {
        match (base.get_mut(key), patch_value) {
            (Some(Value::Object(base_obj)), Value::Object(patch_obj)) => {
                deep_merge(base_obj, patch_obj);
            }
            _ => {
                base.insert(key.clone(), patch_value.clone());
            }
        }
    }
}

/// Global + scoped configuration sections
#[derive(Debug, Clone, Default)]
pub struct ConfigurationMap {
    global: Map<String, Value>,
    scoped: Vec<(String, Map<String, Value>)>,
}

impl ConfigurationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge settings into the global section. Non-object payloads are
    /// ignored with a warning; LSP settings are always objects.
    pub fn update_global(&mut self, settings: Value) {
        match settings {
            Value::Object(patch) => deep_merge(&mut self.global, &patch),
            other => warn!("Ignoring non-object configuration payload: {other}"),
        }
    }

    /// Merge settings into the overlay for a URI scope prefix
    pub fn update_scoped<S: Into<String>>(&mut self, scope_uri: S, settings: Value) {
        let Value::Object(patch) = settings else {
            warn!("Ignoring non-object scoped configuration payload");
            return;
        };
        let scope_uri = scope_uri.into();
        if let Some((_, existing)) = self.scoped.iter_mut().find(|(s, _)| *s == scope_uri) {
            deep_merge(existing, &patch);
        } else {
            self.scoped.push((scope_uri, patch));
        }
    }

    /// Resolve the settings visible at `scope_uri`, narrowed to `section`.
    ///
    /// `section` is a dotted path into the merged object; a missing section
    /// resolves to null, which is what `workspace/configuration` expects
    /// for unknown items.
    pub fn resolve(&self, scope_uri: Option<&str>, section: Option<&str>) -> Value {
        let mut merged = self.global.clone();

        if let Some(uri) = scope_uri {
            let mut applicable: Vec<&(String, Map<String, Value>)> = self
                .scoped
                .iter()
                .filter(|(scope, _)| uri.starts_with(scope.as_str()))
                .collect();
            applicable.sort_by_key(|(scope, _)| scope.len());
            for (_, overlay) in applicable {
                deep_merge(&mut merged, overlay);
            }
        }

        let mut current = Value::Object(merged);
        let Some(section) = section else {
            return current;
        };

        for part in section.split('.') {
            match current {
                Value::Object(mut obj) => match obj.remove(part) {
                    Some(next) => current = next,
                    None => return Value::Null,
                },
                _ => return Value::Null,
            }
        }
        current
    }
}
