/// Mapping from file extension to plugin, in registration order. Selection
/// takes the first registered plugin claiming the extension; ambiguous or
/// unknown extensions can fall back to content sniffing (the supervisor
/// drives that, since it owns the live clients).
#[derive(Debug, Default)]
pub struct PluginRegistry {
    entries: Vec<RegistryEntry>,
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    plugin: String,
    extensions: Vec<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin's claimed extensions (lowercased, dots stripped).
    /// Re-registering a plugin replaces its previous claims.
    pub fn register(&mut self, plugin: &str, extensions: &[String]) {
        self.unregister(plugin);
        self.entries.push(RegistryEntry {
            plugin: plugin.to_string(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        });
    }

    pub fn unregister(&mut self, plugin: &str) {
        self.entries.retain(|e| e.plugin != plugin);
    }

    /// First plugin claiming the path's extension.
    pub fn select(&self, path: &str) -> Option<&str> {
        let extension = extension_of(path)?;
        self.entries
            .iter()
            .find(|e| e.extensions.iter().any(|claimed| claimed == &extension))
            .map(|e| e.plugin.as_str())
    }

    /// Every registered plugin, in registration order. Sniff fallback walks
    /// these when no extension matches.
    pub fn plugins(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.plugin.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn extension_of(path: &str) -> Option<String> {
    std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}
