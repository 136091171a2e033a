/// Read-only key-value lookup for deployment settings such as the default
/// model id. Provider credentials stay in the environment where the model
/// client reads them itself; this seam only covers keys the agent layer
/// consults directly.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Settings backed by process environment variables. Empty values count as
/// unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSettings;

impl SettingsStore for EnvSettings {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}
