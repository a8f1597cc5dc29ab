use std::path::PathBuf;

/// Resolve the Outrider home directory.
///
/// Priority:
/// 1) OUTRIDER_HOME
/// 2) HOME/USERPROFILE
/// 3) ./.outrider
pub fn outrider_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("OUTRIDER_HOME") {
        return PathBuf::from(override_path);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".outrider");
    }
    PathBuf::from(".").join(".outrider")
}

/// Default cache directory: ~/.outrider/cache
pub fn default_cache_dir() -> PathBuf {
    outrider_home().join("cache")
}

/// Default configuration directory: ~/.outrider/etc
pub fn default_config_dir() -> PathBuf {
    outrider_home().join("etc")
}

/// Persisted schedule fragment: `<configdir>/minion.d/_schedule.conf`
pub fn schedule_fragment(configdir: &std::path::Path) -> PathBuf {
    configdir.join("minion.d").join("_schedule.conf")
}
