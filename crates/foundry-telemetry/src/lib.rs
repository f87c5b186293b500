use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "foundry_client" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::WARN,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

/// Handle to the installed subscriber.
pub struct TelemetryGuard {
    base_level: Level,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };

        if let Some(handle) = &self.reload {
            if let Err(e) = handle.reload(EnvFilter::new(&directives)) {
                tracing::warn!(error = %e, "failed to reload log filter");
            }
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Initialize logging to stderr. Call once at startup; stdout belongs to
/// the workflow transcript.
///
/// A second call leaves the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        base_level: config.log_level,
        level_filter: Arc::new(RwLock::new(config.module_levels)),
        reload: installed.then_some(handle),
    }
}

/// Parse a level name, case-insensitive. Unknown names yield `None`.
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}

/// Build an `EnvFilter` directive string: `"warn,foundry_client=debug"`.
fn filter_directives(base: Level, modules: &[(String, Level)]) -> String {
    let mut out = base.to_string().to_lowercase();
    for (module, level) in modules {
        out.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_base_only() {
        assert_eq!(filter_directives(Level::WARN, &[]), "warn");
    }

    #[test]
    fn directives_with_modules() {
        let modules = vec![
            ("foundry_client".to_string(), Level::DEBUG),
            ("reqwest".to_string(), Level::ERROR),
        ];
        assert_eq!(
            filter_directives(Level::INFO, &modules),
            "info,foundry_client=debug,reqwest=error"
        );
    }

    #[test]
    fn parse_level_names() {
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level(" warn "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn guard_tracks_module_levels() {
        let guard = TelemetryGuard {
            base_level: Level::WARN,
            level_filter: Arc::new(RwLock::new(Vec::new())),
            reload: None,
        };
        guard.set_module_level("foundry_client", Level::DEBUG);
        guard.set_module_level("foundry_client", Level::TRACE);
        guard.set_module_level("foundry_store", Level::INFO);
        assert_eq!(
            guard.module_levels(),
            vec![
                ("foundry_client".to_string(), Level::TRACE),
                ("foundry_store".to_string(), Level::INFO),
            ]
        );
    }
}
