//! Tracing setup and the runtime debug switch.
//!
//! The level filter sits behind a `reload` layer so the control surface
//! can raise verbosity to `debug` and back without a restart.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

use crate::config::LoggingConfig;

type ApplyFn = Box<dyn Fn(bool) + Send + Sync>;

/// Diagnostic verbosity toggle. Never touches consensus state.
pub struct DebugSwitch {
    enabled: AtomicBool,
    apply: Option<ApplyFn>,
}

impl DebugSwitch {
    /// A switch that only records its state. Used when no subscriber is
    /// installed, e.g. in tests.
    pub fn detached(initial: bool) -> Self {
        Self {
            enabled: AtomicBool::new(initial),
            apply: None,
        }
    }

    fn with_reload(initial: bool, apply: ApplyFn) -> Self {
        Self {
            enabled: AtomicBool::new(initial),
            apply: Some(apply),
        }
    }

    pub fn set(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            if let Some(apply) = &self.apply {
                apply(enabled);
            }
            tracing::info!(enabled, "debug logging toggled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level
/// at startup; toggling debug afterwards replaces the filter.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<DebugSwitch> {
    let base_level = config.level.clone();
    let initial = if config.debug {
        "debug".to_string()
    } else {
        base_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&initial));
    let (filter, handle) = reload::Layer::new(filter);

    let json = config.format == "json";
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .try_init()?;

    let apply: ApplyFn = Box::new(move |enabled| {
        let level = if enabled { "debug" } else { base_level.as_str() };
        if let Err(e) = handle.reload(EnvFilter::new(level)) {
            tracing::warn!(error = %e, "failed to reload log filter");
        }
    });
    Ok(DebugSwitch::with_reload(config.debug, apply))
}
