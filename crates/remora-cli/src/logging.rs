//! Logging initialization and runtime level control.

use anyhow::{Context, Result};
use remora_rpc::LogControl;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

/// Reload handle for the global filter, exposed to `ro_setLogLevel`.
pub struct ReloadableFilter {
    handle: reload::Handle<EnvFilter, Registry>,
    current: Mutex<String>,
}

impl LogControl for ReloadableFilter {
    fn set_level(&self, level: &str) -> Result<(), String> {
        let filter = EnvFilter::try_new(level).map_err(|e| e.to_string())?;
        self.handle.reload(filter).map_err(|e| e.to_string())?;
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = level.to_string();
        tracing::info!("Log level set to '{}'", level);
        Ok(())
    }

    fn current_level(&self) -> Option<String> {
        Some(self.current.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `--log-level`, which wins over the config file.
pub fn init(flag: Option<&str>, configured: &str) -> Result<Arc<ReloadableFilter>> {
    let directive = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| flag.map(str::to_string))
        .unwrap_or_else(|| configured.to_string());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))?;
    let (filter, handle) = reload::Layer::new(filter);

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Logging already initialized")?;

    Ok(Arc::new(ReloadableFilter {
        handle,
        current: Mutex::new(directive),
    }))
}
