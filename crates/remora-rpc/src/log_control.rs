//! Runtime log level control for `ro_setLogLevel`.

/// Adjusts the process log filter at runtime.
///
/// Installed on a [`Server`](crate::Server) so remote operators can raise or
/// lower verbosity without a restart.
pub trait LogControl: Send + Sync {
    /// Apply a new filter directive such as `"debug"` or `"remora_rpc=trace"`.
    fn set_level(&self, level: &str) -> Result<(), String>;

    /// The currently active directive, if known.
    fn current_level(&self) -> Option<String> {
        None
    }
}
