//! Shared constants
//!
//! Values the host application sees through the C boundary live here so the
//! core and the SDK cannot drift apart.

/// Management server constants
pub mod server {
    /// Port the host application uses to reach the USM management server.
    pub const DEFAULT_PORT: u16 = 8767;
}

/// Process supervision defaults
pub mod supervision {
    /// Time a service gets to exit after SIGTERM before it is killed.
    pub const GRACE_TIMEOUT_MS: u64 = 5_000;

    /// Interval between two background resource samples.
    pub const SAMPLE_INTERVAL_MS: u64 = 2_000;

    /// How far past `default_port` to search when a template has no range.
    pub const PORT_SEARCH_SPAN: u16 = 100;

    /// Health check timeout advertised when a template does not set one.
    pub const HEALTH_TIMEOUT_MS: u32 = 5_000;
}

/// Configuration file locations
pub mod config {
    /// Directory under `$HOME` holding the default configuration.
    pub const HOME_DIR: &str = ".usm";

    /// Default configuration file name inside [`HOME_DIR`].
    pub const FILE_NAME: &str = "services.yaml";

    /// Environment variable overriding the default configuration path.
    pub const ENV_VAR: &str = "USM_CONFIG";
}
