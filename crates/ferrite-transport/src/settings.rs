use std::path::PathBuf;

/// Read-only connection configuration, owned by the caller and shared with
/// the transport for its lifetime.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Whether NLA runs after the TLS upgrade.
    pub authentication: bool,
    /// Certificate presented to clients on the accept path (PEM).
    pub cert_file: Option<PathBuf>,
    /// Private key matching `cert_file` (PEM).
    pub privatekey_file: Option<PathBuf>,
}
