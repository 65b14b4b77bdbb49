use std::collections::HashMap;

use tracing::debug;

/// Well-known mDNS service type for the transfer protocol.
pub const SERVICE_TYPE: &str = "_warpinator._tcp.local.";
/// Discovery domain.
pub const SERVICE_DOMAIN: &str = "local";
/// Default port for both the transfer and registration endpoints.
pub const DEFAULT_PORT: u16 = 42000;
/// Protocol version advertised when none is present in a record.
pub const DEFAULT_API_VERSION: &str = "1";

// TXT record keys carried in a service advertisement.
pub const TXT_HOSTNAME: &str = "hostname";
pub const TXT_API_VERSION: &str = "api-version";
pub const TXT_AUTH_PORT: &str = "auth-port";
pub const TXT_TYPE: &str = "type";

/// `type` value marking a transient re-announcement that must be ignored.
pub const TYPE_FLUSH: &str = "flush";
/// `type` value marking a durable record.
pub const TYPE_REAL: &str = "real";

/// Metadata parsed out of a discovery result's TXT record.
///
/// Parsing never fails: absent or malformed entries fall back to the
/// protocol defaults, unknown keys are logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub hostname: String,
    pub api_version: String,
    pub registration_port: u16,
}

impl RecordMetadata {
    /// Parses TXT key/value pairs for the service advertised as `name`.
    ///
    /// The advertised name doubles as the hostname default, matching the
    /// behaviour of peers that omit the `hostname` entry.
    #[must_use]
    pub fn parse(name: &str, txt: &HashMap<String, String>) -> Self {
        let mut meta = Self {
            hostname: name.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            registration_port: DEFAULT_PORT,
        };

        for (key, value) in txt {
            match key.as_str() {
                TXT_HOSTNAME => meta.hostname = value.clone(),
                TXT_API_VERSION => meta.api_version = value.clone(),
                TXT_AUTH_PORT => {
                    // Parse failure falls back to the default, never
                    // fails the event.
                    meta.registration_port = value.parse().unwrap_or(DEFAULT_PORT);
                }
                TXT_TYPE => {}
                other => {
                    debug!(key = other, value = %value, "Ignoring unknown TXT record entry");
                }
            }
        }

        meta
    }
}

/// Whether a TXT record marks the result as a flush re-announcement.
///
/// Flush records are emitted while a registration churns; treating them
/// as genuine add/remove events would duplicate or drop peers.
#[must_use]
pub fn is_flush_record(txt: &HashMap<String, String>) -> bool {
    txt.get(TXT_TYPE).is_some_and(|t| t == TYPE_FLUSH)
}
