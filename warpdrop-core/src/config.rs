use crate::record::DEFAULT_PORT;

/// Process-wide settings, read once at startup and passed explicitly to
/// every component that needs them.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Stable unique identity advertised as the service name.
    pub device_identity: String,
    /// Human-readable name carried in the TXT record.
    pub hostname: String,
    /// Port the transfer endpoint binds.
    pub transfer_port: u16,
    /// Port the registration endpoint binds.
    pub registration_port: u16,
    /// When set, stored credentials are deleted before the next server
    /// start, forcing regeneration.
    pub refresh_credentials: bool,
}

impl Settings {
    /// Settings for a device with the given identity, everything else at
    /// protocol defaults.
    #[must_use]
    pub fn for_identity(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            hostname: identity.clone(),
            device_identity: identity,
            transfer_port: DEFAULT_PORT,
            registration_port: DEFAULT_PORT,
            refresh_credentials: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_identity_when_building_settings_then_defaults_apply() {
        let settings = Settings::for_identity("dev-1");
        assert_eq!(settings.device_identity, "dev-1");
        assert_eq!(settings.hostname, "dev-1");
        assert_eq!(settings.transfer_port, DEFAULT_PORT);
        assert_eq!(settings.registration_port, DEFAULT_PORT);
        assert!(!settings.refresh_credentials);
    }
}
