//! Relay configuration.

use std::collections::HashSet;
use uuid::Uuid;

use crate::ble::characteristics::CharacteristicSubscription;
use crate::ble::connection::ReconnectPolicy;
use crate::ble::platform::ConnectionPriority;
use crate::ble::scanner::ScanMode;
use crate::ble::uuids::DEFAULT_TARGET_SERVICES;
use crate::error::{Error, Result};

/// Everything tunable about the relay.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RelayConfig {
    /// Services a peripheral must advertise to be picked up.
    pub target_services: Vec<Uuid>,
    /// Stop at the first match or keep scanning.
    pub scan_mode: ScanMode,
    /// Retry behaviour after an established link drops.
    pub reconnect: ReconnectPolicy,
    /// MTU requested after connecting.
    pub preferred_mtu: u16,
    /// Connection priority requested after connecting.
    pub connection_priority: ConnectionPriority,
    /// Characteristics to subscribe to and how to decode them.
    ///
    /// Notifications are matched by characteristic UUID alone, so each
    /// characteristic may appear only once.
    pub subscriptions: Vec<CharacteristicSubscription>,
    /// Log the Device Information manufacturer name on connect.
    pub read_device_info: bool,
}

impl RelayConfig {
    /// Default MTU request.
    pub const DEFAULT_MTU: u16 = 185;

    /// Smallest MTU allowed by the ATT protocol.
    pub const MIN_MTU: u16 = 23;

    /// Largest MTU allowed by the ATT protocol.
    pub const MAX_MTU: u16 = 517;

    /// Replace the target services.
    pub fn with_target_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.target_services = services.into_iter().collect();
        self
    }

    /// Set the scan mode.
    pub fn with_scan_mode(mut self, mode: ScanMode) -> Self {
        self.scan_mode = mode;
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the MTU request.
    pub fn with_preferred_mtu(mut self, mtu: u16) -> Self {
        self.preferred_mtu = mtu;
        self
    }

    /// Replace the subscription table.
    pub fn with_subscriptions(
        mut self,
        subscriptions: impl IntoIterator<Item = CharacteristicSubscription>,
    ) -> Self {
        self.subscriptions = subscriptions.into_iter().collect();
        self
    }

    /// Check the configuration for values the relay cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.target_services.is_empty() {
            return Err(Error::InvalidParameter {
                name: "target_services".to_string(),
                value: "[]".to_string(),
            });
        }

        if self.subscriptions.is_empty() {
            return Err(Error::InvalidParameter {
                name: "subscriptions".to_string(),
                value: "[]".to_string(),
            });
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = self
            .subscriptions
            .iter()
            .find(|s| !seen.insert(s.characteristic))
        {
            return Err(Error::InvalidParameter {
                name: "subscriptions".to_string(),
                value: duplicate.characteristic.to_string(),
            });
        }

        if !(Self::MIN_MTU..=Self::MAX_MTU).contains(&self.preferred_mtu) {
            return Err(Error::InvalidParameter {
                name: "preferred_mtu".to_string(),
                value: self.preferred_mtu.to_string(),
            });
        }

        if let ScanMode::Continuous {
            max_peripherals: Some(0),
        } = self.scan_mode
        {
            return Err(Error::InvalidParameter {
                name: "scan_mode.max_peripherals".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            target_services: DEFAULT_TARGET_SERVICES.to_vec(),
            scan_mode: ScanMode::default(),
            reconnect: ReconnectPolicy::default(),
            preferred_mtu: Self::DEFAULT_MTU,
            connection_priority: ConnectionPriority::High,
            subscriptions: CharacteristicSubscription::default_table(),
            read_device_info: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{
        ENVIRONMENTAL_SENSING_SERVICE_UUID, HEALTH_THERMOMETER_SERVICE_UUID, TEMPERATURE_UUID,
    };
    use crate::data::measurement::{Encoding, MeasurementKind};
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.preferred_mtu, 185);
        assert_eq!(config.scan_mode, ScanMode::SingleTarget);
        assert_eq!(config.reconnect.delay, Duration::from_secs(15));
        assert_eq!(config.reconnect.max_attempts, None);
        assert!(config
            .target_services
            .contains(&ENVIRONMENTAL_SENSING_SERVICE_UUID));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_targets() {
        let config = RelayConfig::default().with_target_services(Vec::<Uuid>::new());
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidParameter { name, .. }) if name == "target_services"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_subscriptions_and_bad_mtu() {
        assert!(RelayConfig::default()
            .with_subscriptions(Vec::new())
            .validate()
            .is_err());
        assert!(RelayConfig::default()
            .with_preferred_mtu(10)
            .validate()
            .is_err());
        assert!(RelayConfig::default()
            .with_scan_mode(ScanMode::Continuous {
                max_peripherals: Some(0)
            })
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_characteristic() {
        let config = RelayConfig::default().with_subscriptions([
            CharacteristicSubscription::TEMPERATURE,
            CharacteristicSubscription::new(
                HEALTH_THERMOMETER_SERVICE_UUID,
                TEMPERATURE_UUID,
                Encoding::Hundredths,
                MeasurementKind::Temperature,
            ),
        ]);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidParameter { name, value })
                if name == "subscriptions" && value == TEMPERATURE_UUID.to_string()
        ));
    }
}
