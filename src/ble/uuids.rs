//! BLE Service and Characteristic UUIDs.
//!
//! Well-known GATT identifiers for the environmental and health services the
//! relay understands, plus a name registry so identifiers can be resolved
//! from configuration data.

use uuid::Uuid;

/// Build a 128-bit UUID from a 16-bit assigned number on the Bluetooth base UUID.
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

// Environmental Sensing Service (ESS)
/// Environmental Sensing Service UUID.
pub const ENVIRONMENTAL_SENSING_SERVICE_UUID: Uuid = from_short(0x181a);
/// Temperature characteristic UUID (0.01 °C).
pub const TEMPERATURE_UUID: Uuid = from_short(0x2a6e);
/// Humidity characteristic UUID (0.01 %).
pub const HUMIDITY_UUID: Uuid = from_short(0x2a6f);
/// Pressure characteristic UUID.
pub const PRESSURE_UUID: Uuid = from_short(0x2a6d);

// Device Information Service (DIS)
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = from_short(0x180a);
/// Manufacturer Name characteristic UUID.
pub const MANUFACTURER_NAME_UUID: Uuid = from_short(0x2a29);
/// Model Number characteristic UUID.
pub const MODEL_NUMBER_UUID: Uuid = from_short(0x2a24);

// Battery Service (BAS)
/// Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = from_short(0x180f);
/// Battery Level characteristic UUID.
pub const BATTERY_LEVEL_UUID: Uuid = from_short(0x2a19);

// Current Time Service (CTS)
/// Current Time Service UUID.
pub const CURRENT_TIME_SERVICE_UUID: Uuid = from_short(0x1805);
/// Current Time characteristic UUID.
pub const CURRENT_TIME_UUID: Uuid = from_short(0x2a2b);

// Heart Rate Service (HRS)
/// Heart Rate Service UUID.
pub const HEART_RATE_SERVICE_UUID: Uuid = from_short(0x180d);
/// Heart Rate Measurement characteristic UUID.
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = from_short(0x2a37);

// Blood Pressure Service (BLP)
/// Blood Pressure Service UUID.
pub const BLOOD_PRESSURE_SERVICE_UUID: Uuid = from_short(0x1810);
/// Blood Pressure Measurement characteristic UUID.
pub const BLOOD_PRESSURE_MEASUREMENT_UUID: Uuid = from_short(0x2a35);

// Health Thermometer Service (HTS)
/// Health Thermometer Service UUID.
pub const HEALTH_THERMOMETER_SERVICE_UUID: Uuid = from_short(0x1809);
/// Temperature Measurement characteristic UUID.
pub const TEMPERATURE_MEASUREMENT_UUID: Uuid = from_short(0x2a1c);

// Pulse Oximeter Service (PLX)
/// Pulse Oximeter Service UUID.
pub const PULSE_OXIMETER_SERVICE_UUID: Uuid = from_short(0x1822);
/// PLX Spot-Check Measurement characteristic UUID.
pub const PLX_SPOT_MEASUREMENT_UUID: Uuid = from_short(0x2a5e);
/// PLX Continuous Measurement characteristic UUID.
pub const PLX_CONTINUOUS_MEASUREMENT_UUID: Uuid = from_short(0x2a5f);

// Weight Scale Service (WSS)
/// Weight Scale Service UUID.
pub const WEIGHT_SCALE_SERVICE_UUID: Uuid = from_short(0x181d);
/// Weight Measurement characteristic UUID.
pub const WEIGHT_MEASUREMENT_UUID: Uuid = from_short(0x2a9d);

// Glucose Service
/// Glucose Service UUID.
pub const GLUCOSE_SERVICE_UUID: Uuid = from_short(0x1808);
/// Glucose Measurement characteristic UUID.
pub const GLUCOSE_MEASUREMENT_UUID: Uuid = from_short(0x2a18);
/// Record Access Control Point characteristic UUID.
pub const GLUCOSE_RECORD_ACCESS_POINT_UUID: Uuid = from_short(0x2a52);
/// Glucose Measurement Context characteristic UUID.
pub const GLUCOSE_MEASUREMENT_CONTEXT_UUID: Uuid = from_short(0x2a34);

// Contour glucose meters (vendor specific)
/// Contour vendor service UUID.
pub const CONTOUR_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0002_11e2_9e96_0800200c9a66);
/// Contour clock characteristic UUID.
pub const CONTOUR_CLOCK_UUID: Uuid = Uuid::from_u128(0x0000_1026_0002_11e2_9e96_0800200c9a66);

/// Registry of well-known services, keyed by human readable name.
pub const SERVICES: &[(&str, Uuid)] = &[
    ("Environmental Sensing Service", ENVIRONMENTAL_SENSING_SERVICE_UUID),
    ("Device Information Service", DEVICE_INFO_SERVICE_UUID),
    ("Battery Service", BATTERY_SERVICE_UUID),
    ("Current Time Service", CURRENT_TIME_SERVICE_UUID),
    ("Heart Rate Service", HEART_RATE_SERVICE_UUID),
    ("Blood Pressure Service", BLOOD_PRESSURE_SERVICE_UUID),
    ("Health Thermometer Service", HEALTH_THERMOMETER_SERVICE_UUID),
    ("Pulse Oximeter Service", PULSE_OXIMETER_SERVICE_UUID),
    ("Weight Scale Service", WEIGHT_SCALE_SERVICE_UUID),
    ("Glucose Service", GLUCOSE_SERVICE_UUID),
    ("Contour Glucose Service", CONTOUR_SERVICE_UUID),
];

/// Registry of well-known characteristics, keyed by human readable name.
pub const CHARACTERISTICS: &[(&str, Uuid)] = &[
    ("Temperature", TEMPERATURE_UUID),
    ("Humidity", HUMIDITY_UUID),
    ("Pressure", PRESSURE_UUID),
    ("Manufacturer Name", MANUFACTURER_NAME_UUID),
    ("Model Number", MODEL_NUMBER_UUID),
    ("Battery Level", BATTERY_LEVEL_UUID),
    ("Current Time", CURRENT_TIME_UUID),
    ("Heart Rate Measurement", HEART_RATE_MEASUREMENT_UUID),
    ("Blood Pressure Measurement", BLOOD_PRESSURE_MEASUREMENT_UUID),
    ("Temperature Measurement", TEMPERATURE_MEASUREMENT_UUID),
    ("PLX Spot-Check Measurement", PLX_SPOT_MEASUREMENT_UUID),
    ("PLX Continuous Measurement", PLX_CONTINUOUS_MEASUREMENT_UUID),
    ("Weight Measurement", WEIGHT_MEASUREMENT_UUID),
    ("Glucose Measurement", GLUCOSE_MEASUREMENT_UUID),
    ("Record Access Control Point", GLUCOSE_RECORD_ACCESS_POINT_UUID),
    ("Glucose Measurement Context", GLUCOSE_MEASUREMENT_CONTEXT_UUID),
    ("Contour Clock", CONTOUR_CLOCK_UUID),
];

/// Services scanned for by default: environmental sensors plus the health
/// devices the relay knows how to talk to.
pub const DEFAULT_TARGET_SERVICES: &[Uuid] = &[
    ENVIRONMENTAL_SENSING_SERVICE_UUID,
    BLOOD_PRESSURE_SERVICE_UUID,
    HEALTH_THERMOMETER_SERVICE_UUID,
    HEART_RATE_SERVICE_UUID,
    PULSE_OXIMETER_SERVICE_UUID,
    WEIGHT_SCALE_SERVICE_UUID,
    GLUCOSE_SERVICE_UUID,
];

/// Look up a service UUID by name (case-insensitive).
pub fn service_by_name(name: &str) -> Option<Uuid> {
    find_by_name(SERVICES, name)
}

/// Look up a characteristic UUID by name (case-insensitive).
pub fn characteristic_by_name(name: &str) -> Option<Uuid> {
    find_by_name(CHARACTERISTICS, name)
}

/// Get the registered name for a service or characteristic UUID.
pub fn name_of(uuid: &Uuid) -> Option<&'static str> {
    SERVICES
        .iter()
        .chain(CHARACTERISTICS.iter())
        .find(|(_, u)| u == uuid)
        .map(|(name, _)| *name)
}

fn find_by_name(table: &[(&str, Uuid)], name: &str) -> Option<Uuid> {
    table
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, uuid)| *uuid)
}
