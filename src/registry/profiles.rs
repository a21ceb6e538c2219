use super::{FieldKind, FieldSpec};

/// DSMR-reader MQTT split-topic fields. Electricity readings arrive under
/// `dsmr/reading/`, gas under `dsmr/consumption/gas/`.
pub static DSMR_READER_FIELDS: &[FieldSpec] = &[
    FieldSpec::float("electricity_delivered_1"),
    FieldSpec::float("electricity_delivered_2"),
    FieldSpec::float("electricity_returned_1"),
    FieldSpec::float("electricity_returned_2"),
    FieldSpec::float("electricity_currently_delivered"),
    FieldSpec::float("electricity_currently_returned"),
    FieldSpec::float("phase_currently_delivered_l1"),
    FieldSpec::float("phase_currently_delivered_l2"),
    FieldSpec::float("phase_currently_delivered_l3"),
    FieldSpec::float("phase_voltage_l1"),
    FieldSpec::float("phase_voltage_l2"),
    FieldSpec::float("phase_voltage_l3"),
    FieldSpec::float("delivered"),
];

/// DSMR-logger firmware fields. Identity strings (MAC address, firmware
/// versions, equipment ids) are not recorded.
pub static DSMR_LOGGER_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("startup_time", "startup_time", FieldKind::Timestamp),
    FieldSpec::new(
        "firmware_update_available",
        "firmware_update_available",
        FieldKind::Boolean,
    ),
    FieldSpec::new("wifi_rssi", "wifi_rssi", FieldKind::Integer),
    FieldSpec::new("mqtt_configured", "mqtt_configured", FieldKind::Boolean),
    FieldSpec::new("ElectricityTariff", "electricity_tariff", FieldKind::Float),
    FieldSpec::new(
        "EnergyDeliveredTariff1",
        "energy_delivered_tariff1",
        FieldKind::Float,
    ),
    FieldSpec::new(
        "EnergyDeliveredTariff2",
        "energy_delivered_tariff2",
        FieldKind::Float,
    ),
    FieldSpec::new(
        "EnergyReturnedTariff1",
        "energy_returned_tariff1",
        FieldKind::Float,
    ),
    FieldSpec::new(
        "EnergyReturnedTariff2",
        "energy_returned_tariff2",
        FieldKind::Float,
    ),
    FieldSpec::new(
        "ReactiveEnergyDeliveredTariff1",
        "reactive_energy_delivered_tariff1",
        FieldKind::Float,
    ),
    FieldSpec::new(
        "ReactiveEnergyDeliveredTariff2",
        "reactive_energy_delivered_tariff2",
        FieldKind::Float,
    ),
    FieldSpec::new(
        "ReactiveEnergyReturnedTariff1",
        "reactive_energy_returned_tariff1",
        FieldKind::Float,
    ),
    FieldSpec::new(
        "ReactiveEnergyReturnedTariff2",
        "reactive_energy_returned_tariff2",
        FieldKind::Float,
    ),
    FieldSpec::new(
        "PowerDelivered_total",
        "power_delivered_total",
        FieldKind::Float,
    ),
    FieldSpec::new("PowerReturned_total", "power_returned_total", FieldKind::Float),
    FieldSpec::new("PowerDelivered_l1", "power_delivered_l1", FieldKind::Float),
    FieldSpec::new("PowerDelivered_l2", "power_delivered_l2", FieldKind::Float),
    FieldSpec::new("PowerDelivered_l3", "power_delivered_l3", FieldKind::Float),
    FieldSpec::new("PowerReturned_l1", "power_returned_l1", FieldKind::Float),
    FieldSpec::new("PowerReturned_l2", "power_returned_l2", FieldKind::Float),
    FieldSpec::new("PowerReturned_l3", "power_returned_l3", FieldKind::Float),
    FieldSpec::new("Voltage_l1", "voltage_l1", FieldKind::Float),
    FieldSpec::new("Voltage_l2", "voltage_l2", FieldKind::Float),
    FieldSpec::new("Voltage_l3", "voltage_l3", FieldKind::Float),
    FieldSpec::new("Current_l1", "current_l1", FieldKind::Float),
    FieldSpec::new("Current_l2", "current_l2", FieldKind::Float),
    FieldSpec::new("Current_l3", "current_l3", FieldKind::Float),
    FieldSpec::new("GasDelivered", "gas_delivered", FieldKind::Float),
    FieldSpec::new("GasDeliveredHour", "gas_delivered_hour", FieldKind::Float),
    FieldSpec::new("PowerDeliveredHour", "power_delivered_hour", FieldKind::Float),
    FieldSpec::new(
        "PowerDeliveredNetto",
        "power_delivered_netto",
        FieldKind::Float,
    ),
];
