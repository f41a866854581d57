//! Built-in register map for Deye/Sunsynk single-phase hybrid inverters.
use crate::prelude::*;
use crate::register::{Catalog, RegisterSet, RegisterSpec, ValueKind, WordOrder};
use crate::solarman::modbus::ReadFunction;

pub const DAILY_PV_ENERGY: &str = "Daily PV Energy";
pub const TOTAL_PV_ENERGY: &str = "Total PV Energy";
pub const TOTAL_BATTERY_DISCHARGE: &str = "Total Battery Discharge Energy";

pub const DEVICE_TYPE: &str = "Device Type";
pub const FIRMWARE: [&str; 3] = ["Firmware Major", "Firmware Minor", "Firmware Patch"];

/// The catalog file when one is configured, the built-in map otherwise.
pub fn load(file: Option<String>) -> Result<Catalog> {
    match file {
        Some(file) => {
            info!("Loading register catalog from {}", file);
            Catalog::from_file(&file)
        }
        None => Ok(deye_hybrid()),
    }
}

fn reg(name: &str, address: u16, kind: ValueKind) -> RegisterSpec {
    RegisterSpec::new(name, address, kind)
}

// 32-bit counters keep the low word at the lower address
fn total(name: &str, address: u16) -> RegisterSpec {
    reg(name, address, ValueKind::scaled(10)).double(WordOrder::LowFirst)
}

pub fn deye_hybrid() -> Catalog {
    Catalog {
        sets: vec![polling(), device_info(), configuration()],
    }
}

fn polling() -> RegisterSet {
    use ValueKind::{Signed, Unsigned};

    let registers = vec![
        // pv
        reg("PV1 Voltage", 109, ValueKind::scaled(10)),
        reg("PV1 Current", 110, ValueKind::scaled(10)),
        reg("PV1 Power", 186, Unsigned),
        reg("PV2 Voltage", 111, ValueKind::scaled(10)),
        reg("PV2 Current", 112, ValueKind::scaled(10)),
        reg("PV2 Power", 187, Unsigned),
        // battery
        reg("Battery SOC", 184, Unsigned),
        reg("Battery Voltage", 183, ValueKind::scaled(100)),
        reg("Battery Current", 190, ValueKind::scaled_signed(100)),
        reg("Battery Power", 191, Signed),
        reg(
            "Battery Temperature",
            182,
            ValueKind::Scaled {
                divisor: 10,
                signed: false,
                offset: -1000,
            },
        ),
        // grid
        reg("Grid Voltage", 150, ValueKind::scaled(10)),
        reg("Grid Current", 160, ValueKind::scaled_signed(100)),
        reg("Grid Power", 169, Signed),
        reg("Grid Frequency", 79, ValueKind::scaled(100)),
        reg("Grid CT Power", 172, Signed),
        // load
        reg("Load Power", 178, Unsigned),
        reg("Load Frequency", 192, ValueKind::scaled(100)),
        // inverter
        reg("Inverter Power", 175, Signed),
        reg("Inverter Voltage", 154, ValueKind::scaled(10)),
        reg("Inverter Current", 164, ValueKind::scaled(100)),
        reg("Inverter Frequency", 193, ValueKind::scaled(100)),
        // temperatures
        reg("DC Transformer Temperature", 90, ValueKind::scaled_signed(10)),
        reg("Radiator Temperature", 91, ValueKind::scaled_signed(10)),
        reg("Ambient Temperature", 95, ValueKind::scaled_signed(10)),
        // daily energy
        reg(DAILY_PV_ENERGY, 108, ValueKind::scaled(10)),
        reg("Daily Battery Charge Energy", 70, ValueKind::scaled(10)),
        reg("Daily Battery Discharge Energy", 71, ValueKind::scaled(10)),
        reg("Daily Grid Import Energy", 76, ValueKind::scaled(10)),
        reg("Daily Grid Export Energy", 77, ValueKind::scaled(10)),
        reg("Daily Load Energy", 84, ValueKind::scaled(10)),
        // total energy
        total(TOTAL_PV_ENERGY, 96),
        total("Total Battery Charge Energy", 72),
        total(TOTAL_BATTERY_DISCHARGE, 74),
        total("Total Grid Import Energy", 78),
        total("Total Grid Export Energy", 81),
        total("Total Load Energy", 85),
        // status
        reg(
            "Running State",
            59,
            ValueKind::labels(&[
                (0, "Standby"),
                (1, "Self-check"),
                (2, "Normal"),
                (3, "Alarm"),
                (4, "Fault"),
            ]),
        ),
        reg(
            "Grid Connected Status",
            194,
            ValueKind::labels(&[(0, "Disconnected"), (1, "Connected")]),
        ),
        reg("Daily Active Energy", 60, ValueKind::scaled(10)),
    ];

    RegisterSet::new(Catalog::POLLING, ReadFunction::ReadHolding, registers)
}

fn device_info() -> RegisterSet {
    RegisterSet::new(
        Catalog::DEVICE_INFO,
        ReadFunction::ReadInput,
        vec![
            reg(
                DEVICE_TYPE,
                0,
                ValueKind::labels(&[
                    (2, "String Inverter"),
                    (3, "Single-phase Hybrid"),
                    (4, "Microinverter"),
                    (5, "LV Three-phase Hybrid"),
                    (6, "HV Three-phase Hybrid"),
                ]),
            ),
            reg(FIRMWARE[0], 13, ValueKind::Unsigned),
            reg(FIRMWARE[1], 14, ValueKind::Unsigned),
            reg(FIRMWARE[2], 15, ValueKind::Unsigned),
        ],
    )
}

fn configuration() -> RegisterSet {
    use ValueKind::Unsigned;

    RegisterSet::new(
        Catalog::CONFIGURATION,
        ReadFunction::ReadHolding,
        vec![
            reg("Battery type", 98, ValueKind::labels(&[(0, "Lead-acid"), (1, "Lithium")])),
            reg("Battery capacity", 102, Unsigned),
            reg("Max charge current", 108, Unsigned),
            reg("Max discharge current", 109, Unsigned),
            reg("Grid charge current limit", 128, Unsigned),
            reg(
                "Work mode",
                142,
                ValueKind::labels(&[
                    (0, "Selling first"),
                    (1, "Zero export to load"),
                    (2, "Zero export to CT"),
                ]),
            ),
            reg("Battery shutdown SOC", 217, Unsigned),
            reg("Battery restart SOC", 218, Unsigned),
            reg("Battery low SOC warning", 219, Unsigned),
        ],
    )
}
