//! GATT identifiers for the demo peripheral
//!
//! The peripheral exposes a single primary service `ec00` holding a single
//! read/write/notify characteristic, also `ec00`.

use anyhow::Result;
use uuid::Uuid;

/// Bluetooth Base UUID (`00000000-0000-1000-8000-00805F9B34FB`)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Short form of the demo service UUID, as written in settings
pub const SERVICE_UUID_SHORT: &str = "ec00";

/// Short form of the demo characteristic UUID
pub const CHARACTERISTIC_UUID_SHORT: &str = "ec00";

pub const SERVICE_UUID: Uuid = uuid_from_u16(0xec00);
pub const CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0xec00);

/// Expand a 16-bit assigned number against the base UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expand a 32-bit assigned number against the base UUID
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Parse a UUID string
///
/// Accepts 16-bit (`ec00`) and 32-bit short forms as well as the full
/// 128-bit form with or without hyphens.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    let compact = uuid_str.trim().replace('-', "");

    match compact.len() {
        4 => Ok(uuid_from_u16(u16::from_str_radix(&compact, 16)?)),
        8 => Ok(uuid_from_u32(u32::from_str_radix(&compact, 16)?)),
        32 => Ok(Uuid::from_u128(u128::from_str_radix(&compact, 16)?)),
        _ => Err(anyhow::anyhow!("Invalid UUID format: {}", uuid_str)),
    }
}
