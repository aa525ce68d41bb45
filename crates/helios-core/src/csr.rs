//! CSR address space constants (ISO/IEC 13213 + IEEE 1394) and
//! Configuration-ROM directory keys.

/// Base of the initial register space in the 48-bit node address space.
pub const CSR_BASE: u64 = 0xffff_f000_0000;
/// End of the initial register + ROM space handled locally.
pub const CSR_END: u64 = 0xffff_f000_0800;

/// Byte offsets inside the CSR core register block.
pub const CSR_STATE_CLEAR: u64 = 0x000;
pub const CSR_STATE_SET: u64 = 0x004;
pub const CSR_NODE_IDS: u64 = 0x008;
pub const CSR_RESET_START: u64 = 0x00c;
pub const CSR_SPLIT_TIMEOUT_HI: u64 = 0x018;
pub const CSR_SPLIT_TIMEOUT_LO: u64 = 0x01c;
pub const CSR_BUS_MANAGER_ID: u64 = 0x21c;
pub const CSR_BANDWIDTH_AVAILABLE: u64 = 0x220;
pub const CSR_CHANNELS_AVAILABLE_HI: u64 = 0x224;
pub const CSR_CHANNELS_AVAILABLE_LO: u64 = 0x228;

/// Configuration ROM window, in bytes from `CSR_BASE`.
pub const CONFIG_ROM_OFFSET: u64 = 0x400;
pub const CONFIG_ROM_END: u64 = 0x800;
/// ROM size in quadlets.
pub const CONFIG_ROM_QUADLETS: usize = 0x100;

/// Quadlet index of the root directory in a general ROM
/// (bus-info block is quadlets 0..=4).
pub const ROM_ROOT_DIR_INDEX: usize = 5;

/// Nobody-is-bus-manager value of `BUS_MANAGER_ID`.
pub const NO_BUS_MANAGER: u32 = 0x3f;

/// Directory entry key types (upper two bits of the key byte).
pub const KEYTYPE_IMMEDIATE: u8 = 0 << 6;
pub const KEYTYPE_OFFSET: u8 = 1 << 6;
pub const KEYTYPE_LEAF: u8 = 2 << 6;
pub const KEYTYPE_DIRECTORY: u8 = 3 << 6;

/// Directory keys (low six bits).
pub const KEY_TEXTUAL_DESCRIPTOR: u8 = 0x01;
pub const KEY_MODULE_VENDOR_ID: u8 = 0x03;
pub const KEY_NODE_CAPABILITIES: u8 = 0x0c;
pub const KEY_NODE_UNIQUE_ID: u8 = 0x0d;
pub const KEY_UNIT_DIRECTORY: u8 = 0x11;
pub const KEY_UNIT_SPEC_ID: u8 = 0x12;
pub const KEY_UNIT_SW_VERSION: u8 = 0x13;
pub const KEY_MODEL_ID: u8 = 0x17;

/// Full key bytes as they appear in directory entries.
pub const ENTRY_VENDOR_ID: u8 = KEYTYPE_IMMEDIATE | KEY_MODULE_VENDOR_ID;
pub const ENTRY_MODEL_ID: u8 = KEYTYPE_IMMEDIATE | KEY_MODEL_ID;
pub const ENTRY_UNIT_SPEC_ID: u8 = KEYTYPE_IMMEDIATE | KEY_UNIT_SPEC_ID;
pub const ENTRY_UNIT_SW_VERSION: u8 = KEYTYPE_IMMEDIATE | KEY_UNIT_SW_VERSION;
pub const ENTRY_NODE_CAPABILITIES: u8 = KEYTYPE_IMMEDIATE | KEY_NODE_CAPABILITIES;
pub const ENTRY_TEXTUAL_LEAF: u8 = KEYTYPE_LEAF | KEY_TEXTUAL_DESCRIPTOR;
pub const ENTRY_UNIT_DIRECTORY: u8 = KEYTYPE_DIRECTORY | KEY_UNIT_DIRECTORY;

/// Default SPLIT-TIMEOUT CSR value: 100 ms expressed in 1/8000 s cycles.
pub const SPLIT_TIMEOUT_DEFAULT: u32 = 0x800;

// The ROM window is exactly one kilobyte of the initial register space.
static_assertions::const_assert_eq!(CONFIG_ROM_QUADLETS * 4, 1024);
static_assertions::const_assert_eq!(CSR_END - CSR_BASE, CONFIG_ROM_END);

/// Convert a SPLIT-TIMEOUT CSR value to milliseconds.
pub fn split_timeout_ms(csr: u32) -> u32 {
    let seconds = csr >> 15;
    let cycles = csr & 0x7fff;
    seconds * 1000 + cycles * 125 / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_timeout_default_is_100ms() {
        assert_eq!(split_timeout_ms(SPLIT_TIMEOUT_DEFAULT), 100);
    }

    #[test]
    fn rom_window_bounds() {
        assert_eq!(CONFIG_ROM_END - CONFIG_ROM_OFFSET, (CONFIG_ROM_QUADLETS * 4) as u64);
    }
}
