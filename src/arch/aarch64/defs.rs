//! ARM64 Stage-2 translation table definitions
//!
//! 4KB granule, 48-bit IPA, four levels (L0-L3).

// ── Descriptor bits ──────────────────────────────────────────────────
pub const PTE_VALID: u64 = 1 << 0;
pub const PTE_TABLE: u64 = 1 << 1;
pub const PTE_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;
pub const PT_INDEX_MASK: u64 = 0x1FF;
pub const PT_ENTRIES: usize = 512;

// ── Stage-2 lower attributes ─────────────────────────────────────────
/// MemAttr[5:2]: 0b00xx is Device memory, anything else is Normal.
pub const S2_MEMATTR_SHIFT: u64 = 2;
pub const S2_MEMATTR_MASK: u64 = 0xF << S2_MEMATTR_SHIFT;
pub const S2_MEMATTR_NORMAL_WB: u64 = 0b1111 << S2_MEMATTR_SHIFT;
pub const S2_MEMATTR_DEVICE_NGNRE: u64 = 0b0001 << S2_MEMATTR_SHIFT;

/// S2AP[7:6] access permissions.
pub const S2AP_SHIFT: u64 = 6;
pub const S2AP_MASK: u64 = 0x3 << S2AP_SHIFT;
pub const S2AP_NONE: u64 = 0b00 << S2AP_SHIFT;
pub const S2AP_RO: u64 = 0b01 << S2AP_SHIFT;
pub const S2AP_WO: u64 = 0b10 << S2AP_SHIFT;
pub const S2AP_RW: u64 = 0b11 << S2AP_SHIFT;

pub const PTE_AF: u64 = 1 << 10;
pub const PTE_SH_INNER: u64 = 0b11 << 8;

// ── Sizes ────────────────────────────────────────────────────────────
pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE_4KB: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK_4KB: u64 = PAGE_SIZE_4KB - 1;
pub const BLOCK_SIZE_2MB: u64 = 2 * 1024 * 1024;
pub const BLOCK_MASK_2MB: u64 = BLOCK_SIZE_2MB - 1;
pub const BLOCK_SIZE_1GB: u64 = 1024 * 1024 * 1024;
pub const BLOCK_MASK_1GB: u64 = BLOCK_SIZE_1GB - 1;
