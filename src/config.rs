//! Mediator configuration
//!
//! Defaults match QEMU virt with TF-A and OP-TEE. When the host hands us a
//! device tree, the `linaro,optee-tz` firmware node decides whether a
//! Secure OS is present and which conduit it listens on.

use log::{info, warn};

/// Compatible string of the OP-TEE firmware node.
pub const OPTEE_DT_COMPATIBLE: &str = "linaro,optee-tz";

/// Tunables for the mediator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediatorConfig {
    /// Probe the Secure World at all.
    pub enabled: bool,
    /// Standard calls a single domain may have parked waiting for RPC.
    pub max_std_calls_per_domain: usize,
    /// RPC-allocated shared memory regions a single domain may hold.
    pub max_shm_per_domain: usize,
    /// Upper bound on pages covered by one non-contiguous buffer.
    pub max_noncontig_pages: usize,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_std_calls_per_domain: 16,
            max_shm_per_domain: 16,
            // 64MB worth of 4K pages
            max_noncontig_pages: 16384,
        }
    }
}

impl MediatorConfig {
    /// Derive the configuration from a flattened device tree.
    ///
    /// A blob that fails to parse keeps the defaults. A well-formed tree
    /// without an OP-TEE node, or one asking for a conduit other than
    /// `smc`, disables the mediator.
    pub fn from_dtb(blob: &[u8]) -> Self {
        let mut config = Self::default();

        let fdt = match fdt::Fdt::new(blob) {
            Ok(fdt) => fdt,
            Err(e) => {
                warn!("tee: unparsable DTB ({:?}), using defaults", e);
                return config;
            }
        };

        let Some(node) = fdt.find_compatible(&[OPTEE_DT_COMPATIBLE]) else {
            info!("tee: no {} node, mediator disabled", OPTEE_DT_COMPATIBLE);
            config.enabled = false;
            return config;
        };

        match node.property("method").and_then(|p| p.as_str()) {
            Some("smc") => {}
            Some(method) => {
                warn!("tee: unsupported OP-TEE conduit \"{}\"", method);
                config.enabled = false;
            }
            None => {
                warn!("tee: {} has no method property", node.name);
                config.enabled = false;
            }
        }
        config
    }
}
