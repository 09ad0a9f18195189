//! Slave identity, protocol state and runtime view.
//!
//! Provides structures for:
//! - The protocol state machine of a node ([`SlaveState`], [`AlStatus`])
//! - Expected topology entries ([`SlaveDescriptor`])
//! - Enumerated nodes ([`SlaveInfo`]) and their runtime view ([`LiveSlave`])

use iris_common::config::SlaveSpec;
use iris_common::error::AcqResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Protocol states of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum SlaveState {
    /// Node does not answer.
    #[default]
    None = 0x00,
    /// Initial state after power-on.
    Init = 0x01,
    /// Pre-operational: mailbox communication available.
    PreOp = 0x02,
    /// Bootstrap: firmware update mode.
    Boot = 0x03,
    /// Safe-operational: inputs active, outputs safe.
    SafeOp = 0x04,
    /// Operational: full I/O active.
    Op = 0x08,
}

impl SlaveState {
    /// Parse state from the low nibble of a raw AL status register.
    pub fn from_al_status(status: u8) -> Option<Self> {
        match status & 0x0F {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Init),
            0x02 => Some(Self::PreOp),
            0x03 => Some(Self::Boot),
            0x04 => Some(Self::SafeOp),
            0x08 => Some(Self::Op),
            _ => None,
        }
    }

    /// Get the AL control value for requesting this state.
    pub fn to_al_control(self) -> u8 {
        self as u8
    }

    /// Returns true when the node did not answer.
    pub fn is_none(self) -> bool {
        self == Self::None
    }
}

impl fmt::Display for SlaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Init => write!(f, "INIT"),
            Self::PreOp => write!(f, "PRE_OP"),
            Self::Boot => write!(f, "BOOT"),
            Self::SafeOp => write!(f, "SAFE_OP"),
            Self::Op => write!(f, "OP"),
        }
    }
}

/// AL status register flag signalling an error indication.
const AL_ERROR_FLAG: u8 = 0x10;

/// Observed status of a node: protocol state plus error indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct AlStatus {
    /// Protocol state.
    pub state: SlaveState,
    /// Error indication flag.
    pub error: bool,
}

impl AlStatus {
    /// Status without error indication.
    pub const fn new(state: SlaveState) -> Self {
        Self {
            state,
            error: false,
        }
    }

    /// Status with the error indication set.
    pub const fn with_error(state: SlaveState) -> Self {
        Self { state, error: true }
    }

    /// Parse a raw AL status register.
    pub fn from_register(raw: u8) -> Option<Self> {
        Some(Self {
            state: SlaveState::from_al_status(raw)?,
            error: raw & AL_ERROR_FLAG != 0,
        })
    }

    /// Encode as a raw AL status register.
    pub fn to_register(self) -> u8 {
        let flag = if self.error { AL_ERROR_FLAG } else { 0 };
        self.state.to_al_control() | flag
    }

    /// Returns true only for OP without error indication.
    pub fn is_operational(self) -> bool {
        self.state == SlaveState::Op && !self.error
    }
}

impl fmt::Display for AlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error {
            write!(f, "{} + ERROR", self.state)
        } else {
            write!(f, "{}", self.state)
        }
    }
}

/// Node identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlaveIdentity {
    /// Vendor ID from the node EEPROM.
    pub vendor_id: u32,
    /// Product code from the node EEPROM.
    pub product_code: u32,
}

impl SlaveIdentity {
    /// Create a new identity.
    pub const fn new(vendor_id: u32, product_code: u32) -> Self {
        Self {
            vendor_id,
            product_code,
        }
    }
}

impl fmt::Display for SlaveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#010x} P:{:#010x}", self.vendor_id, self.product_code)
    }
}

/// Hook run once per matching node after identity verification, before the
/// process image is mapped.
pub type ConfigHook = Arc<dyn Fn(&SlaveInfo) -> AcqResult<()> + Send + Sync>;

/// Expected identity of one network position.
#[derive(Clone)]
pub struct SlaveDescriptor {
    /// Human-readable node name.
    pub name: String,
    /// Expected identity.
    pub identity: SlaveIdentity,
    /// Optional node configuration hook.
    pub config_hook: Option<ConfigHook>,
}

impl SlaveDescriptor {
    /// Create a descriptor without configuration hook.
    pub fn new(name: impl Into<String>, identity: SlaveIdentity) -> Self {
        Self {
            name: name.into(),
            identity,
            config_hook: None,
        }
    }

    /// Attach a configuration hook.
    #[must_use]
    pub fn with_config_hook(mut self, hook: ConfigHook) -> Self {
        self.config_hook = Some(hook);
        self
    }

    /// Check a discovered node against this descriptor.
    pub fn matches(&self, info: &SlaveInfo) -> bool {
        self.identity == info.identity
    }
}

impl From<&SlaveSpec> for SlaveDescriptor {
    fn from(spec: &SlaveSpec) -> Self {
        Self::new(
            spec.name.clone(),
            SlaveIdentity::new(spec.vendor_id, spec.product_code),
        )
    }
}

impl fmt::Debug for SlaveDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlaveDescriptor")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .field("config_hook", &self.config_hook.is_some())
            .finish()
    }
}

impl fmt::Display for SlaveDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.identity)
    }
}

/// Node as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveInfo {
    /// Position in the network (0-based).
    pub position: u16,
    /// Name reported by the node.
    pub name: String,
    /// Reported identity.
    pub identity: SlaveIdentity,
    /// Size of the node's input data (bytes).
    pub input_size: usize,
    /// Size of the node's output data (bytes).
    pub output_size: usize,
}

impl SlaveInfo {
    /// Create a new node description.
    pub fn new(position: u16, name: impl Into<String>, identity: SlaveIdentity) -> Self {
        Self {
            position,
            name: name.into(),
            identity,
            input_size: 0,
            output_size: 0,
        }
    }

    /// Set process data sizes.
    #[must_use]
    pub fn with_io(mut self, input_size: usize, output_size: usize) -> Self {
        self.input_size = input_size;
        self.output_size = output_size;
        self
    }
}

/// Runtime view of a physical node.
///
/// Owned by the session during open/close and by the health monitor while
/// the network is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSlave {
    /// Position in the network.
    pub position: u16,
    /// Node name.
    pub name: String,
    /// Last observed status.
    pub status: AlStatus,
    /// Set when the node stopped answering and has not been recovered.
    pub lost: bool,
    /// Working counter observed at the last health check.
    pub last_wkc: u16,
}

impl LiveSlave {
    /// Create the runtime view of an enumerated node.
    pub fn new(info: &SlaveInfo) -> Self {
        Self {
            position: info.position,
            name: info.name.clone(),
            status: AlStatus::new(SlaveState::Init),
            lost: false,
            last_wkc: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slave_state_conversion() {
        assert_eq!(SlaveState::from_al_status(0x00), Some(SlaveState::None));
        assert_eq!(SlaveState::from_al_status(0x01), Some(SlaveState::Init));
        assert_eq!(SlaveState::from_al_status(0x02), Some(SlaveState::PreOp));
        assert_eq!(SlaveState::from_al_status(0x04), Some(SlaveState::SafeOp));
        assert_eq!(SlaveState::from_al_status(0x08), Some(SlaveState::Op));
        assert_eq!(SlaveState::from_al_status(0x0F), None);
    }

    #[test]
    fn test_al_status_register() {
        let status = AlStatus::from_register(0x14).unwrap();
        assert_eq!(status, AlStatus::with_error(SlaveState::SafeOp));
        assert_eq!(status.to_register(), 0x14);
        assert_eq!(status.to_string(), "SAFE_OP + ERROR");

        assert!(AlStatus::new(SlaveState::Op).is_operational());
        assert!(!AlStatus::with_error(SlaveState::Op).is_operational());
    }

    #[test]
    fn test_descriptor_matching() {
        let descriptor = SlaveDescriptor::from(&SlaveSpec::iris());
        let good = SlaveInfo::new(0, "128+128", SlaveIdentity::new(0x79a, 0xdefe_d128));
        let bad = SlaveInfo::new(0, "EL1259", SlaveIdentity::new(0x2, 0x04eb_3052));

        assert!(descriptor.matches(&good));
        assert!(!descriptor.matches(&bad));
    }

    #[test]
    fn test_slave_identity_display() {
        let id = SlaveIdentity::new(0x79a, 0xdefe_d128);
        let display = format!("{}", id);
        assert!(display.contains("0x0000079a"));
        assert!(display.contains("0xdefed128"));
    }

    #[test]
    fn test_live_slave_starts_found() {
        let info = SlaveInfo::new(2, "node", SlaveIdentity::new(1, 2)).with_io(32, 8);
        let live = LiveSlave::new(&info);
        assert_eq!(live.position, 2);
        assert!(!live.lost);
        assert_eq!(live.status.state, SlaveState::Init);
    }
}
