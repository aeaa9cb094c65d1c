use crate::platform::PhyType;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PllError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Message bus timeout on port {port} lane {lane} (reg {reg:#x})")]
    BusTimeout { port: u32, lane: u8, reg: u32 },
    #[error("Message bus protocol error on port {port} lane {lane}, status {status:#x}")]
    BusProtocolError { port: u32, lane: u8, status: u32 },
    #[error("{family:?} PLL {index} is already claimed")]
    ResourceConflict { family: PhyType, index: u8 },
    #[error("Register {addr:#x} reads back all ones")]
    HardwareReadAnomaly { addr: u32 },
    #[error("Not initialized")]
    NotInitialized,
}

impl PllError {
    /// Bus errors are retried by the message-bus layer, everything else is final.
    pub fn is_bus_error(&self) -> bool {
        matches!(
            self,
            PllError::BusTimeout { .. } | PllError::BusProtocolError { .. }
        )
    }
}
