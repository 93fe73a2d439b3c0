use std::fmt;

/// Execution device for array storage and kernels.
///
/// The engine dispatches each operation to exactly one of two backends:
/// the default host backend, or an accelerated backend selected by the
/// array's tag. This is a closed set; operations match on it rather than
/// querying open-ended type identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Default host backend.
    #[default]
    Host,
    /// Accelerated backend.
    Accel,
}

impl Device {
    /// Whether this is the host device.
    pub fn is_host(&self) -> bool {
        matches!(self, Device::Host)
    }

    /// Whether this is the accelerated device.
    pub fn is_accel(&self) -> bool {
        matches!(self, Device::Accel)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => write!(f, "host"),
            Device::Accel => write!(f, "accel"),
        }
    }
}
