//! Compute device descriptors.

use std::fmt;

/// Backend-specific device identifier (adapter index for wgpu).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

/// Broad device class, used to derive a default speed estimate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    DiscreteGpu,
    IntegratedGpu,
    VirtualGpu,
    Cpu,
    Other,
}

impl DeviceKind {
    /// Relative throughput score for devices of this class.
    pub fn default_speed(self) -> f32 {
        match self {
            DeviceKind::DiscreteGpu => 1.0,
            DeviceKind::IntegratedGpu => 0.5,
            DeviceKind::VirtualGpu => 0.25,
            DeviceKind::Other => 0.2,
            DeviceKind::Cpu => 0.1,
        }
    }
}

/// A compute device a tracer can be bound to. Immutable after discovery.
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    speed: f32,
}

impl Device {
    /// Create a device with the default speed estimate for its kind.
    pub fn new(id: DeviceId, name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            speed: kind.default_speed(),
        }
    }

    /// Override the speed estimate (e.g. from a benchmark run by the orchestrator).
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    /// Relative throughput score used by the orchestrator for work distribution.
    pub fn speed_estimate(&self) -> f32 {
        self.speed
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.name, self.kind)
    }
}
