//! Core simulator primitives and traits.

pub mod logging;
pub mod port;
pub mod signal;

use serde_json::Value;

/// A free-running component advanced once per clock.
pub trait Clocked {
    fn reset(&mut self);
    fn tick(&mut self);
}

/// Description of a mount point (media slot) that a system supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPointInfo {
    /// Unique identifier for this mount point (e.g., "Cartridge")
    pub id: String,
    /// User-friendly name for display
    pub name: String,
    /// File extensions accepted by this mount point
    pub extensions: Vec<String>,
    /// Whether this mount point is required for the system to function
    pub required: bool,
}

/// A high-level System trait tying components together.
pub trait System {
    type Error: std::error::Error + Send + Sync + 'static;
    type Input;
    type Output;

    /// Reset to initial power-on state
    fn reset(&mut self);

    /// Advance one clock with the given external inputs.
    fn step(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error>;

    /// Return a JSON-serializable save state for debugging.
    /// Save states never include mounted media contents.
    fn save_state(&self) -> Value;

    /// Load a JSON save state.
    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error>;

    fn supports_save_states(&self) -> bool {
        false
    }

    fn mount_points(&self) -> Vec<MountPointInfo>;

    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error>;

    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error>;

    fn is_mounted(&self, mount_point_id: &str) -> bool;
}
