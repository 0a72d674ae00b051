//! Run phase markers for the type-state pattern.
//!
//! The phase order is fixed: Planned -> Deployed -> Configured, and the
//! handover consumes a configured deployment. Configuration steps may need
//! the deployer's admin privileges, so handing them over can only happen
//! once configuration is done.

/// Units are planned and the network is connected; nothing was sent yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct Planned;

/// Every unit has an address.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deployed;

/// Every configuration step is applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct Configured;

/// Sealed trait for run phases.
mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Planned {}
    impl Sealed for super::Deployed {}
    impl Sealed for super::Configured {}
}

/// Marker trait for valid run phases.
pub trait RunPhase: sealed::Sealed + Default + Send + Sync + 'static {
    const NAME: &'static str;
}

impl RunPhase for Planned {
    const NAME: &'static str = "planned";
}

impl RunPhase for Deployed {
    const NAME: &'static str = "deployed";
}

impl RunPhase for Configured {
    const NAME: &'static str = "configured";
}

/// Trait encoding valid phase transitions.
///
/// Implemented only for Planned -> Deployed and Deployed -> Configured.
pub trait NextPhase: RunPhase {
    type Next: RunPhase;
}

impl NextPhase for Planned {
    type Next = Deployed;
}

impl NextPhase for Deployed {
    type Next = Configured;
}

// Configured has no NextPhase impl - the handover consumes it.
