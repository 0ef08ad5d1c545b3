//! Supervised workload definition.
//!
//! [`ServiceUnit`] renders to a systemd unit installed in the guest.
//! [`RestartTracker`] and [`DependencyGate`] model what the supervisor does
//! with that unit, and [`Supervisor`] abstracts over the supervisor itself.

mod gate;
mod restart;
mod supervisor;
mod unit;

pub use gate::{DependencyGate, Health};
pub use restart::{ExitAction, RestartTracker, UnitState};
pub use supervisor::{NoopSupervisor, Supervisor, SystemdSupervisor, UnitStatus, detect_supervisor};
pub use unit::{ResourceLimits, RestartPolicy, ServiceUnit};
