//! Host-side core of the AirChat desktop app: supervises the room server and
//! room client workers and turns their line-oriented output into UI events.

pub mod avatar;
pub mod bridge;
pub mod classifier;
pub mod config;
pub mod encoder;
pub mod framing;
pub mod launcher;
pub mod net;
pub mod roster;
pub mod supervisor;
pub mod writer;

pub use avatar::{AvatarCache, DirectoryAvatarCache, MemoryAvatarCache, NoAvatarCache};
pub use bridge::{Bridge, BridgeCommand, BridgeHandle, DispatchError};
pub use classifier::{classify, ClassifyContext};
pub use config::BridgeConfig;
pub use framing::FrameReassembler;
pub use launcher::{LaunchSpec, TokioWorkerLauncher, WorkerLauncher};
pub use roster::{RosterChange, RosterState};
pub use supervisor::{Supervisor, SupervisorError, SupervisorNotice};
pub use writer::{StdinWriter, WriteError, WriteStatus};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
