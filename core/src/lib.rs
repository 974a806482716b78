pub mod config;
pub mod error;
pub mod model;
pub mod parser;
pub mod runner;
pub mod scheduler;

pub use error::{Error, PollError};
pub use model::{ModelState, PollOutcome, SubscriptionId, VpnStatusModel};
pub use parser::{DetailEntry, VpnStatus};
pub use runner::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use scheduler::PollScheduler;

/// Interfaces that platform shells can implement to adapt the core library
/// without pulling in platform-specific dependencies.
pub mod platform {
    use crate::model::ModelState;
    use crate::parser::VpnStatus;

    /// Trait for the surface that shows the current VPN status.
    pub trait StatusPresenter {
        fn render(&self, status: &VpnStatus, state: ModelState);
    }

    /// Trait for platform-correct config paths.
    pub trait AppPaths {
        fn config_path(&self) -> std::path::PathBuf;
    }
}
