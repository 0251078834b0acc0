//! Deployment layer built on the grid
//!
//! Hosts of a stage are the parties, deployment steps are the phases.

pub mod pipeline;
pub mod releases;
pub mod remote;
pub mod shell;
pub mod upstart;

pub use pipeline::{Deployment, DeploymentReport, HostContext, HostReport, Step, StepOutput, StepReport, Target};
pub use releases::{Release, ReleaseRef, ReleaseStatus, Releases, ReleasesLayout};
pub use remote::{CommandOutput, CommandRunner, DryRunRunner, HostAddress, LocalRunner};
pub use upstart::{Runlevels, UpstartService, UpstartServices};
