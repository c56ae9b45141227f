pub mod context;
pub mod detect;
pub mod digest;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod profile;
pub mod progress;
pub mod shell;
pub mod steps;
pub mod validation;

pub use context::InstallContext;
pub use detect::{DetectionPolicy, Detector, HostDetector, Subject};
pub use pipeline::{PipelineError, PipelineRunner, RunHandle, Step, StepRegistry, StepServices};
pub use profile::InstallProfile;
pub use progress::{ProgressStore, SharedValue, StepStatus};
pub use shell::{HostShell, Invocation, PowerShell};
