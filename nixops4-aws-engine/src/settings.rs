use std::time::Duration;

/// Tunables of a deployment run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Interval between polls while waiting for a resource to settle.
    pub poll_interval: Duration,
    /// Overall bound on such waits.
    pub provisioning_timeout: Duration,
    /// Number of resources converged concurrently.
    pub jobs: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            poll_interval: Duration::from_secs(6),
            provisioning_timeout: Duration::from_secs(30 * 60),
            jobs: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvergeOptions {
    /// Read the resource back from the provider before deciding what to do.
    pub check: bool,
    pub allow_reboot: bool,
    pub allow_recreate: bool,
}
