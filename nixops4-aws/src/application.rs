use crate::confirm::PromptConfirm;
use crate::options::Options;
use anyhow::{Context, Result};
use nixops4_aws_core::Definition;
use nixops4_aws_engine::{
    AutoConfirm, ConfirmCallback, Deployment, EngineSettings, InterruptState,
};
use nixops4_aws_provider::{StdioProvider, StdioProviderConfig};
use nixops4_aws_resources::default_registry;
use nixops4_aws_state::EventLogStore;
use std::future::Future;
use std::process::exit;
use std::sync::Arc;

/// Create the single-threaded tokio runtime used by the CLI.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to initialize tokio runtime")
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    /// Some resource failed; the details have been reported.
    Failure,
    /// A confirmation was declined, so something was left in place.
    Declined,
}

impl Completion {
    pub fn exit_code(self) -> i32 {
        match self {
            Completion::Success => 0,
            Completion::Failure => 1,
            Completion::Declined => 2,
        }
    }

    /// The more severe of the two.
    pub fn and(self, other: Completion) -> Completion {
        match (self, other) {
            (Completion::Failure, _) | (_, Completion::Failure) => Completion::Failure,
            (Completion::Declined, _) | (_, Completion::Declined) => Completion::Declined,
            _ => Completion::Success,
        }
    }
}

/// Exit the process according to the outcome of a command.
pub fn handle_result(r: Result<Completion>) -> ! {
    match r {
        Ok(completion) => exit(completion.exit_code()),
        Err(e) => {
            eprintln!("nixops4-aws error: {:?}", e);
            exit(1);
        }
    }
}

pub fn confirm_callback(options: &Options) -> Box<dyn ConfirmCallback> {
    if options.yes {
        Box::new(AutoConfirm)
    } else {
        Box::new(PromptConfirm::stdio())
    }
}

/// The definitions of `--deployment`, if given.
pub fn load_definitions(options: &Options) -> Result<Option<Vec<Definition>>> {
    options
        .deployment
        .as_deref()
        .map(crate::deployment_file::load)
        .transpose()
}

pub fn open_store(options: &Options) -> Result<Arc<EventLogStore>> {
    let store = EventLogStore::open(&options.state)
        .with_context(|| format!("opening state file {}", options.state.display()))?;
    Ok(Arc::new(store))
}

/// Run `f` against a [`Deployment`] backed by the state file and the
/// provider process of `options`.
///
/// The provider process is shut down afterwards, also when `f` fails.
pub async fn with_deployment<F, Fut, R>(
    interrupt_state: &InterruptState,
    options: &Options,
    settings: EngineSettings,
    f: F,
) -> Result<R>
where
    F: FnOnce(Arc<Deployment>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let store = open_store(options)?;
    let registry = Arc::new(default_registry().context("registering resource types")?);
    let executable = options.provider.clone().ok_or_else(|| {
        anyhow::anyhow!("no provider executable; pass --provider or set NIXOPS4_AWS_PROVIDER")
    })?;
    let provider = Arc::new(StdioProvider::launch(StdioProviderConfig {
        executable,
        args: options.provider_args.clone(),
    })?);

    let deployment = Arc::new(Deployment::new(
        registry,
        store,
        provider.clone(),
        settings,
        interrupt_state.clone(),
    ));
    let result = f(deployment).await;

    let cleanup_result = provider.close_wait().await;

    and_cleanup(result, cleanup_result)
}

/// Combine a primary result with a cleanup result, preserving both errors if both fail.
fn and_cleanup<T>(primary: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (primary, cleanup) {
        (Ok(r), Ok(())) => Ok(r),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e1), Err(e2)) => Err(e1.context(format!("Additionally, cleanup failed: {}", e2))),
    }
}
