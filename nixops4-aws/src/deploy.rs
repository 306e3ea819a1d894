use crate::application::Completion;
use crate::options::FilterArgs;
use anyhow::Result;
use nixops4_aws_core::Definition;
use nixops4_aws_engine::{
    ConfirmCallback, ConvergeOptions, ConvergeOutcome, DeployOptions, Deployment, ResourceResult,
    SkipReason,
};
use std::io::Write;

#[derive(clap::Parser, Debug, Clone)]
pub(crate) struct Args {
    /// Read every resource back from AWS before deciding what to change
    #[arg(long, default_value_t = false)]
    pub check: bool,

    /// Allow changes that reboot a resource, such as resizing a database
    #[arg(long, default_value_t = false)]
    pub allow_reboot: bool,

    /// Allow destroying and re-creating resources to change immutable attributes
    #[arg(long, default_value_t = false)]
    pub allow_recreate: bool,

    /// Destroy resources that are in the state but no longer in the deployment
    #[arg(long, default_value_t = false)]
    pub kill_obsolete: bool,

    /// Number of resources to work on concurrently
    #[arg(short, long, default_value_t = 4)]
    pub jobs: usize,

    #[command(flatten)]
    pub filter: FilterArgs,
}

impl Args {
    fn deploy_options(&self) -> DeployOptions {
        DeployOptions {
            converge: ConvergeOptions {
                check: self.check,
                allow_reboot: self.allow_reboot,
                allow_recreate: self.allow_recreate,
            },
            filter: self.filter.to_filter(),
            kill_obsolete: self.kill_obsolete,
        }
    }
}

fn describe(result: &ResourceResult) -> String {
    match result {
        ResourceResult::Converged(ConvergeOutcome::NoChange) => "up to date".to_owned(),
        ResourceResult::Converged(ConvergeOutcome::Created) => "created".to_owned(),
        ResourceResult::Converged(ConvergeOutcome::Adopted) => {
            "found after an interrupted creation".to_owned()
        }
        ResourceResult::Converged(ConvergeOutcome::Updated(handlers)) => {
            format!("updated ({})", handlers.join(", "))
        }
        ResourceResult::Converged(ConvergeOutcome::Recreated) => "re-created".to_owned(),
        ResourceResult::Failed(e) => format!("failed: {}", e),
        ResourceResult::Skipped(SkipReason::DependencyFailed(dep)) => {
            format!("skipped, because `{}` did not converge", dep)
        }
        ResourceResult::Skipped(SkipReason::Interrupted) => "skipped, interrupted".to_owned(),
    }
}

/// Run the `deploy` command, writing one line per resource to `out`.
pub(crate) async fn deploy(
    deployment: &Deployment,
    definitions: &[Definition],
    args: &Args,
    confirm: &mut dyn ConfirmCallback,
    out: &mut dyn Write,
) -> Result<Completion> {
    let report = deployment
        .deploy(definitions, &args.deploy_options(), confirm)
        .await?;

    for (name, result) in &report.results {
        writeln!(out, "{}: {}", name, describe(result))?;
    }
    for name in &report.destroyed {
        writeln!(out, "{}: destroyed, no longer defined", name)?;
    }
    for name in &report.declined {
        writeln!(out, "{}: kept, destruction declined", name)?;
    }

    let mut completion = Completion::Success;
    if !report.is_success() {
        tracing::error!(
            failed = report.failures().count(),
            "deployment did not converge"
        );
        completion = completion.and(Completion::Failure);
    }
    if !report.declined.is_empty() {
        completion = completion.and(Completion::Declined);
    }
    Ok(completion)
}
