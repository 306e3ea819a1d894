use crate::application::Completion;
use crate::options::FilterArgs;
use anyhow::Result;
use nixops4_aws_core::Definition;
use nixops4_aws_engine::{ConfirmCallback, Deployment};
use std::io::Write;

#[derive(clap::Parser, Debug, Clone)]
pub(crate) struct Args {
    /// Also remove the destroyed resources from the state file
    #[arg(long, default_value_t = false)]
    pub wipe: bool,

    #[command(flatten)]
    pub filter: FilterArgs,
}

/// Run the `destroy` command. `definitions` are only used to order the
/// destruction; everything recorded is destroyed.
pub(crate) async fn destroy(
    deployment: &Deployment,
    definitions: &[Definition],
    args: &Args,
    confirm: &mut dyn ConfirmCallback,
    out: &mut dyn Write,
) -> Result<Completion> {
    let report = deployment
        .destroy(definitions, &args.filter.to_filter(), args.wipe, confirm)
        .await?;
    for name in &report.destroyed {
        writeln!(out, "{}: destroyed", name)?;
    }
    for name in &report.declined {
        writeln!(out, "{}: kept, destruction declined", name)?;
    }
    if report.declined.is_empty() {
        Ok(Completion::Success)
    } else {
        Ok(Completion::Declined)
    }
}
