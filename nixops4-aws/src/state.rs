//! The `check` and `info` commands: showing what the state file records.

use crate::application::Completion;
use crate::options::FilterArgs;
use anyhow::Result;
use nixops4_aws_engine::Deployment;
use nixops4_aws_state::{ResourceRecord, StateStore};
use std::collections::BTreeMap;
use std::io::Write;

#[derive(clap::Parser, Debug, Clone)]
pub(crate) struct CheckArgs {
    #[command(flatten)]
    pub filter: FilterArgs,
}

#[derive(clap::Parser, Debug, Clone)]
pub(crate) struct InfoArgs {
    /// Print the complete records as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

fn row(name: &str, record: &ResourceRecord) -> String {
    format!(
        "{:<24} {:<26} {:<9} {}",
        name,
        record.type_tag,
        record.lifecycle.to_string(),
        record.resource_id.as_deref().unwrap_or("-")
    )
}

/// Run the `check` command: poll every selected resource and record what
/// AWS reports.
pub(crate) async fn check(
    deployment: &Deployment,
    args: &CheckArgs,
    out: &mut dyn Write,
) -> Result<Completion> {
    let results = deployment.check(&args.filter.to_filter()).await?;
    let mut completion = Completion::Success;
    for (name, result) in &results {
        match result {
            Ok(record) => writeln!(out, "{}", row(name, record))?,
            Err(e) => {
                writeln!(out, "{:<24} error: {}", name, e)?;
                completion = Completion::Failure;
            }
        }
    }
    Ok(completion)
}

/// Run the `info` command. Makes no provider calls.
pub(crate) fn info(
    store: &dyn StateStore,
    args: &InfoArgs,
    out: &mut dyn Write,
) -> Result<Completion> {
    let records = store.snapshot()?;
    if args.json {
        let records: BTreeMap<&str, &ResourceRecord> =
            records.iter().map(|(k, v)| (k.as_str(), v)).collect();
        serde_json::to_writer_pretty(&mut *out, &records)?;
        writeln!(out)?;
    } else {
        for (name, record) in &records {
            writeln!(out, "{}", row(name, record))?;
        }
    }
    Ok(Completion::Success)
}
