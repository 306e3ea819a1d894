use clap::{ArgAction, ColorChoice, Parser};
use nixops4_aws_engine::ResourceFilter;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct Options {
    /// The deployment file, a JSON object with a `resources` attribute set
    #[arg(long, global = true, env = "NIXOPS4_AWS_DEPLOYMENT")]
    pub deployment: Option<PathBuf>,

    /// The state file; created when it does not exist
    #[arg(
        long,
        global = true,
        env = "NIXOPS4_AWS_STATE",
        default_value = "nixops4-aws-state.json"
    )]
    pub state: PathBuf,

    /// Executable that performs AWS calls, speaking JSON lines on stdio
    #[arg(long, global = true, env = "NIXOPS4_AWS_PROVIDER")]
    pub provider: Option<String>,

    /// Argument to pass to the provider executable; may be repeated
    #[arg(long = "provider-arg", global = true, allow_hyphen_values = true)]
    pub provider_args: Vec<String>,

    /// More output; repeat for even more
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Answer every confirmation with yes
    #[arg(short, long, global = true, default_value_t = false)]
    pub yes: bool,
}

/// Resource selection shared by the subcommands.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Only these resources
    #[arg(long, num_args = 1.., value_name = "NAME")]
    pub include: Vec<String>,

    /// Not these resources
    #[arg(long, num_args = 1.., value_name = "NAME")]
    pub exclude: Vec<String>,
}

impl FilterArgs {
    pub fn to_filter(&self) -> ResourceFilter {
        ResourceFilter {
            include: self.include.iter().cloned().collect(),
            exclude: self.exclude.iter().cloned().collect(),
        }
    }
}
