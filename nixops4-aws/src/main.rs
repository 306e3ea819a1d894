mod application;
mod confirm;
mod deploy;
mod deployment_file;
mod destroy;
mod interrupt;
mod logging;
mod options;
mod state;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use application::{handle_result, Completion};
use clap::{CommandFactory as _, Parser, Subcommand};
use nixops4_aws_engine::{Deployment, EngineSettings};
use options::Options;
use std::future::Future;
use std::sync::Arc;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args))
}

fn run_args(args: Args) -> Result<Completion> {
    let options = &args.options;
    match &args.command {
        Commands::Deploy(subargs) => with_logging(options, || deploy_command(options, subargs)),
        Commands::Check(subargs) => with_logging(options, || {
            on_deployment(options, EngineSettings::default(), |deployment| async move {
                let mut out = std::io::stdout();
                state::check(&deployment, subargs, &mut out).await
            })
        }),
        Commands::Destroy(subargs) => with_logging(options, || destroy_command(options, subargs)),
        Commands::Info(subargs) => with_logging(options, || {
            let store = application::open_store(options)?;
            state::info(store.as_ref(), subargs, &mut std::io::stdout())
        }),
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(Completion::Success)
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(Completion::Success)
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "nixops4-aws", &mut std::io::stdout());
            Ok(Completion::Success)
        }
    }
}

fn with_logging(options: &Options, f: impl FnOnce() -> Result<Completion>) -> Result<Completion> {
    let mut logging = logging::set_up(logging::Options::new(options.verbose, options.color))?;
    let result = f();
    logging.tear_down()?;
    result
}

/// Run `f` on the runtime, against the deployment of `options`.
fn on_deployment<F, Fut>(options: &Options, settings: EngineSettings, f: F) -> Result<Completion>
where
    F: FnOnce(Arc<Deployment>) -> Fut,
    Fut: Future<Output = Result<Completion>>,
{
    let interrupt_state = interrupt::set_up_process_interrupt_handler()?;
    application::runtime()?.block_on(application::with_deployment(
        &interrupt_state,
        options,
        settings,
        f,
    ))
}

fn deploy_command(options: &Options, subargs: &deploy::Args) -> Result<Completion> {
    let definitions = application::load_definitions(options)?.context(
        "deploy needs a deployment file; pass --deployment or set NIXOPS4_AWS_DEPLOYMENT",
    )?;
    let settings = EngineSettings {
        jobs: subargs.jobs,
        ..EngineSettings::default()
    };
    let mut confirm = application::confirm_callback(options);
    on_deployment(options, settings, |deployment| async move {
        let mut out = std::io::stdout();
        deploy::deploy(&deployment, &definitions, subargs, &mut *confirm, &mut out).await
    })
}

fn destroy_command(options: &Options, subargs: &destroy::Args) -> Result<Completion> {
    let definitions = application::load_definitions(options)?.unwrap_or_default();
    let mut confirm = application::confirm_callback(options);
    on_deployment(options, EngineSettings::default(), |deployment| async move {
        let mut out = std::io::stdout();
        destroy::destroy(&deployment, &definitions, subargs, &mut *confirm, &mut out).await
    })
}

/// nixops4-aws: manage AWS resources declaratively
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create, update and re-create resources so that they match the deployment
    #[command()]
    Deploy(deploy::Args),

    /// Read every recorded resource back from AWS and update the state
    #[command()]
    Check(state::CheckArgs),

    /// Destroy recorded resources, dependents first
    #[command()]
    Destroy(destroy::Args),

    /// Show the recorded state, without contacting AWS
    #[command()]
    Info(state::InfoArgs),

    /// Generate markdown documentation for nixops4-aws
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for nixops4-aws
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for nixops4-aws
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("nixops4-aws").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn verify_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn global_options_anywhere() {
        let args = parse(&[
            "deploy",
            "--deployment",
            "net.json",
            "-vv",
            "--provider",
            "aws-provider",
            "--provider-arg",
            "--profile=dev",
            "--yes",
            "--allow-recreate",
        ]);
        assert_eq!(args.options.verbose, 2);
        assert!(args.options.yes);
        assert_eq!(args.options.provider.as_deref(), Some("aws-provider"));
        assert_eq!(args.options.provider_args, ["--profile=dev"]);
        assert_eq!(
            args.options.deployment.as_deref(),
            Some(std::path::Path::new("net.json"))
        );
        let Commands::Deploy(deploy) = args.command else {
            panic!("expected deploy");
        };
        assert!(deploy.allow_recreate);
        assert_eq!(deploy.jobs, 4);
    }

    #[test]
    fn destroy_flags() {
        let args = parse(&["destroy", "--wipe", "--exclude", "db"]);
        let Commands::Destroy(destroy) = args.command else {
            panic!("expected destroy");
        };
        assert!(destroy.wipe);
        assert!(destroy.filter.to_filter().matches("ip"));
        assert!(!destroy.filter.to_filter().matches("db"));
    }

    #[test]
    fn generated_documentation_mentions_commands() {
        let markdown = clap_markdown::help_markdown::<Args>();
        assert!(markdown.contains("nixops4-aws deploy"));
        assert!(markdown.contains("--kill-obsolete"));
    }
}
