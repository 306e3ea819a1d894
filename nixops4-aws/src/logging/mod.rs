mod headless;

use anyhow::Result;
use clap::ColorChoice;
use std::io::IsTerminal as _;
use tracing::level_filters::LevelFilter;

pub(crate) struct Options {
    pub verbosity: u8,
    pub color: bool,
}

impl Options {
    pub(crate) fn new(verbosity: u8, color: ColorChoice) -> Self {
        let color = match color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::stderr().is_terminal(),
        };
        Options { verbosity, color }
    }

    pub(crate) fn level(&self) -> LevelFilter {
        match self.verbosity {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

pub(crate) trait Frontend {
    fn set_up(&mut self, options: &Options) -> Result<()>;

    fn tear_down(&mut self) -> Result<()>;
}

pub(crate) fn set_up(options: Options) -> Result<Box<dyn Frontend>> {
    let mut logger = headless::HeadlessLogger {};
    logger.set_up(&options)?;
    Ok(Box::new(logger))
}
