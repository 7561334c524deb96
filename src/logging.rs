//! `env_logger`-backed logging setup shared by both daemons.

#[derive(clap::Args, Debug, Clone)]
#[group()]
pub struct LoggingArgs {
    /// Enable debug-level logging.
    #[arg(long, default_value_t = false)]
    debug: bool,
}

impl LoggingArgs {
    pub fn init(&self) {
        init_logging(self.debug);
    }
}

pub fn init_logging(debug_mode: bool) {
    if debug_mode {
        env_logger::builder().filter(None, log::LevelFilter::Debug).init();
    } else {
        env_logger::builder().filter(None, log::LevelFilter::Info).init();
    }
}
