use std::path::PathBuf;

use forkserver::{error::prelude::*, logging::EngineLogger, Engine, EngineConfig};

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde;

mod daemon;

struct Args {
    config: Option<PathBuf>,
    secondary: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config: None,
            secondary: false,
        };
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args.next().context("--config needs a path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "--secondary" => parsed.secondary = true,
                other => bail!("Unknown argument {other}"),
            }
        }
        Ok(parsed)
    }
}

fn main() {
    if cfg!(debug_assertions) {
        dotenvy::from_filename(".dev.env").ok();
    }
    if let Err(why) = dotenvy::dotenv() {
        eprintln!("Failed to load .env: {}", why);
    }

    if let Err(why) = _main() {
        error!("{why:?}");
        log::logger().flush();
        std::process::exit(1);
    }
}

fn _main() -> Result {
    EngineLogger::setup("forkserver")?;
    info!("Start of forkserver v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse()?;
    let config = EngineConfig::load(args.config.as_deref())?;
    let engine = Engine::init(config, !args.secondary).context("Couldn't start engine")?;
    let mut daemon = daemon::Daemon::new(engine)?;

    let stdin = std::io::stdin();
    daemon.run(&mut stdin.lock())
}
