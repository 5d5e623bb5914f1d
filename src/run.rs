//! Command-line entry point: parse flags, load state, run tasks.

use std::path::{Path, PathBuf};

use anyhow::anyhow;

use crate::config;
use crate::logger::Logger;
use crate::stamp::StampCache;
use crate::work;

const STATE_DIR: &str = ".cask";

#[derive(argh::FromArgs)]
/// cask, a content-addressed task runner
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// task config file [default=cask.json]
    #[argh(option, short = 'f', default = "(\"cask.json\".into())")]
    config: String,

    /// run each task in a private sandbox directory
    #[argh(switch)]
    sandbox: bool,

    /// disable coloured output
    #[argh(switch)]
    no_color: bool,

    /// command (only "build") followed by task names
    #[argh(positional)]
    args: Vec<String>,
}

pub fn run() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    if let Some(dir) = &opts.chdir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let (command, targets) = match opts.args.split_first() {
        Some((command, targets)) => (command.as_str(), targets),
        None => anyhow::bail!("usage: cask build <task>..."),
    };
    if command != "build" {
        anyhow::bail!("unknown command {:?}, expected \"build\"", command);
    }
    if targets.is_empty() {
        anyhow::bail!("no tasks specified");
    }

    let map = config::load_task_map(Path::new(&opts.config))?;

    let color_enabled = !opts.no_color && console::colors_enabled();
    let prefix_width = map.keys().map(|id| id.len()).max().unwrap_or(0);
    let logger = Logger::new(color_enabled, prefix_width);

    let cache_root = PathBuf::from(STATE_DIR).join("cache");
    let stamps = StampCache::new(cache_root.join("stamps.json"));
    stamps.load()?;

    let executor = work::Executor::new(
        &map,
        &stamps,
        &logger,
        work::Options {
            cache_root,
            sandboxes_dir: PathBuf::from(STATE_DIR).join("sandboxes"),
            sandbox: opts.sandbox,
        },
    );

    let result = executor.execute_tasks(targets);

    // Stamps are worth keeping even when the build failed; lose them and the
    // next run re-hashes everything.
    if let Err(err) = stamps.save() {
        logger.error(&format!("cask: error saving stamp cache: {:#}", err));
    }
    if let Err(err) = executor.cleanup_sandbox() {
        logger.error(&format!("cask: error removing sandboxes: {:#}", err));
    }

    result?;
    Ok(0)
}
