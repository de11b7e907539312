use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vision_broker_config::{BrokerConfig, IpcPaths};

#[derive(Parser, Debug)]
#[command(author, version, about = "Filesystem-IPC image description broker", long_about = None)]
pub struct Cli {
    /// JSON config file (defaults are used for anything it omits)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Put all four IPC files in this directory instead of the configured paths
    #[arg(long, global = true)]
    pub ipc_dir: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[arg(long, global = true)]
    pub poll_ms: Option<u64>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load the engines and serve requests until interrupted
    Serve {
        max_new_tokens: i32,
        max_context_len: i32,

        /// Give up on an inference call after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Submit one image to a running broker and print its description
    Describe {
        image: PathBuf,

        /// Seconds to wait for the readiness marker
        #[arg(long, default_value_t = 60)]
        ready_timeout: u64,

        /// Seconds to wait for the response
        #[arg(long, default_value_t = 45)]
        timeout: u64,
    },
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    pub fn apply(&self, config: &mut BrokerConfig) {
        if let Some(dir) = &self.ipc_dir {
            config.ipc = IpcPaths::in_dir(dir);
        }
        if let Some(ms) = self.poll_ms {
            config.poll_interval_ms = ms;
        }
        if let Command::Serve {
            max_new_tokens,
            max_context_len,
            timeout_secs,
        } = &self.command
        {
            config.engine.max_new_tokens = *max_new_tokens;
            config.engine.max_context_len = *max_context_len;
            if timeout_secs.is_some() {
                config.inference_timeout_secs = *timeout_secs;
            }
        }
    }
}
