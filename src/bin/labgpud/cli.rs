use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::Verbosity;

#[derive(Debug, Parser)]
#[command(name = "labgpud", author, version = labgpu::core::version(), about = "Lab GPU scheduler daemon")]
pub struct LabGpud {
    /// The configuration file to use
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Policy document (YAML or TOML) applied on top of the configured policy
    #[arg(short, long)]
    pub policy: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity,
}
