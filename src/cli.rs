use std::path::PathBuf;

#[derive(clap::Parser)]
#[command(version)]
pub struct Args {
    /// Capture inputs: export zips or directories, .har, .warc, .warc.open,
    /// or .txt list files. Defaults to the input list plus the current
    /// directory.
    pub inputs: Vec<PathBuf>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[arg(long)]
    pub verbose: bool,
}
