use clap::{Args, Parser, Subcommand};
use image_analysis::{SceneType, UseCase};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "aerial-qa")]
#[command(author, version, about = "Quality assessment for drone photography", long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Analyze image files and directories
    Analyze(AnalyzeArgs),
    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (defaults to ~/.config/aerial-qa/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct AnalyzeArgs {
    /// Image files or directories to analyze
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Configuration file (defaults to ~/.config/aerial-qa/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Weight table for the primary composite (general, photogrammetric)
    #[arg(long, default_value = "general")]
    pub use_case: UseCase,

    /// Scene context for confidence adjustments (general, aerial_sky, ground_detail)
    #[arg(long, default_value = "general")]
    pub scene: SceneType,

    /// Number of worker threads (overrides the config file)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Route kernels through the offload backend
    #[arg(long)]
    pub gpu: bool,

    /// Output of `exiftool -json` for the analyzed files
    #[arg(short, long)]
    pub metadata: Option<PathBuf>,

    /// Descend into subdirectories
    #[arg(short, long)]
    pub recursive: bool,

    /// Write JSON snapshots here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_analyze_flags() {
        let cli = Cli::try_parse_from([
            "aerial-qa",
            "-v",
            "analyze",
            "a.jpg",
            "shots/",
            "--use-case",
            "photogrammetric",
            "--scene",
            "ground-detail",
            "--workers",
            "3",
            "--gpu",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 1);
        let Commands::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.paths.len(), 2);
        assert_eq!(args.use_case, UseCase::Photogrammetric);
        assert_eq!(args.scene, SceneType::GroundDetail);
        assert_eq!(args.workers, Some(3));
        assert!(args.gpu);
        assert!(!args.pretty);
    }

    #[test]
    fn test_analyze_defaults() {
        let cli = Cli::try_parse_from(["aerial-qa", "analyze", "a.png"]).unwrap();
        let Commands::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.use_case, UseCase::General);
        assert_eq!(args.scene, SceneType::General);
        assert!(args.output.is_none());
    }

    #[test]
    fn test_rejects_unknown_use_case() {
        assert!(Cli::try_parse_from(["aerial-qa", "analyze", "a.png", "--use-case", "mapping"]).is_err());
    }

    #[test]
    fn test_analyze_requires_paths() {
        assert!(Cli::try_parse_from(["aerial-qa", "analyze"]).is_err());
    }
}
