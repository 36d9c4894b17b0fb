use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct AnalyzeArgs {
    /// File with one title per line, or "-" for stdin
    #[clap(long)]
    pub titles: PathBuf,

    #[clap(long, default_value = "")]
    pub user_id: String,

    /// Weight of the parent score [0.0, 1.0]; defaults to config
    #[clap(long)]
    pub alpha: Option<f32>,

    /// Restrict children to the top-K parents; defaults to config
    #[clap(long)]
    pub topk_parent: Option<usize>,

    /// Also write the histogram to this file (usable as a profile)
    #[clap(short, long)]
    pub out: Option<PathBuf>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct IngestArgs {
    /// Parent label id or name, used as section/desk filter
    #[clap(long)]
    pub section: String,

    #[clap(long, default_value = "1200")]
    pub min_word_count: u32,

    /// YYYYMMDD
    #[clap(long)]
    pub begin: Option<String>,

    /// YYYYMMDD
    #[clap(long)]
    pub end: Option<String>,

    #[clap(long, default_value = "1")]
    pub max_pages: u32,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Classify titles into a two-level profile histogram
    Analyze(AnalyzeArgs),

    /// Recommend one piece of content for three labels
    Recommend {
        /// Exactly three comma-separated labels
        #[clap(short, long)]
        tags: String,

        /// Try the top labels of the saved profile first
        #[clap(long, default_value = "false")]
        use_profile: bool,

        #[clap(long, default_value = "")]
        user_id: String,
    },

    /// Print the saved profile
    Profile,

    /// Report model, taxonomy, search and store status
    Ready,

    /// Load NYT articles into the article store
    Ingest(IngestArgs),
}

pub fn parse_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

impl From<IngestArgs> for crate::ingest::IngestArgs {
    fn from(args: IngestArgs) -> Self {
        Self {
            section: args.section,
            min_word_count: args.min_word_count,
            begin: args.begin,
            end: args.end,
            max_pages: args.max_pages,
        }
    }
}
