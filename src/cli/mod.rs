use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod errors;
mod handlers;

pub use handlers::*;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Data directory holding config.yaml and the index files.
    /// Defaults to $NOTEBLOCKS_BASE_PATH or ~/.local/share/noteblocks
    #[clap(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Vault root that document paths are relative to.
    /// Defaults to the current directory
    #[clap(long, global = true)]
    pub vault: Option<PathBuf>,

    /// Log debug output
    #[clap(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate api docs in markdown format
    #[cfg(feature = "markdown-docs")]
    #[clap(hide = true)]
    MarkdownDocs {},

    /// Index documents. Without paths every markdown file in the vault is indexed.
    Index {
        /// Vault-relative document paths
        paths: Vec<String>,
    },

    /// Show blocks related to a heading
    Related {
        /// Document file name, e.g. "today.md"
        #[clap(short, long)]
        document: String,

        /// Heading line, with or without its marker
        #[clap(long, allow_hyphen_values = true)]
        heading: String,

        /// Heading marker to strip. Defaults to the configured marker
        #[clap(short, long)]
        marker: Option<String>,

        /// Number of results
        #[clap(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// Remove a document from the index
    Remove {
        /// Vault-relative document path
        path: String,
    },

    /// Move a document's index entries to a new path
    Rename {
        /// Previous vault-relative path
        from: String,

        /// New vault-relative path
        to: String,
    },

    /// Print index counters
    Status {},

    /// List indexed documents with their block counts
    Files {},

    /// Rebuild the vector index without deleted entries
    Compact {},

    /// Wipe every store
    Reset {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
}
