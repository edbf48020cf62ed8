//! CLI argument definitions using clap

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueHint};

/// Attribute hierarchies and dynamic pricing for configurable products
#[derive(Parser, Debug)]
#[command(name = "pricetree")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Turn debugging information on (-d info, -dd debug, -ddd trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub debug: u8,

    /// Directory searched for `.pricetree.toml` (default: cwd)
    #[arg(short = 'C', long, global = true, value_hint = ValueHint::DirPath)]
    pub project_dir: Option<PathBuf>,

    /// Store file, overrides `data_file` from the settings
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    pub data_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage manufacturing types
    Type {
        #[command(subcommand)]
        command: TypeCommands,
    },

    /// Edit and inspect attribute trees
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Price configurations and take snapshots
    Quote {
        #[command(subcommand)]
        command: QuoteCommands,
    },

    /// Manage settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completions
    Completion {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum TypeCommands {
    /// Register a manufacturing type
    Add {
        name: String,
        #[arg(long, default_value_t = 0.0)]
        base_price: f64,
        #[arg(long, default_value_t = 0.0)]
        base_weight: f64,
        /// Base technical value, e.g. `--technical u_value=1.2` (repeatable)
        #[arg(long = "technical", value_name = "KEY=VALUE")]
        technical: Vec<String>,
    },

    /// List manufacturing types
    List,
}

#[derive(Subcommand, Debug)]
pub enum NodeCommands {
    /// Import a nested JSON tree (object or array of objects)
    Import {
        /// Manufacturing type id or name
        manufacturing_type: String,
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        /// Attach the imported roots below this node
        #[arg(long)]
        parent: Option<String>,
    },

    /// Export nested JSON to stdout or a file
    Export {
        /// Manufacturing type id or name
        manufacturing_type: String,
        /// Export only the subtree below this node
        #[arg(long)]
        root: Option<String>,
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        output: Option<PathBuf>,
    },

    /// Show the hierarchy as a tree
    Tree {
        /// Manufacturing type id or name
        manufacturing_type: String,
        /// Show node ids
        #[arg(long)]
        ids: bool,
    },

    /// Move a node (and its subtree) below another node
    Move {
        node: String,
        /// New parent; omit to make the node a root
        #[arg(long)]
        parent: Option<String>,
    },

    /// Delete a node
    Delete {
        node: String,
        /// Also delete every descendant
        #[arg(long)]
        cascade: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum QuoteCommands {
    /// Price a selection set
    Price {
        /// Manufacturing type id or name
        manufacturing_type: String,
        /// Free input, e.g. `--input width=1200` (repeatable)
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Selection `NODE` or `NODE=VALUE`; NODE is an id or a path (repeatable)
        #[arg(short, long = "select", value_name = "NODE[=VALUE]")]
        selections: Vec<String>,
        /// Store the priced configuration
        #[arg(long)]
        save: bool,
        /// Print the configuration as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a stored configuration
    Show {
        configuration: String,
        #[arg(long)]
        json: bool,
    },

    /// Snapshot a complete stored configuration
    Snapshot {
        configuration: String,
        /// Reference of the quote the snapshot belongs to
        #[arg(long = "ref")]
        quote_ref: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Print a template config file
    Template,
    /// Show config file locations
    Path,
}
