//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// RedHive - hierarchical task orchestrator for autonomous security assessments
#[derive(Parser)]
#[command(
    name = "rh",
    about = "Hierarchical task orchestrator for autonomous security assessments",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Submit a task and drive it to completion
    Submit {
        /// One-line task summary
        #[arg(long)]
        r#abstract: String,

        /// Detailed step-by-step description
        #[arg(long)]
        description: String,

        /// Criteria to verify task completion
        #[arg(long)]
        verification: String,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a task's status, result, and diagram
    Status {
        task_id: String,

        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// List all tasks and their nodes
    List {
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a task's node tree in execution order
    Nodes {
        task_id: String,

        /// Print the tree as JSON
        #[arg(long)]
        json: bool,
    },

    /// Cancel a running task and all its nodes
    Cancel { task_id: String },

    /// Restart a task as a new task, optionally with improvement comments
    Restart {
        task_id: String,

        /// Notes appended to the new task's description
        #[arg(long)]
        comments: Option<String>,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Test the connection to the sandbox container
    Probe,

    /// Show the current execution limits
    Limits,

    /// Show kill-switch metrics
    Metrics,
}
