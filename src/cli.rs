//! Command-line argument parsing for sqlguard.
//!
//! Uses clap to parse CLI arguments. Flags given here take precedence over
//! environment variables and the config file.

use clap::Parser;
use sql_guardrail::config::Config;
use std::path::PathBuf;

/// Output format for query results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Plain text table.
    #[default]
    Text,
    /// JSON document with columns, rows and timing.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid output format: {s}. Expected: text or json")),
        }
    }
}

/// Run read-only SQL through the guardrails.
#[derive(Parser, Debug)]
#[command(name = "sqlguard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// SQL to run (read from stdin when omitted)
    #[arg(value_name = "SQL")]
    pub sql: Option<String>,

    /// Config file path
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Database URL (e.g., sqlite://sql_agent_class.db)
    #[arg(short = 'd', long, value_name = "URL")]
    pub database: Option<String>,

    /// Limit appended when the query has none
    #[arg(long, value_name = "N")]
    pub default_limit: Option<u64>,

    /// Largest LIMIT a query may carry
    #[arg(long, value_name = "N")]
    pub max_limit: Option<u64>,

    /// Maximum concurrent connections
    #[arg(long, value_name = "N")]
    pub pool_size: Option<usize>,

    /// Only validate and print the rewritten statement
    #[arg(long)]
    pub validate_only: bool,

    /// Output format (text or json)
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    pub format: String,

    /// Write logs to the log file instead of stderr
    #[arg(long)]
    pub log_file: bool,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Parses the output format from the --format argument.
    pub fn parse_output_format(&self) -> std::result::Result<OutputFormat, String> {
        self.format.parse()
    }

    /// Applies command-line overrides on top of file and environment values.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(url) = &self.database {
            config.database.url = url.clone();
        }
        if let Some(limit) = self.default_limit {
            config.guardrails.default_row_limit = limit;
        }
        if let Some(limit) = self.max_limit {
            config.guardrails.max_row_limit = limit;
        }
        if let Some(size) = self.pool_size {
            config.pool.pool_size = size;
        }
    }
}
