//! Command-line interface definitions
//!
//! Defines all CLI commands and arguments using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tidesdb::LogLevel;

/// TidesDB - embedded transactional key-value store
#[derive(Parser, Debug)]
#[command(name = "tidesdb")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Database directory
    #[arg(long, short = 'd', global = true, default_value = "./tidesdb-data")]
    pub db_path: PathBuf,

    /// Log level (debug, info, warn, error, none)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: LogLevel,

    /// Treat keys and values as hex instead of UTF-8
    #[arg(long, global = true)]
    pub hex: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a column family
    CreateCf {
        name: String,

        /// Store the memtable in a B+tree instead of a skip list
        #[arg(long)]
        btree: bool,

        /// Comparator name
        #[arg(long, default_value = "memcmp")]
        comparator: String,
    },

    /// Drop a column family and delete its files
    DropCf { name: String },

    /// List column families
    ListCf,

    /// Put a key-value pair
    Put {
        cf: String,
        key: String,
        value: String,

        /// Expire the key this many seconds from now
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Get a value by key
    Get { cf: String, key: String },

    /// Delete a key
    Delete { cf: String, key: String },

    /// Print every live key-value pair of a column family
    Scan {
        cf: String,

        /// Iterate from the last key to the first
        #[arg(long)]
        reverse: bool,

        /// Stop after this many pairs
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print column family statistics as JSON
    Stats {
        cf: String,
        /// Print the operational metrics report instead
        #[arg(long)]
        metrics: bool,
    },

    /// Compact every level of a column family
    Compact { cf: String },

    /// Flush the memtables of a column family
    Flush { cf: String },

    /// Copy the database into an empty directory
    Backup { target: PathBuf },

    /// Write a flushed, hard-linked snapshot into an empty directory
    Checkpoint { target: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_put_with_ttl() {
        let cli = Cli::parse_from([
            "tidesdb",
            "--db-path",
            "/data/db",
            "put",
            "users",
            "alice",
            "1",
            "--ttl",
            "60",
        ]);

        assert_eq!(cli.db_path, PathBuf::from("/data/db"));
        match cli.command {
            Commands::Put { cf, key, value, ttl } => {
                assert_eq!(cf, "users");
                assert_eq!(key, "alice");
                assert_eq!(value, "1");
                assert_eq!(ttl, Some(60));
            }
            _ => panic!("Expected Put command"),
        }
    }

    #[test]
    fn test_parse_scan_reverse() {
        let cli = Cli::parse_from(["tidesdb", "scan", "users", "--reverse", "--hex"]);

        assert!(cli.hex);
        match cli.command {
            Commands::Scan { cf, reverse, limit } => {
                assert_eq!(cf, "users");
                assert!(reverse);
                assert_eq!(limit, None);
            }
            _ => panic!("Expected Scan command"),
        }
    }

    #[test]
    fn test_parse_create_cf() {
        let cli = Cli::parse_from(["tidesdb", "create-cf", "events", "--btree"]);

        match cli.command {
            Commands::CreateCf {
                name,
                btree,
                comparator,
            } => {
                assert_eq!(name, "events");
                assert!(btree);
                assert_eq!(comparator, "memcmp");
            }
            _ => panic!("Expected CreateCf command"),
        }
    }

    #[test]
    fn test_parse_stats_metrics() {
        let cli = Cli::parse_from(["tidesdb", "stats", "users", "--metrics"]);

        match cli.command {
            Commands::Stats { cf, metrics } => {
                assert_eq!(cf, "users");
                assert!(metrics);
            }
            _ => panic!("Expected Stats command"),
        }
    }

    #[test]
    fn test_default_values() {
        let cli = Cli::parse_from(["tidesdb", "list-cf"]);

        assert_eq!(cli.db_path, PathBuf::from("./tidesdb-data"));
        assert_eq!(cli.log_level, LogLevel::Warn);
        assert!(!cli.hex);
        assert!(matches!(cli.command, Commands::ListCf));
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let parsed = Cli::try_parse_from(["tidesdb", "--log-level", "loud", "list-cf"]);
        assert!(parsed.is_err());
    }
}
