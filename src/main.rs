mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use std::process::ExitCode;
use tidesdb::{
    now_secs, ColumnFamilyConfig, Config, Database, Result, StorageError,
};

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error ({}): {}", e.code() as i32, e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config {
        log_level: cli.log_level,
        ..Config::new(&cli.db_path)
    };
    let db = Database::open(config)?;
    let hex = cli.hex;

    match cli.command {
        Commands::CreateCf {
            name,
            btree,
            comparator,
        } => {
            let config = ColumnFamilyConfig {
                use_btree: btree,
                comparator_name: comparator,
                ..Default::default()
            };
            db.create_column_family(&name, config)?;
            println!("created column family \"{}\"", name);
        }
        Commands::DropCf { name } => {
            db.drop_column_family(&name)?;
            println!("dropped column family \"{}\"", name);
        }
        Commands::ListCf => {
            for name in db.list_column_families()? {
                println!("{}", name);
            }
        }
        Commands::Put {
            cf,
            key,
            value,
            ttl,
        } => {
            let cf = db.get_column_family(&cf)?;
            let mut txn = db.begin_for(&cf)?;
            let expires = ttl.map(|secs| now_secs() + secs);
            txn.put_with_ttl(&cf, &decode(&key, hex)?, &decode(&value, hex)?, expires)?;
            txn.commit()?;
            println!("OK");
        }
        Commands::Get { cf, key } => {
            let cf = db.get_column_family(&cf)?;
            let mut txn = db.begin_for(&cf)?;
            match txn.get(&cf, &decode(&key, hex)?) {
                Ok(value) => println!("{}", encode(&value, hex)),
                Err(e) if e.is_not_found() => println!("(not found)"),
                Err(e) => return Err(e),
            }
        }
        Commands::Delete { cf, key } => {
            let cf = db.get_column_family(&cf)?;
            let mut txn = db.begin_for(&cf)?;
            txn.delete(&cf, &decode(&key, hex)?)?;
            txn.commit()?;
            println!("OK");
        }
        Commands::Scan { cf, reverse, limit } => {
            let cf = db.get_column_family(&cf)?;
            let txn = db.begin_for(&cf)?;
            let mut it = txn.new_iterator(&cf)?;
            if reverse {
                it.seek_to_last()?;
            } else {
                it.seek_to_first()?;
            }
            let mut printed = 0usize;
            while it.valid() && limit.map_or(true, |l| printed < l) {
                println!("{}\t{}", encode(it.key()?, hex), encode(it.value()?, hex));
                printed += 1;
                if reverse {
                    it.prev()?;
                } else {
                    it.next()?;
                }
            }
        }
        Commands::Stats { cf, metrics } => {
            let cf = db.get_column_family(&cf)?;
            if metrics {
                print!("{}", cf.metrics().summary());
            } else {
                let json = serde_json::to_string_pretty(&cf.stats())
                    .map_err(|e| StorageError::Unknown(e.to_string()))?;
                println!("{}", json);
            }
        }
        Commands::Compact { cf } => {
            db.get_column_family(&cf)?.compact()?;
            println!("OK");
        }
        Commands::Flush { cf } => {
            db.get_column_family(&cf)?.flush_memtable()?;
            println!("OK");
        }
        Commands::Backup { target } => {
            db.backup(&target)?;
            println!("backup written to {}", target.display());
        }
        Commands::Checkpoint { target } => {
            db.checkpoint(&target)?;
            println!("checkpoint written to {}", target.display());
        }
    }

    db.close()
}

fn decode(input: &str, hex: bool) -> Result<Vec<u8>> {
    if hex {
        hex::decode(input).map_err(|e| StorageError::InvalidArgs(format!("bad hex {:?}: {}", input, e)))
    } else {
        Ok(input.as_bytes().to_vec())
    }
}

fn encode(bytes: &[u8], hex: bool) -> String {
    if hex {
        hex::encode(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}
