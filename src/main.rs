use std::path::PathBuf;

use log::{error, info};

use quarry::{Config, Consistency, Dumper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments (simple)
    let args: Vec<String> = std::env::args().collect();

    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" | "-H" => {
                if i + 1 < args.len() {
                    config.host = args[i + 1].clone();
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    config.port = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--user" | "-u" => {
                if i + 1 < args.len() {
                    config.user = args[i + 1].clone();
                    i += 1;
                }
            }
            "--password" | "-P" => {
                if i + 1 < args.len() {
                    config.password = args[i + 1].clone();
                    i += 1;
                }
            }
            "--database" | "-B" => {
                if i + 1 < args.len() {
                    config.databases = args[i + 1]
                        .split(',')
                        .map(str::to_string)
                        .collect();
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--threads" | "-t" => {
                if i + 1 < args.len() {
                    config.threads = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--rows" | "-r" => {
                if i + 1 < args.len() {
                    config.rows = Some(args[i + 1].parse()?);
                    i += 1;
                }
            }
            "--consistency" => {
                if i + 1 < args.len() {
                    config.consistency = Consistency::parse(&args[i + 1])?;
                    i += 1;
                }
            }
            "--where" | "-w" => {
                if i + 1 < args.len() {
                    config.where_clause = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--sql" | "-S" => {
                if i + 1 < args.len() {
                    config.sql = args[i + 1].clone();
                    i += 1;
                }
            }
            "--snapshot" => {
                if i + 1 < args.len() {
                    config.snapshot = args[i + 1].clone();
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config = Config::from_json_file(std::path::Path::new(&args[i + 1]))?;
                    i += 1;
                }
            }
            "--no-data" | "-m" => config.no_data = true,
            "--no-schemas" => config.no_schemas = true,
            "--no-views" | "-W" => config.no_views = true,
            "--complete-insert" => config.complete_insert = true,
            "--pos-after-connect" => config.pos_after_connect = true,
            "--help" | "-h" => {
                println!("Quarry - a logical dump engine for MySQL-compatible databases");
                println!();
                println!("Usage: quarry [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -H, --host HOST        Server host (default: 127.0.0.1)");
                println!("  -p, --port PORT        Server port (default: 3306)");
                println!("  -u, --user USER        User name (default: root)");
                println!("  -P, --password PASS    Password");
                println!("  -B, --database DBS     Comma-separated database list");
                println!("  -o, --output DIR       Output directory (default: ./dump-data)");
                println!("  -t, --threads N        Dump workers (default: 4)");
                println!("  -r, --rows N           Target rows per chunk (default: no chunking)");
                println!("      --consistency MODE auto|flush|lock|snapshot|none (default: auto)");
                println!("  -w, --where EXPR       WHERE clause applied to every table");
                println!("  -S, --sql SQL          Dump the result of this statement instead");
                println!("      --snapshot TS      Server snapshot handle (TiDB)");
                println!("  -c, --config FILE      Load configuration from a JSON file");
                println!("  -m, --no-data          Schema only");
                println!("      --no-schemas       Data only");
                println!("  -W, --no-views         Skip views");
                println!("      --complete-insert  Write column lists in INSERTs");
                println!("      --pos-after-connect Record the position again after connect");
                println!("  -h, --help             Show this help");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!("starting dump of {}:{}", config.host, config.port);

    let mut dumper = Dumper::new(config).await?;
    let result = dumper.dump().await;
    dumper.close().await?;

    if let Err(e) = result {
        error!("dump failed: {}", e);
        return Err(e.into());
    }

    Ok(())
}
