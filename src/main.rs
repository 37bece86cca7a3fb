use anyhow::Context;
use bitflood::config::Config;
use bitflood::engine::Engine;
use bitflood::metainfo::Metainfo;
use bitflood::storage;
use bitflood::torrent::Torrent;
use bitflood::utils::parse_selection;
use clap::Parser;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(about = "Simple bittorrent client. It can seed, too.")]
struct Cli {
    /// torrent file[s] which you want to download
    #[arg(required = true)]
    files: Vec<String>,
    /// output folder. Default: current folder
    #[arg(short, long)]
    out: Option<PathBuf>,
    /// max download speed in KB/s. Default: unlimited
    #[arg(long = "ds", default_value_t = 0)]
    download_speed: i64,
    /// max upload speed in KB/s. Default: unlimited
    #[arg(long = "us", default_value_t = -1, allow_hyphen_values = true)]
    upload_speed: i64,
    /// keep seeding after the download completes
    #[arg(short, long)]
    seed: bool,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();
    if args.download_speed != 0 && args.download_speed < 200 {
        println!("Download speed limit should be more than 200 KB/s");
        return;
    }
    if args.upload_speed < 0 && args.upload_speed != -1 {
        println!("Speed cannot be less than zero.");
        return;
    }
    if let Err(err) = run(args) {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(args: Cli) -> anyhow::Result<()> {
    let config = Config::new();
    let alive = Arc::new(AtomicBool::new(true));
    {
        let alive = alive.clone();
        ctrlc::set_handler(move || alive.store(false, Ordering::SeqCst))
            .context("installing the interrupt handler")?;
    }

    let mut engine = Engine::new(
        config.clone(),
        args.download_speed as f64,
        args.upload_speed as f64,
        alive,
    )?;
    let mut added = 0;
    for file in &args.files {
        if !Path::new(file).exists() {
            println!("{} doesn't exist or you have no permission to read it.", file);
            continue;
        }
        let metainfo = match Metainfo::from_file(file) {
            Ok(metainfo) => metainfo,
            Err(err) => {
                println!("File {} is invalid: {}", file, err);
                continue;
            }
        };
        let selection = prompt_selection(&metainfo)?;
        let mut torrent = Torrent::new(&metainfo, args.out.as_deref(), &selection, config.peer_id)?;
        storage::check_existing_data(&mut torrent)
            .with_context(|| format!("checking existing data for {}", file))?;
        engine.add_torrent(torrent, metainfo.tracker_urls())?;
        added += 1;
    }
    if added == 0 {
        println!("Nothing to download.");
        return Ok(());
    }
    engine.run(args.seed)
}

fn prompt_selection(metainfo: &Metainfo) -> anyhow::Result<bitflood::torrent::Selection> {
    let names: Vec<String> = match &metainfo.info.files {
        Some(files) => files
            .iter()
            .map(|f| format!("{}/{}", metainfo.info.name, f.path.join("/")))
            .collect(),
        None => vec![metainfo.info.name.clone()],
    };
    for (index, name) in names.iter().enumerate() {
        println!("{}. {}", index + 1, name);
    }
    println!("Choose files to download. Type 0 to download all or numbers of needed files.");
    let mut input = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut input)
        .context("reading the file selection")?;
    Ok(parse_selection(&input, names.len()))
}
