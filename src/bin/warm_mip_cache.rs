//! Mip cache warm-up utility
//!
//! Generates the full mip chain of every image in a directory and writes it
//! to the streaming cache, so the first run does not pay for decoding.
//!
//! Usage:
//!     warm_mip_cache [OPTIONS] <SOURCE_DIR>
//!
//! Options:
//!     -c, --cache <DIR>       Cache directory (default: from config, else cache/mips)
//!     --config <FILE>         Streaming config JSON to read the cache directory from
//!     -j, --jobs <N>          Parallel jobs (default: 4)
//!     -h, --help              Show this help message

use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rayon::prelude::*;

use rktri_texstream::core::logging;
use rktri_texstream::streaming::{MipStore, StreamingConfig};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tga", "bmp"];

fn print_help() {
    eprintln!("warm_mip_cache - Pre-generate streaming mip caches");
    eprintln!();
    eprintln!("Usage: warm_mip_cache [OPTIONS] <SOURCE_DIR>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("    -c, --cache <DIR>       Cache directory (default: config, else cache/mips)");
    eprintln!("    --config <FILE>         Streaming config JSON to read the cache directory from");
    eprintln!("    -j, --jobs <N>          Parallel jobs (default: 4)");
    eprintln!("    -h, --help              Show this help message");
    eprintln!();
    eprintln!("Example:");
    eprintln!("    warm_mip_cache -c ./cache/mips ./assets/textures");
}

#[derive(Debug)]
struct Args {
    source_dir: PathBuf,
    cache_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    jobs: usize,
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() {
        return Err("Missing source directory".to_string());
    }

    let mut cache_dir = None;
    let mut config = None;
    let mut jobs = 4;
    let mut source_dir: Option<PathBuf> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-c" | "--cache" => {
                i += 1;
                let value = args.get(i).ok_or("Missing value for --cache")?;
                cache_dir = Some(PathBuf::from(value));
            }
            "--config" => {
                i += 1;
                let value = args.get(i).ok_or("Missing value for --config")?;
                config = Some(PathBuf::from(value));
            }
            "-j" | "--jobs" => {
                i += 1;
                let value = args.get(i).ok_or("Missing value for --jobs")?;
                jobs = value.parse().map_err(|_| format!("Invalid jobs: {}", value))?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            path => {
                if source_dir.is_some() {
                    return Err("Multiple source directories specified".to_string());
                }
                source_dir = Some(PathBuf::from(path));
            }
        }
        i += 1;
    }

    let source_dir = source_dir.ok_or("Missing source directory")?;

    Ok(Args {
        source_dir,
        cache_dir,
        config,
        jobs: jobs.max(1),
    })
}

fn collect_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            images.extend(collect_images(&path)?);
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

fn main() {
    logging::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_help();
            std::process::exit(1);
        }
    };

    let config = match &args.config {
        Some(path) => match StreamingConfig::load_sync(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: failed to read {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => StreamingConfig::default(),
    };
    let cache_dir = args.cache_dir.clone().unwrap_or(config.cache_dir);

    let images = match collect_images(&args.source_dir) {
        Ok(images) => images,
        Err(e) => {
            eprintln!("Error: cannot read {}: {}", args.source_dir.display(), e);
            std::process::exit(1);
        }
    };

    println!("=== Rktri Mip Cache Warm-up ===");
    println!("Source: {}", args.source_dir.display());
    println!("Cache:  {}", cache_dir.display());
    println!("Images: {}", images.len());
    println!("Jobs:   {} parallel", args.jobs);
    println!();

    let pool = match rayon::ThreadPoolBuilder::new().num_threads(args.jobs).build() {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Error: failed to configure thread pool: {}", e);
            std::process::exit(1);
        }
    };

    let store = MipStore::new(&cache_dir);
    let start = Instant::now();
    let done = AtomicUsize::new(0);
    let levels = AtomicUsize::new(0);
    let total = images.len();

    let failures: Vec<(PathBuf, String)> = pool.install(|| {
        images
            .par_iter()
            .filter_map(|path| {
                let result = store.warm(path);
                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                if finished % 25 == 0 || finished == total {
                    eprintln!("  [{}/{}] {:.1}s", finished, total, start.elapsed().as_secs_f64());
                }
                match result {
                    Ok(count) => {
                        levels.fetch_add(count as usize, Ordering::Relaxed);
                        None
                    }
                    Err(e) => Some((path.clone(), e.to_string())),
                }
            })
            .collect()
    });

    println!();
    println!(
        "Cached {} mip levels for {} images in {:.2}s",
        levels.load(Ordering::Relaxed),
        total - failures.len(),
        start.elapsed().as_secs_f64()
    );
    if !failures.is_empty() {
        println!("{} failures:", failures.len());
        for (path, reason) in &failures {
            println!("  {}: {}", path.display(), reason);
        }
        std::process::exit(2);
    }
}
