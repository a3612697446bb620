//! Diagnostic CLI: inspect bump queue composition (script -> music mapping).
//!
//! Loads scripts/music/outro folders, applies the persisted exposure state
//! when available, rebuilds the bump queue, and prints the mapping with
//! duplicate-basename detection.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use lullatv::bump::composer::BumpComposer;
use lullatv::bump::library::{AssetResolver, BumpLibrary, ScanOptions};
use lullatv::config::Config;
use lullatv::exposure::ExposureStore;
use lullatv::playlist::playlist_io;

struct Args {
    scripts_dir: Option<PathBuf>,
    music_dir: Option<PathBuf>,
    outro_dir: Option<PathBuf>,
    exposure_dir: Option<PathBuf>,
    max_items: usize,
    probe_durations: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        scripts_dir: None,
        music_dir: None,
        outro_dir: None,
        exposure_dir: None,
        max_items: 24,
        probe_durations: true,
    };
    let mut argv = std::env::args().skip(1);
    while let Some(flag) = argv.next() {
        match flag.as_str() {
            "--scripts" => args.scripts_dir = argv.next().map(PathBuf::from),
            "--music" => args.music_dir = argv.next().map(PathBuf::from),
            "--outro" => args.outro_dir = argv.next().map(PathBuf::from),
            "--exposure-dir" => args.exposure_dir = argv.next().map(PathBuf::from),
            "--max" => {
                let value = argv.next().ok_or("--max needs a value")?;
                args.max_items = value.parse().map_err(|_| format!("bad --max: {value}"))?;
            }
            "--no-probe-durations" => args.probe_durations = false,
            "--help" | "-h" => {
                println!(
                    "usage: bump_queue_debug --scripts DIR --music DIR \
                     [--outro DIR] [--exposure-dir DIR] [--max N] [--no-probe-durations]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown flag: {other}")),
        }
    }
    Ok(args)
}

fn initialize_logging() {
    let mut clog = colog::basic_builder();
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        // Respect explicit user overrides completely when RUST_LOG is set.
        clog.parse_filters(&rust_log);
    } else {
        clog.filter(None, log::LevelFilter::Warn);
        clog.filter(Some("lullatv"), log::LevelFilter::Info);
    }
    clog.init();
}

fn main() -> ExitCode {
    initialize_logging();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("ERROR: {message}");
            return ExitCode::from(2);
        }
    };

    let Some(scripts_dir) = args.scripts_dir.filter(|dir| dir.is_dir()) else {
        eprintln!("ERROR: scripts dir not found");
        return ExitCode::from(2);
    };
    let Some(music_dir) = args.music_dir.filter(|dir| dir.is_dir()) else {
        eprintln!("ERROR: music dir not found");
        return ExitCode::from(2);
    };

    let exposure_dir = args
        .exposure_dir
        .unwrap_or_else(playlist_io::default_playlists_dir);
    println!("scripts_dir: {}", scripts_dir.display());
    println!("music_dir: {}", music_dir.display());
    println!("exposure_dir: {}", exposure_dir.display());
    println!();

    let config = Config::default();
    let resolver = AssetResolver::default();
    let scan = ScanOptions {
        probe_durations: args.probe_durations,
        ..ScanOptions::default()
    };
    let mut library = BumpLibrary {
        scripts: BumpLibrary::load_bump_scripts(&scripts_dir, &scan, &resolver, &config),
        music_files: BumpLibrary::scan_music(&music_dir, &scan),
        outro_sounds: Vec::new(),
    };
    if let Some(outro_dir) = args.outro_dir.filter(|dir| dir.is_dir()) {
        library.outro_sounds = BumpLibrary::scan_outro_sounds(&outro_dir);
    }

    let exposure = ExposureStore::open(&exposure_dir);
    let mut composer = BumpComposer::new(&config);
    composer.rebuild_queue(&library, &exposure);

    if let Some(stats) = composer.last_stats() {
        println!(
            "scripts: {} ({} audio, {} video)  music: {}",
            stats.scripts_total, stats.scripts_audio, stats.scripts_video, stats.music_total
        );
        println!(
            "queue: {}/{} built, {} audio scripts skipped (no music fit)",
            stats.queue_built, stats.queue_target, stats.skipped_audio_no_music_fit
        );
    }
    if composer.queue_len() == 0 {
        println!("Queue is empty.");
        return ExitCode::SUCCESS;
    }

    let limit = args.max_items.min(composer.queue_len());
    println!("---");

    let mut seen: Vec<(String, Vec<usize>)> = Vec::new();
    for i in 0..limit {
        let Some(item) = composer.pop_bump(&library, &exposure) else {
            break;
        };
        let music_base = item
            .audio
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let video_base = item
            .video
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned());
        let duration_ms: u32 = item.script.cards.iter().map(|card| card.duration_ms()).sum();

        match video_base {
            Some(video) => println!(
                "{i:02}  script={}  dur_ms={duration_ms}  video={video}",
                item.script.script_key
            ),
            None => println!(
                "{i:02}  script={}  dur_ms={duration_ms}  music={music_base}",
                item.script.script_key
            ),
        }

        if !music_base.is_empty() {
            match seen.iter_mut().find(|(name, _)| *name == music_base) {
                Some((_, positions)) => positions.push(i),
                None => seen.push((music_base, vec![i])),
            }
        }
    }

    println!("---");
    let duplicates: Vec<&(String, Vec<usize>)> =
        seen.iter().filter(|(_, positions)| positions.len() > 1).collect();
    if duplicates.is_empty() {
        println!("No duplicate music basenames detected in the printed segment.");
    } else {
        println!("Duplicate music basenames in the printed segment:");
        for (name, positions) in duplicates {
            println!("- {name}: positions {positions:?}");
        }
    }
    ExitCode::SUCCESS
}
