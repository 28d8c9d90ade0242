use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use swapflow::automation::WebDriverFactory;
use swapflow::review::ReviewQueue;
use swapflow::tasks::LogLevel;
use swapflow::{library, logging, Config, RunConfig, RunEvent, Scheduler};

#[derive(Debug, Default)]
struct Args {
    config_path: Option<PathBuf>,
    root: Option<PathBuf>,
    persons: Vec<String>,
    all: bool,
    concurrency: Option<usize>,
    headless: Option<bool>,
    no_move: bool,
    list: bool,
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Error: {} requires an argument", flag);
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("swapflow {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                parsed.config_path = Some(PathBuf::from(value_of(&args, i, "--config")));
                i += 1;
            }
            "--root" | "-r" => {
                parsed.root = Some(PathBuf::from(value_of(&args, i, "--root")));
                i += 1;
            }
            "--person" | "-p" => {
                parsed.persons.push(value_of(&args, i, "--person"));
                i += 1;
            }
            "--concurrency" | "-j" => {
                let value = value_of(&args, i, "--concurrency");
                match value.parse::<usize>() {
                    Ok(n) if n > 0 => parsed.concurrency = Some(n),
                    _ => {
                        eprintln!("Error: --concurrency expects a positive number, got '{}'", value);
                        std::process::exit(1);
                    }
                }
                i += 1;
            }
            "--all" | "-a" => parsed.all = true,
            "--headless" => parsed.headless = Some(true),
            "--visible" => parsed.headless = Some(false),
            "--no-move" => parsed.no_move = true,
            "--list" | "-l" => parsed.list = true,
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"swapflow - batch face swapping through a browser pool

USAGE:
    swapflow [OPTIONS]

OPTIONS:
    --root, -r DIR          Library root (contains Faces/, SourceImages/, Temp/)
    --person, -p NAME       Select a person (repeatable)
    --all, -a               Select every person that has face images
    --concurrency, -j N     Maximum number of live browser sessions
    --headless              Run browsers without a window
    --visible               Show browser windows (left open afterwards)
    --no-move               Keep completed source images in place
    --list, -l              List persons and source images, then exit
    --config, -c PATH       Path to config file
    --version, -V           Show version
    --help, -h              Show this help message

Ctrl-C stops the run gracefully; a second Ctrl-C kills all browsers.

ENVIRONMENT:
    SWAPFLOW_CONFIG         Path to config file (overrides default location)
    SWAPFLOW_LOG            Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/swapflow/config.toml"#
    );
}

/// Print run events until the run ends.
fn print_events(events: Receiver<RunEvent>) {
    for event in events {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        match event {
            RunEvent::RunStarted { totals } => {
                let runners: usize = totals.values().sum();
                println!(
                    "[{}] Started {} runner(s) for {} person(s).",
                    stamp,
                    runners,
                    totals.len()
                );
            }
            RunEvent::RunProgress {
                person,
                completed,
                total,
            } => println!("[{}] {}: {}/{} faces finished", stamp, person, completed, total),
            RunEvent::ItemSucceeded { item, output_path } => {
                println!("[{}] OK   {} -> {}", stamp, item, output_path.display())
            }
            RunEvent::ItemFailed { item, reason } => {
                println!("[{}] FAIL {}: {}", stamp, item, reason)
            }
            RunEvent::Log { level, message, .. } => {
                if level >= LogLevel::Info {
                    println!("[{}] {:<5} {}", stamp, level, message);
                }
            }
            RunEvent::RunFinished(summary) => {
                println!("[{}] {}", stamp, summary.message());
                for source in &summary.undrained_sources {
                    println!("    not finished: {}", source.display());
                }
                break;
            }
            RunEvent::RunKilled => {
                println!("[{}] Run killed.", stamp);
                break;
            }
        }
    }
}

fn list_library(people: &[swapflow::Person], sources: &[swapflow::SourceImage]) {
    println!("Persons:");
    for person in people {
        println!("  {} ({} face(s))", person.name, person.faces.len());
    }
    println!("Source images: {}", sources.len());
    for source in sources {
        println!("  {}", source.filename);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let mut config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(root) = args.root {
        config.library.root = root;
    }
    if let Some(n) = args.concurrency {
        config.run.concurrency = n;
    }
    if let Some(headless) = args.headless {
        config.run.headless = headless;
    }
    if args.no_move {
        config.run.move_on_completion = false;
    }

    library::ensure_layout(&config.library)?;
    let people = library::scan_people(&config.library)?;
    let sources = library::scan_sources(&config.library)?;

    if args.list {
        list_library(&people, &sources);
        return Ok(());
    }

    let selected: Vec<String> = if args.all {
        people
            .iter()
            .filter(|p| p.has_faces())
            .map(|p| p.name.clone())
            .collect()
    } else {
        args.persons
    };
    if selected.is_empty() {
        bail!("no persons selected; use --person NAME or --all");
    }

    let run_config = RunConfig::from_config(&config, selected, sources);
    let kill_grace = config.timeouts.kill_grace();
    let factory = Arc::new(WebDriverFactory::new(
        &config.webdriver,
        config.timeouts.upload_poll(),
    ));
    let sink = Arc::new(ReviewQueue::open(&config.library)?);
    let scheduler = Arc::new(Scheduler::new(factory, sink));

    let events = scheduler.subscribe();
    scheduler.start(&people, run_config)?;

    let printer = tokio::task::spawn_blocking(move || print_events(events));
    let mut waiter = {
        let scheduler = scheduler.clone();
        tokio::task::spawn_blocking(move || scheduler.wait())
    };

    tokio::select! {
        _ = &mut waiter => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Stopping after current steps; press Ctrl-C again to kill all browsers.");
            scheduler.stop();
            let kill_now = tokio::select! {
                _ = &mut waiter => false,
                _ = tokio::signal::ctrl_c() => true,
                _ = tokio::time::sleep(kill_grace) => {
                    tracing::warn!("Runners did not stop within the grace period");
                    true
                }
            };
            if kill_now {
                let scheduler = scheduler.clone();
                tokio::task::spawn_blocking(move || scheduler.kill()).await?;
                waiter.await?;
            }
        }
    }

    printer.await?;
    Ok(())
}
