use crate::config::{Config, app_name, version};
use crate::events::LogSink;
use crate::pipeline::{PipelineBuilder, StreamSupervisor, SystemLauncher};
use crate::solar::{AstronomicalSource, Mode, SolarSchedule};
use crate::utils::sos::SignalOfStop;
use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{panic, process};
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod events;
pub mod pipeline;
pub mod solar;
pub mod utils;

fn main() -> anyhow::Result<()> {
    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file, defaults to ~/.config/daycast/config.json.")
                .value_parser(clap::value_parser!(PathBuf))
                .required(false),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .help("Validate the configuration, print both pipelines and exit.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter: a level (error, warn, info, debug, trace) or directives like daycast=debug.")
                .env("RUST_LOG")
                .default_value("info"),
        )
        .get_matches();

    let filter = log_filter(
        matches
            .get_one::<String>("log-level")
            .map(String::as_str)
            .unwrap_or("info"),
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load_or_default(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;

    if matches.get_flag("check") {
        print_pipelines(&config);
        return Ok(());
    }

    if config.publish.stream_key.is_empty() {
        warn!("No stream key configured, publishing to {}", config.publish.endpoint_url);
    }

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // invoke the default handler and exit the process
        orig_hook(panic_info);
        process::exit(105);
    }));

    let sos = SignalOfStop::new();

    // first SIGINT/SIGTERM/SIGHUP stops the pipeline, a second one exits at once
    let stop = sos.clone();
    let stopping = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if stopping.swap(true, Ordering::SeqCst) {
            process::exit(130);
        }
        stop.cancel();
    })
    .context("failed to install signal handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async {
        let today = chrono::Local::now().date_naive();
        let schedule = SolarSchedule::new(Box::new(AstronomicalSource), &config.location, today);
        let supervisor = StreamSupervisor::new(
            &config,
            schedule,
            Box::new(SystemLauncher),
            Box::new(LogSink),
            sos,
        );

        info!("{} {} starting", app_name(), version());
        supervisor.run().await;
    });

    Ok(())
}

/// Parse `--log-level`/`RUST_LOG` directives, falling back to `info` when malformed.
fn log_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("Ignoring log filter `{}`: {}", directives, e);
        EnvFilter::new("info")
    })
}

fn print_pipelines(config: &Config) {
    let builder = PipelineBuilder::new(config);
    for mode in [Mode::Day, Mode::Night] {
        let (capture, publish) = builder.build(mode);
        println!("[{}]", mode);
        println!("  capture: {}", builder.capture_spec(&capture));
        println!("  publish: {}", builder.publish_spec(&publish));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_log_filter_accepts_plain_levels() {
        assert_eq!(log_filter("warn").max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(log_filter("trace").max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn test_log_filter_accepts_target_directives() {
        let filter = log_filter("daycast=debug");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
        assert!(filter.to_string().contains("daycast=debug"));
    }
}
