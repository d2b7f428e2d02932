/*
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::Parser;
use log::{error, info, LevelFilter};
use sncp::config::Settings;
use sncp::core::log::init_logger;
use sncp::dispatcher::{Dispatcher, ServiceServlet};
use std::error::Error;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

const ECHO_SERVICE: u128 = 1;
const ECHO_ACTION: u128 = 1;

#[derive(Parser, Clone)]
#[command(name = "sncp-server", version, about = "SNCP echo server.")]
struct CliArgs {
    #[arg(long, value_name = "file", help = "Config file.")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "addr", help = "Address to listen on.")]
    listen: Option<String>,

    #[arg(long, value_name = "x", help = "Number of I/O threads.")]
    workers: Option<usize>,

    #[arg(long, value_name = "x", help = "Maximum connections. Below 1 means unlimited.")]
    maxconns: Option<i64>,

    #[arg(
        long,
        value_name = "x",
        value_parser = clap::value_parser!(u8).range(0..=4),
        help = "Log level (0 = errors only, 4 = trace)."
    )]
    log_level: Option<u8>,

    #[arg(long, value_name = "file", help = "File to log to.")]
    log_file: Option<PathBuf>,
}

fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        4..=u8::MAX => LevelFilter::Trace,
    }
}

fn echo_dispatcher() -> Dispatcher {
    let d = Dispatcher::new();

    d.add_servlet(
        ECHO_SERVICE,
        Arc::new(
            ServiceServlet::new(true).action(ECHO_ACTION, |req, resp| {
                resp.finish(req.body())?;

                Ok(())
            }),
        ),
    );

    d
}

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let mut settings = Settings::new(args.config.as_deref())?;

    if let Some(listen) = args.listen {
        settings.server.listen = listen;
    }

    if let Some(workers) = args.workers {
        settings.server.workers = workers;
    }

    if let Some(maxconns) = args.maxconns {
        settings.server.maxconns = maxconns;
    }

    if let Some(level) = args.log_level {
        settings.log.level = level;
    }

    if let Some(file) = args.log_file {
        settings.log.file = file.to_string_lossy().into_owned();
    }

    let log_file = if settings.log.file.is_empty() {
        None
    } else {
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.log.file)
        {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("unable to open log file: {}. logging to standard out.", e);
                None
            }
        }
    };

    init_logger(level_filter(settings.log.level), log_file);

    if let Some(path) = &args.config {
        info!("using config: {}", path.display());
    }

    sncp::run(&settings, Arc::new(echo_dispatcher()))
}

fn main() {
    let args = CliArgs::parse();

    if let Err(e) = process_args_and_run(args) {
        error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
