/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2023 Fastly, Inc.
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

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::File;
use std::io::{self, Write};
use std::str;
use std::sync::{Mutex, OnceLock};
use std::thread;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

enum SharedOutput<'a> {
    Stdout(io::Stdout),
    File(&'a Mutex<File>),
}

impl Write for SharedOutput<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match self {
            Self::Stdout(g) => g.write(buf),
            Self::File(g) => (*g).lock().unwrap().write(buf),
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        match self {
            Self::Stdout(g) => g.flush(),
            Self::File(g) => (*g).lock().unwrap().flush(),
        }
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Line-oriented logger. Each line carries the level, a local timestamp
/// and the name of the logging thread, so output from the acceptor, the
/// I/O workers and the handler pool can be told apart.
pub struct SimpleLogger {
    local_offset: Option<UtcOffset>,
    output_file: Option<Mutex<File>>,
}

impl SimpleLogger {
    fn write_record(&self, output: &mut dyn Write, record: &Record) -> Result<(), io::Error> {
        let now = OffsetDateTime::now_utc().to_offset(self.local_offset.unwrap_or(UtcOffset::UTC));

        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let mut ts = [0u8; 64];

        let size = {
            let mut ts = io::Cursor::new(&mut ts[..]);

            now.format_into(&mut ts, &format)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            ts.position() as usize
        };

        let ts = str::from_utf8(&ts[..size]).unwrap_or("?");

        let current = thread::current();
        let tname = current.name().unwrap_or("-");

        let lname = level_name(record.level());

        if record.level() <= Level::Info {
            writeln!(output, "[{}] {} [{}] {}", lname, ts, tname, record.args())
        } else {
            writeln!(
                output,
                "[{}] {} [{}] [{}] {}",
                lname,
                ts,
                tname,
                record.target(),
                record.args()
            )
        }
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut output = match &self.output_file {
            Some(f) => SharedOutput::File(f),
            None => SharedOutput::Stdout(io::stdout()),
        };

        // nowhere left to report a failed log write
        let _ = self.write_record(&mut output, record);
    }

    fn flush(&self) {
        if let Some(f) = &self.output_file {
            let _ = f.lock().unwrap().flush();
        }
    }
}

// SAFETY: this method is unsound on platforms where another thread may
// modify environment vars
unsafe fn get_offset() -> Option<UtcOffset> {
    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Unsound);

    let offset = UtcOffset::current_local_offset().ok();

    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Sound);

    offset
}

static LOGGER: OnceLock<SimpleLogger> = OnceLock::new();

fn ensure_init_simple_logger(output_file: Option<File>) -> &'static SimpleLogger {
    LOGGER.get_or_init(|| {
        // SAFETY: we accept that this call is unsound. it happens once,
        // early, before worker threads are started
        let local_offset = unsafe { get_offset() };

        SimpleLogger {
            local_offset,
            output_file: output_file.map(Mutex::new),
        }
    })
}

/// Installs the logger as the global `log` backend. Only the first call
/// chooses the output; later calls only change the level.
pub fn init_logger(level: LevelFilter, output_file: Option<File>) {
    let logger = ensure_init_simple_logger(output_file);

    // fails only if another logger is already installed, e.g. in tests
    let _ = log::set_logger(logger);

    log::set_max_level(level);

    if logger.local_offset.is_none() {
        log::warn!("Failed to determine local time offset. Log timestamps will be in UTC.");
    }
}
