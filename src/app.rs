/*
 * Copyright (C) 2020-2023 Fanout, Inc.
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

use crate::config::Settings;
use crate::dispatcher::Dispatcher;
use crate::server::{ProtocolServer, ServerError, StatsSnapshot};
use log::info;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub struct App {
    server: ProtocolServer,
}

impl App {
    pub fn new(settings: &Settings, dispatcher: Arc<Dispatcher>) -> Result<Self, ServerError> {
        let server = ProtocolServer::start(&settings.server, dispatcher, None)?;

        info!(
            "listening on {} with {} workers",
            server.local_addr(),
            settings.server.workers
        );

        Ok(Self { server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.server.stats()
    }

    pub fn wait_for_term(&self) -> Result<(), io::Error> {
        let mut signals = Signals::new(TERM_SIGNALS)?;

        let term_now = Arc::new(AtomicBool::new(false));

        // ensure two term signals in a row causes the app to immediately exit
        for signal_type in TERM_SIGNALS {
            signal_hook::flag::register_conditional_shutdown(
                *signal_type,
                1, // exit code
                Arc::clone(&term_now),
            )?;

            signal_hook::flag::register(*signal_type, Arc::clone(&term_now))?;
        }

        // wait for termination
        if let Some(signal) = signals.forever().next() {
            info!("received signal {}", signal);
        }

        Ok(())
    }
}
