/*
 * Copyright (C) 2020-2021 Fanout, Inc.
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

pub mod app;
pub mod client;
pub mod clientconn;
pub mod codec;
pub mod config;
pub mod connection;
pub mod core;
pub mod dispatcher;
pub mod pool;
pub mod server;
pub mod tls;

use app::App;
use config::Settings;
use dispatcher::Dispatcher;
use log::info;
use std::error::Error;
use std::sync::Arc;

/// Serves `dispatcher` until a termination signal arrives.
pub fn run(settings: &Settings, dispatcher: Arc<Dispatcher>) -> Result<(), Box<dyn Error>> {
    info!("starting...");

    {
        let a = App::new(settings, dispatcher)?;

        info!("started");

        a.wait_for_term()?;

        info!("stopping...");

        info!("stats: {}", serde_json::to_string(&a.stats())?);
    }

    info!("stopped");

    Ok(())
}
