/*
 * This file is part of helmgate.
 *
 * Copyright (C) 2025 helmgate contributors
 *
 * helmgate is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * helmgate is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with helmgate. If not, see <https://www.gnu.org/licenses/>.
 */

use tracing_subscriber::EnvFilter;

/// Environment variable holding a log filter, shared with the daemon
pub const LOG_ENV: &str = "HELMGATE_LOG";

/// Filter used when `HELMGATE_LOG` is unset
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "warn"
    }
}

/// `-v` always wins over the environment
pub fn log_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new(default_directive(true))
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive(false)))
    }
}

/// Log to stderr so command output on stdout stays machine-readable
pub fn init_logging(verbose: bool) {
    let filter = log_filter(verbose);

    // Already installed (tests, embedding); keep the existing subscriber
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(filter)
        .try_init();
}
