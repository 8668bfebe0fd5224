/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! An Ember+ session engine: BER/GLOW wire types, S101 framing, a local tree
//! mirror, a single-active-request pipeline, and the [`client::EmberClient`]
//! facade built on top of them.

#[macro_use]
pub mod utils;

pub mod client;
pub mod com;
pub mod config;
pub mod consumer;
pub mod error;
pub mod glow;
pub mod pipeline;
pub mod provider;
pub mod s101;
pub mod tree;

pub use client::{EmberClient, InvocationOutcome};
pub use config::SessionConfig;
pub use error::{EmberError, EmberResult};
pub use pipeline::SessionEvent;
