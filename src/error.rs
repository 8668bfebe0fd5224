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

use miette::Diagnostic;
use rasn::error::{DecodeError, EncodeError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EmberError {
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("S101 decode error: {0}")]
    S101DecodeError(String),
    #[error("BER encode error: {0}")]
    BerEncodeError(#[from] EncodeError),
    #[error("BER decode error: {0}")]
    BerDecodeError(#[from] DecodeError),
    /// bad CRC, bad escape sequence, or a truncated S101 frame. Never fatal to the session.
    #[error("frame error: {0}")]
    FrameError(String),
    /// a request's deadline elapsed before a matching response arrived.
    #[error("request timed out")]
    Timeout,
    /// the peer reported write-denied on a read-only parameter.
    #[error("access denied for path {0}")]
    AccessError(String),
    /// tree-walk discovery gave up: the same path segment went unadvertised twice in a row.
    #[error("path not found: {0}")]
    PathNotFound(String),
    /// caller misuse rejected synchronously, without touching the pipeline.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// a target/source id fell outside a matrix's declared target/source count.
    #[error("invalid matrix connection: {0}")]
    InvalidConnection(String),
    /// a sibling with the same number is already attached under this parent.
    #[error("duplicate child number: {0}")]
    DuplicateNumber(i32),
    /// the session disconnected while requests were still pending.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type EmberResult<T> = Result<T, EmberError>;
