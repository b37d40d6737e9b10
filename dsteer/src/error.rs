// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! This module provides universal error type used in the library. The error type uses `thiserror`.

pub use crate::{
    bootstrap::BootstrapError, router::group::GroupError, service::listener::BindError,
    upstream::qhandle::QHandleError,
};
use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, SteerError>;

/// SteerError enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum SteerError {
    /// Error related to the upstream group configuration.
    #[error(transparent)]
    GroupError(#[from] GroupError),

    /// Error related to upstream transports and their connection pools.
    #[error(transparent)]
    QHandleError(#[from] QHandleError),

    /// Error related to the bootstrap resolvers.
    #[error(transparent)]
    BootstrapError(#[from] BootstrapError),

    /// Error related to binding the listeners.
    #[error(transparent)]
    BindError(#[from] BindError),

    /// Errors encountered while shutting the service down, joined together.
    #[error("shutting down: {0}")]
    ShutdownErrors(String),
}
