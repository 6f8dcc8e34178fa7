// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Flat error taxonomy used across the fragment runtime.
//!
//! Every fallible runtime operation returns [`Result<T>`]; the driver checks
//! the status at batch boundaries and the first terminal status written to a
//! fragment wins.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Cancelled,
    MemLimitExceeded,
    InternalError,
    RpcError,
    IoError,
    NotFound,
    InvalidArgument,
    Timeout,
    Unimplemented,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::MemLimitExceeded => "MEM_LIMIT_EXCEEDED",
            StatusCode::InternalError => "INTERNAL_ERROR",
            StatusCode::RpcError => "RPC_ERROR",
            StatusCode::IoError => "IO_ERROR",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::Timeout => "TIMEOUT",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Status>;

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn mem_limit_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::MemLimitExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InternalError, message)
    }

    pub fn rpc_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::RpcError, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::IoError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Timeout, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == StatusCode::Cancelled
    }
}

impl From<arrow::error::ArrowError> for Status {
    fn from(err: arrow::error::ArrowError) -> Self {
        Status::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_carries_code_and_message() {
        let st = Status::mem_limit_exceeded("tracker over limit");
        assert_eq!(st.code, StatusCode::MemLimitExceeded);
        assert_eq!(st.to_string(), "MEM_LIMIT_EXCEEDED: tracker over limit");
        assert!(!st.is_cancelled());
        assert!(Status::cancelled("query canceled").is_cancelled());
    }
}
