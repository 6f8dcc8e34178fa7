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
use std::fmt;

/// 128-bit id assigned by the coordinator to queries and fragment instances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

impl UniqueId {
    pub const fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_uuid(self.hi, self.lo))
    }
}

/// Render an id pair in the coordinator's `hi-lo` hex form.
pub fn format_uuid(hi: i64, lo: i64) -> String {
    format!("{:016x}-{:016x}", hi as u64, lo as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_uuid_is_zero_padded_hex() {
        assert_eq!(format_uuid(1, -1), "0000000000000001-ffffffffffffffff");
        assert_eq!(
            UniqueId::new(0x10, 0x20).to_string(),
            format_uuid(0x10, 0x20)
        );
    }
}
