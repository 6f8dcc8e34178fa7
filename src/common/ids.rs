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

/// Identifies one output column of a plan node across the whole fragment.
///
/// Slot ids are assigned by the planner and survive exchanges, so a chunk can
/// be addressed by slot id regardless of which operator produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(i32);

impl SlotId {
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i32> for SlotId {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        if v < 0 {
            return Err(format!("negative slot id: {v}"));
        }
        Ok(Self(v))
    }
}

impl std::str::FromStr for SlotId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = s.parse::<i32>().map_err(|e| e.to_string())?;
        Self::try_from(v)
    }
}

/// Identifies one node of the plan tree inside a fragment.
pub type PlanNodeId = i32;
