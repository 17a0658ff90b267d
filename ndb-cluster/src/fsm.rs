// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("Apply failed: {0}")]
    Apply(String),
    #[error("Snapshot failed: {0}")]
    Snapshot(String),
    #[error("Restore failed: {0}")]
    Restore(String),
}

/// The replicated state machine driven by the raft core. Entries are applied
/// exactly once, in log order, on every replica. `command` is `None` for
/// entries without user payload (no-ops, membership changes); the state
/// machine still advances its applied index for those.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, index: u64, command: Option<&[u8]>) -> Result<(), StateMachineError>;

    /// Writes a complete snapshot of the state at the current applied index.
    fn snapshot(&self, writer: &mut dyn Write) -> Result<(), StateMachineError>;

    /// Replaces the state with the snapshot read from `reader`; `index` is
    /// the last applied index the snapshot covers.
    fn restore(&self, index: u64, reader: &mut dyn Read) -> Result<(), StateMachineError>;

    fn last_applied(&self) -> u64;
}
