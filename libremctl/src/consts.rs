// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time;

/// The registered remctl port.
pub const DEFAULT_PORT: u16 = 4373;

/// The pre-registration port, tried as a fallback when the caller
/// passes port 0.
pub const LEGACY_PORT: u16 = 4444;

/// Largest token accepted during context negotiation, before any
/// session limits apply.
pub const MAX_HANDSHAKE_TOKEN: usize = 64 * 1024;

/// How many zero-progress reads or writes we tolerate before deciding
/// the peer is livelocking us.
pub const MAX_IO_TRIES: u32 = 100;

/// Size of the scratch buffer used when draining child output.
pub const BUF_SIZE: usize = 1024 * 16;

/// Cap on the merged output buffer kept for a protocol v1 client.
/// Output beyond this is discarded.
pub const V1_MAX_OUTPUT: usize = 64 * 1024;

/// A connection with no forward progress for this long is shut down.
pub const INACTIVITY_TIMEOUT: time::Duration = time::Duration::from_secs(60 * 60);

/// How long the select loop waits before re-polling for child exit.
pub const CHILD_POLL_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Bound on the final output drain after the child has been reaped, so
/// grandchildren holding the output sockets open cannot stall us.
pub const FINAL_DRAIN_TIMEOUT: time::Duration = time::Duration::from_secs(1);

/// Children get descriptors up to this closed before exec so the
/// GSS-API replay cache cannot leak into them.
pub const CHILD_MAX_INHERITED_FD: i32 = 16;
