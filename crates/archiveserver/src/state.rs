// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::nursery::NurseryHandle;
use crate::Config;

/// Everything a request handler needs, fixed at startup.
pub struct ArchiveState {
    pub config: Config,
    /// Where archive sessions are spawned, so shutdown can tear them down and wait for them.
    pub sessions: NurseryHandle,
}
