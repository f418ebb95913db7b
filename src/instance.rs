// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A decode session, as seen by the scheduler.

use std::fmt;

use crate::decoder::DecoderClient;
use crate::decoder::DecoderStateMachine;
use crate::decoder::InputQueue;
use crate::engine::InputContext;
use crate::pts::PtsManager;
use crate::stream_buffer::StreamBuffer;
use crate::CodecKind;
use crate::CoreKind;

/// Identifies a session for its whole life. Never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

pub struct DecoderInstance {
    pub id: SessionId,
    pub codec: CodecKind,
    /// Whether the stream and frames live in protected memory.
    pub secure: bool,
    pub decoder: Box<dyn DecoderStateMachine>,
    pub stream: StreamBuffer,
    /// Saved input state. Created the first time the session is swapped out.
    pub context: Option<InputContext>,
    pub pts: PtsManager,
    pub input: InputQueue,
    pub client: Box<dyn DecoderClient>,
    /// Set when the session can no longer be scheduled.
    pub failed: bool,
}

impl DecoderInstance {
    pub fn core(&self) -> CoreKind {
        self.codec.core()
    }

    pub fn can_be_swapped_in(&self) -> bool {
        !self.failed
            && !self.decoder.is_failed()
            && self
                .decoder
                .can_be_swapped_in(&self.input, self.client.as_ref())
    }
}
