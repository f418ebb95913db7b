// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Time-multiplexing of decode sessions onto the two cores.
//!
//! Each core runs at most one session at a time, the current one. Every other session waits in a
//! single FIFO of swapped out sessions. Whenever the current session of a core reaches a point
//! where it can give the core up, the first waiting session of that core that is ready to make
//! progress takes its place. Swapping a session out saves the cursors of its input FIFO and powers
//! the core down; swapping one in powers the core up, reloads its firmware and restores its input.
//!
//! Besides the idle wait, a swap in of a protected session can wait on the parser while it feeds
//! the first queued frame. That wait is bounded, and a timeout fails only that session.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::canvas::CanvasAllocator;
use crate::decoder::new_decoder;
use crate::decoder::DecoderClient;
use crate::decoder::DecoderContext;
use crate::decoder::DecoderStateMachine;
use crate::decoder::FirmwareLoader;
use crate::decoder::HwContext;
use crate::decoder::InputQueue;
use crate::decoder::Resources;
use crate::decoder::SessionIo;
use crate::device::EngineConfig;
use crate::device::EngineError;
use crate::engine::HardwareEngine;
use crate::frame::FrameHandle;
use crate::instance::DecoderInstance;
use crate::instance::SessionId;
use crate::memory::Buffer;
use crate::memory::BufferAllocator;
use crate::mmio::RegisterBanks;
use crate::parser::EsParser;
use crate::pts::PtsManager;
use crate::secure::ProtectedUnit;
use crate::secure::ProtectionState;
use crate::secure::SecureMonitor;
use crate::stream_buffer::StreamBuffer;
use crate::CodecKind;
use crate::CoreKind;
use crate::SocKind;

/// Resources shared by every session.
pub struct Platform {
    pub regs: RegisterBanks,
    pub allocator: Arc<dyn BufferAllocator>,
    pub protection: ProtectionState,
    pub canvas: CanvasAllocator,
    pub firmware: FirmwareLoader,
    pub parser: EsParser,
    pub monitor: Option<Arc<dyn SecureMonitor>>,
    pub soc: SocKind,
}

fn protected_unit(core: CoreKind) -> ProtectedUnit {
    match core {
        CoreKind::Vdec1 => ProtectedUnit::Vdec,
        CoreKind::Hevc => ProtectedUnit::Hevc,
    }
}

struct EngineSlot {
    core: Box<dyn HardwareEngine>,
    current: Option<SessionId>,
    /// When the current session is considered stuck, if it is decoding.
    watchdog: Option<Instant>,
}

/// Runs `f` on the state machine of `instance` with a context built from `platform`, and from
/// `core` if the session is current on it.
fn with_decoder<R>(
    platform: &mut Platform,
    core: Option<&mut Box<dyn HardwareEngine>>,
    instance: &mut DecoderInstance,
    f: impl FnOnce(&mut dyn DecoderStateMachine, &mut DecoderContext) -> R,
) -> R {
    let hw = match core {
        Some(core) => Some(HwContext {
            core: &mut **core,
            regs: &platform.regs,
            parser: &mut platform.parser,
            firmware: &platform.firmware,
        }),
        None => None,
    };
    let mut cx = DecoderContext {
        res: Resources {
            allocator: platform.allocator.as_ref(),
            protection: &platform.protection,
            canvas: &platform.canvas,
            soc: platform.soc,
        },
        hw,
        io: SessionIo {
            stream: &mut instance.stream,
            pts: &mut instance.pts,
            input: &mut instance.input,
            client: instance.client.as_mut(),
        },
    };
    f(instance.decoder.as_mut(), &mut cx)
}

pub struct Scheduler {
    platform: Platform,
    engines: [EngineSlot; 2],
    instances: HashMap<SessionId, DecoderInstance>,
    /// Sessions waiting for a core, oldest first.
    swapped_out: VecDeque<SessionId>,
    next_id: u32,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(
        platform: Platform,
        vdec1: Box<dyn HardwareEngine>,
        hevc: Box<dyn HardwareEngine>,
        config: EngineConfig,
    ) -> Self {
        let slot = |core| EngineSlot {
            core,
            current: None,
            watchdog: None,
        };
        Self {
            platform,
            engines: [slot(vdec1), slot(hevc)],
            instances: HashMap::new(),
            swapped_out: VecDeque::new(),
            next_id: 1,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.instances.len()
    }

    /// The session current on `core`.
    pub fn current(&self, core: CoreKind) -> Option<SessionId> {
        self.engines[core.index()].current
    }

    /// Sessions waiting for a core, oldest first.
    pub fn swapped_out(&self) -> Vec<SessionId> {
        self.swapped_out.iter().copied().collect()
    }

    pub fn watchdog_deadline(&self, core: CoreKind) -> Option<Instant> {
        self.engines[core.index()].watchdog
    }

    fn session_core(&self, id: SessionId) -> Result<CoreKind, EngineError> {
        self.instances
            .get(&id)
            .map(|instance| instance.core())
            .ok_or(EngineError::UnknownSession(id))
    }

    /// Runs `f` on the state machine of session `id`, lending it its core if it is current.
    fn run<R>(
        &mut self,
        id: SessionId,
        f: impl FnOnce(&mut dyn DecoderStateMachine, &mut DecoderContext) -> R,
    ) -> Result<R, EngineError> {
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(EngineError::UnknownSession(id))?;
        let slot = &mut self.engines[instance.core().index()];
        let core = if slot.current == Some(id) {
            Some(&mut slot.core)
        } else {
            None
        };
        Ok(with_decoder(&mut self.platform, core, instance, f))
    }

    pub fn create_session(
        &mut self,
        codec: CodecKind,
        secure: bool,
        client: Box<dyn DecoderClient>,
    ) -> Result<SessionId, EngineError> {
        let core = codec.core();
        let unit = protected_unit(core);
        if secure {
            let monitor = self.platform.monitor.as_deref();
            let protection = &mut self.platform.protection;
            protection.set_protected(monitor, ProtectedUnit::Parser, true)?;
            protection.set_protected(monitor, unit, true)?;
        }

        let stream = StreamBuffer::new(
            self.platform.allocator.as_ref(),
            &self.platform.protection,
            self.config.stream_buffer_size,
            self.config.padding_size,
            secure.then_some(unit),
        )?;
        let id = SessionId(self.next_id);
        self.next_id += 1;

        let mut instance = DecoderInstance {
            id,
            codec,
            secure,
            decoder: new_decoder(codec, self.config.vp9_frame_count),
            stream,
            context: None,
            pts: PtsManager::new(),
            input: InputQueue::default(),
            client,
            failed: false,
        };
        with_decoder(&mut self.platform, None, &mut instance, |decoder, cx| {
            decoder.initialize(cx)
        })?;

        log::info!(
            "{} created: {:?}{}",
            id,
            codec,
            if secure { ", secure" } else { "" }
        );
        self.instances.insert(id, instance);
        self.swapped_out.push_back(id);
        self.try_reschedule(core);
        Ok(id)
    }

    pub fn destroy_session(&mut self, id: SessionId) -> Result<(), EngineError> {
        let mut instance = self
            .instances
            .remove(&id)
            .ok_or(EngineError::UnknownSession(id))?;
        let core = instance.core();
        let slot = &mut self.engines[core.index()];
        let current = slot.current == Some(id);

        let hw = if current { Some(&mut slot.core) } else { None };
        with_decoder(&mut self.platform, hw, &mut instance, |decoder, cx| {
            decoder.teardown(cx)
        });
        if current {
            slot.core.stop_decoding();
            // The stream buffer and frames go away with the instance.
            if let Err(e) = slot.core.wait_for_idle() {
                panic!("{:?} did not go idle while destroying {}: {}", core, id, e);
            }
            slot.core.power_off();
            slot.current = None;
            slot.watchdog = None;
        } else {
            self.swapped_out.retain(|waiting| *waiting != id);
        }
        if instance.secure {
            self.platform.parser.detach(&instance.stream);
        }
        drop(instance);
        log::info!("{} destroyed", id);

        self.try_reschedule(core);
        Ok(())
    }

    /// Gives the core to a waiting session if the current one can let it go, then refreshes the
    /// watchdog.
    fn after_session_call(&mut self, core: CoreKind) {
        self.try_reschedule(core);
        self.rearm(core, false);
    }

    pub fn queue_input(
        &mut self,
        id: SessionId,
        data: Bytes,
        pts: Option<u64>,
        truncate: bool,
    ) -> Result<usize, EngineError> {
        let core = self.session_core(id)?;
        let accepted = self.run(id, |decoder, cx| {
            decoder.queue_input(cx, data, pts, truncate)
        })??;
        self.after_session_call(core);
        Ok(accepted)
    }

    pub fn end_of_stream(&mut self, id: SessionId) -> Result<(), EngineError> {
        let core = self.session_core(id)?;
        self.run(id, |decoder, cx| decoder.end_of_stream(cx))?;
        self.after_session_call(core);
        Ok(())
    }

    pub fn return_frame(&mut self, id: SessionId, handle: FrameHandle) -> Result<(), EngineError> {
        let core = self.session_core(id)?;
        self.run(id, |decoder, cx| decoder.return_frame(cx, handle))?;
        self.after_session_call(core);
        Ok(())
    }

    pub fn provide_frames(
        &mut self,
        id: SessionId,
        buffers: Vec<Buffer>,
    ) -> Result<(), EngineError> {
        let core = self.session_core(id)?;
        self.run(id, |decoder, cx| decoder.frames_provided(cx, buffers))?;
        self.after_session_call(core);
        Ok(())
    }

    /// Services an interrupt raised by `core`.
    pub fn service_interrupt(&mut self, core: CoreKind) {
        let Some(id) = self.current(core) else {
            log::warn!("{:?} interrupt without a current session", core);
            return;
        };
        // The session is current, so it exists.
        let _ = self.run(id, |decoder, cx| decoder.handle_interrupt(cx));

        self.try_reschedule(core);
        if self.current(core) == Some(id) {
            let _ = self.run(id, |decoder, cx| decoder.resume(cx));
        }
        self.rearm(core, true);
    }

    /// Fails the current session of `core` if it has been decoding for longer than the watchdog
    /// timeout. Returns whether it expired.
    pub fn check_watchdog(&mut self, core: CoreKind) -> bool {
        let slot = &mut self.engines[core.index()];
        match (slot.current, slot.watchdog) {
            (Some(id), Some(deadline)) if Instant::now() >= deadline => {
                slot.watchdog = None;
                log::error!("{}: watchdog expired on {:?}", id, core);
                let _ = self.run(id, |decoder, cx| decoder.on_watchdog(cx));
                if let Some(instance) = self.instances.get_mut(&id) {
                    instance.failed = true;
                }
                self.try_reschedule(core);
                self.rearm(core, true);
                true
            }
            _ => false,
        }
    }

    /// Arms the watchdog of `core` if its current session is decoding, disarms it otherwise. An
    /// armed watchdog keeps its deadline unless `fresh`.
    fn rearm(&mut self, core: CoreKind, fresh: bool) {
        let slot = &mut self.engines[core.index()];
        let decoding = slot
            .current
            .and_then(|id| self.instances.get(&id))
            .map_or(false, |instance| instance.decoder.is_decoding());
        slot.watchdog = match slot.watchdog {
            _ if !decoding => None,
            Some(deadline) if !fresh => Some(deadline),
            _ => Some(Instant::now() + self.config.watchdog_timeout),
        };
    }

    fn try_reschedule(&mut self, core: CoreKind) {
        if let Some(id) = self.current(core) {
            let swappable = self
                .instances
                .get(&id)
                .map_or(true, |instance| instance.decoder.can_be_swapped_out());
            if !swappable {
                return;
            }
        }

        let instances = &self.instances;
        let Some(next) = self.swapped_out.iter().copied().find(|id| {
            instances
                .get(id)
                .map_or(false, |instance| instance.core() == core && instance.can_be_swapped_in())
        }) else {
            return;
        };

        if self.current(core).is_some() {
            self.swap_out(core);
        }
        self.swap_in(core, next);
    }

    fn swap_out(&mut self, core: CoreKind) {
        let slot = &mut self.engines[core.index()];
        let Some(id) = slot.current.take() else {
            return;
        };
        slot.watchdog = None;
        let Some(instance) = self.instances.get_mut(&id) else {
            slot.core.power_off();
            return;
        };
        assert!(
            instance.decoder.can_be_swapped_out(),
            "{} swapped out of {:?} while busy",
            id,
            core
        );

        if instance.context.is_none() && !instance.failed {
            match slot.core.initialize_input_context(instance.secure) {
                Ok(context) => instance.context = Some(context),
                Err(e) => {
                    log::error!("{}: cannot allocate its input context: {}", id, e);
                    instance.failed = true;
                    instance.client.on_error(e.into());
                }
            }
        }

        instance.decoder.set_swapped_out();
        if let Some(context) = instance.context.as_mut() {
            if let Err(e) = slot.core.save_input_context(context) {
                panic!("{}: saving the input context failed: {}", id, e);
            }
        }
        slot.core.stop_decoding();
        if let Err(e) = slot.core.wait_for_idle() {
            panic!("{:?} did not go idle: {}", core, e);
        }
        slot.core.power_off();
        if instance.secure {
            self.platform.parser.detach(&instance.stream);
        }

        self.swapped_out.push_back(id);
        log::debug!("{} swapped out of {:?}", id, core);
    }

    fn swap_in(&mut self, core: CoreKind, id: SessionId) {
        self.swapped_out.retain(|waiting| *waiting != id);
        let slot = &mut self.engines[core.index()];
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        log::debug!("{} swapped into {:?}", id, core);
        slot.core.power_on();
        slot.current = Some(id);

        let result = with_decoder(
            &mut self.platform,
            Some(&mut slot.core),
            instance,
            |decoder, cx| decoder.initialize_hardware(cx),
        );
        if let Err(e) = result {
            panic!("{}: initializing {:?} failed: {}", id, core, e);
        }

        match instance.context.as_ref() {
            None => {
                let buffer = instance.stream.buffer();
                slot.core.initialize_stream_input(
                    instance.secure,
                    buffer.phys_base(),
                    instance.stream.size(),
                );
                if !instance.secure {
                    slot.core.initialize_direct_input();
                }
            }
            Some(context) => {
                if let Err(e) = slot.core.restore_input_context(context) {
                    panic!("{}: restoring the input context failed: {}", id, e);
                }
            }
        }

        with_decoder(
            &mut self.platform,
            Some(&mut slot.core),
            instance,
            |decoder, cx| decoder.swapped_in(cx),
        );
        self.rearm(core, true);
    }

    /// Destroys every session and powers the cores down.
    pub fn shutdown(&mut self) {
        let ids: Vec<SessionId> = self.instances.keys().copied().collect();
        for id in ids {
            // `id` was just listed.
            let _ = self.destroy_session(id);
        }
        for slot in &mut self.engines {
            slot.core.power_off();
        }
    }
}
