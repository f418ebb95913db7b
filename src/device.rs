// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The [`VideoEngine`], front door of the crate.
//!
//! A `VideoEngine` is built once per SoC from its [`PlatformResources`]. It owns the scheduler
//! behind a mutex shared by the callers creating and feeding sessions and by one interrupt thread
//! per core. Client callbacks run with that mutex held.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::canvas::CanvasAllocator;
use crate::decoder::DecodeError;
use crate::decoder::DecoderClient;
use crate::decoder::FirmwareLoader;
use crate::engine::HevcDec;
use crate::engine::Vdec1;
use crate::firmware::FirmwareBlob;
use crate::firmware::FirmwareError;
use crate::frame::FrameHandle;
use crate::instance::SessionId;
use crate::irq::IrqEvent;
use crate::memory::Buffer;
use crate::memory::BufferAllocator;
use crate::mmio::RegisterBanks;
use crate::parser::EsParser;
use crate::scheduler::Platform;
use crate::scheduler::Scheduler;
use crate::secure::ProtectionState;
use crate::secure::SecureError;
use crate::secure::SecureMonitor;
use crate::secure::TeeClient;
use crate::stream_buffer::StreamBufferError;
use crate::CodecKind;
use crate::CoreKind;
use crate::SocKind;

/// Longest an interrupt thread sleeps before looking at its watchdog.
const MAX_WATCHDOG_PERIOD: Duration = Duration::from_millis(100);
const MIN_WATCHDOG_PERIOD: Duration = Duration::from_millis(1);

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub soc: SocKind,
    /// Size of the input ring of each session.
    pub stream_buffer_size: usize,
    /// Zero bytes written after the last input of a single-stream session.
    pub padding_size: usize,
    /// How long a decoding core may stay silent before its session is failed.
    pub watchdog_timeout: Duration,
    /// Service interrupts on dedicated threads. Without them the integration calls
    /// [`VideoEngine::service_interrupt`] and [`VideoEngine::check_watchdog`] itself.
    pub spawn_interrupt_threads: bool,
    /// Hand the firmware package to the TEE when the engine is created.
    pub use_tee_preload: bool,
    /// Have the TEE load the firmware images.
    pub secure_firmware: bool,
    /// Output frames allocated by each VP9 session.
    pub vp9_frame_count: usize,
    /// First canvas table entry owned by the engine.
    pub first_canvas: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            soc: SocKind::default(),
            stream_buffer_size: 1024 * 1024,
            padding_size: 16 * 1024,
            watchdog_timeout: Duration::from_secs(1),
            spawn_interrupt_threads: true,
            use_tee_preload: false,
            secure_firmware: false,
            vp9_frame_count: crate::decoder::vp9::FRAME_COUNT,
            first_canvas: 0x80,
        }
    }
}

/// What the platform integration provides to the engine.
pub struct PlatformResources {
    pub regs: RegisterBanks,
    pub vdec1_irq: Arc<IrqEvent>,
    pub hevc_irq: Arc<IrqEvent>,
    pub parser_irq: Arc<IrqEvent>,
    pub secure_monitor: Option<Arc<dyn SecureMonitor>>,
    pub tee: Option<Arc<dyn TeeClient>>,
    /// The firmware package.
    pub firmware: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("failed to set up the stream buffer: {0}")]
    StreamBuffer(#[from] StreamBufferError),
    #[error(transparent)]
    Secure(#[from] SecureError),
    #[error("invalid firmware package: {0}")]
    Firmware(#[from] FirmwareError),
    #[error("failed to spawn interrupt thread: {0}")]
    Spawn(std::io::Error),
}

pub struct VideoEngine {
    scheduler: Arc<Mutex<Scheduler>>,
    irqs: [Arc<IrqEvent>; 2],
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl VideoEngine {
    pub fn new(
        config: EngineConfig,
        resources: PlatformResources,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Self, EngineError> {
        let blob = FirmwareBlob::new(resources.firmware)?;
        log::debug!("firmware package with {} images", blob.images().len());

        if config.secure_firmware && resources.tee.is_none() {
            return Err(SecureError::NoTee.into());
        }
        if config.use_tee_preload {
            let tee = resources.tee.as_ref().ok_or(SecureError::NoTee)?;
            tee.preload_firmware(blob.package())
                .map_err(SecureError::Preload)?;
        }

        let regs = resources.regs;
        let platform = Platform {
            regs: regs.clone(),
            allocator: allocator.clone(),
            protection: ProtectionState::default(),
            canvas: CanvasAllocator::new(regs.clone(), config.first_canvas),
            firmware: FirmwareLoader::new(
                blob,
                config.soc,
                resources.tee.clone(),
                config.secure_firmware,
            ),
            parser: EsParser::new(regs.clone(), resources.parser_irq, allocator.clone()),
            monitor: resources.secure_monitor,
            soc: config.soc,
        };
        let vdec1 = Box::new(Vdec1::new(regs.clone(), allocator.clone()));
        let hevc = Box::new(HevcDec::new(regs, allocator, config.soc));

        let mut engine = Self {
            scheduler: Arc::new(Mutex::new(Scheduler::new(
                platform,
                vdec1,
                hevc,
                config.clone(),
            ))),
            irqs: [resources.vdec1_irq, resources.hevc_irq],
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        };
        if config.spawn_interrupt_threads {
            for core in CoreKind::ALL {
                engine.spawn_interrupt_thread(core, config.watchdog_timeout)?;
            }
        }
        log::info!("video engine ready on {:?}", config.soc);
        Ok(engine)
    }

    fn spawn_interrupt_thread(
        &mut self,
        core: CoreKind,
        watchdog_timeout: Duration,
    ) -> Result<(), EngineError> {
        let scheduler = self.scheduler.clone();
        let irq = self.irqs[core.index()].clone();
        let stop = self.stop.clone();
        let period = watchdog_timeout.clamp(MIN_WATCHDOG_PERIOD, MAX_WATCHDOG_PERIOD);

        let thread = thread::Builder::new()
            .name(format!("{:?} interrupts", core))
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match irq.wait(period) {
                        Ok(_) if stop.load(Ordering::SeqCst) => break,
                        Ok(true) => scheduler.lock().unwrap().service_interrupt(core),
                        Ok(false) => {
                            scheduler.lock().unwrap().check_watchdog(core);
                        }
                        Err(e) => {
                            log::error!("{:?} interrupt thread exiting: {}", core, e);
                            break;
                        }
                    }
                }
            })
            .map_err(EngineError::Spawn)?;
        self.threads.push(thread);
        Ok(())
    }

    /// Creates a session decoding `codec`. With `secure`, its input and output live in protected
    /// memory.
    pub fn create_session(
        &self,
        codec: CodecKind,
        secure: bool,
        client: Box<dyn DecoderClient>,
    ) -> Result<SessionId, EngineError> {
        self.scheduler
            .lock()
            .unwrap()
            .create_session(codec, secure, client)
    }

    /// Queues a chunk of input. H.264 chunks are arbitrary pieces of an Annex B stream; VP9
    /// chunks are whole frames or superframes.
    pub fn feed_input(
        &self,
        session: SessionId,
        data: Bytes,
        pts: Option<u64>,
    ) -> Result<(), EngineError> {
        self.scheduler
            .lock()
            .unwrap()
            .queue_input(session, data, pts, false)
            .map(|_| ())
    }

    /// Like [`VideoEngine::feed_input`], but a single-stream session short of stream buffer space
    /// takes only what fits. Returns the number of bytes taken.
    pub fn feed_input_partial(
        &self,
        session: SessionId,
        data: Bytes,
        pts: Option<u64>,
    ) -> Result<usize, EngineError> {
        self.scheduler
            .lock()
            .unwrap()
            .queue_input(session, data, pts, true)
    }

    pub fn end_of_stream(&self, session: SessionId) -> Result<(), EngineError> {
        self.scheduler.lock().unwrap().end_of_stream(session)
    }

    /// Gives back a frame delivered through [`DecoderClient::on_frame_ready`].
    pub fn return_frame(&self, session: SessionId, handle: FrameHandle) -> Result<(), EngineError> {
        self.scheduler.lock().unwrap().return_frame(session, handle)
    }

    /// Answers a frame request the client deferred.
    pub fn provide_frames(
        &self,
        session: SessionId,
        buffers: Vec<Buffer>,
    ) -> Result<(), EngineError> {
        self.scheduler
            .lock()
            .unwrap()
            .provide_frames(session, buffers)
    }

    pub fn destroy_session(&self, session: SessionId) -> Result<(), EngineError> {
        self.scheduler.lock().unwrap().destroy_session(session)
    }

    /// Services an interrupt of `core`.
    pub fn service_interrupt(&self, core: CoreKind) {
        self.scheduler.lock().unwrap().service_interrupt(core)
    }

    /// Returns whether the watchdog of `core` expired.
    pub fn check_watchdog(&self, core: CoreKind) -> bool {
        self.scheduler.lock().unwrap().check_watchdog(core)
    }

    /// The session currently running on `core`.
    pub fn current_session(&self, core: CoreKind) -> Option<SessionId> {
        self.scheduler.lock().unwrap().current(core)
    }

    /// Stops the interrupt threads, destroys every session and powers the cores down.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for irq in &self.irqs {
            if let Err(e) = irq.trigger() {
                log::warn!("failed to wake interrupt thread: {}", e);
            }
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::error!("interrupt thread panicked");
            }
        }
        self.scheduler.lock().unwrap().shutdown();
    }
}

impl Drop for VideoEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
