// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A simulated SoC whose only purpose is to let the engine run so we can test it in isolation.
//!
//! [`FakeSoc`] backs every register bank with a register file and models the side effects the
//! engine relies on: the DMA engines, the swap engine, the ES parser, the canvas table and two
//! small firmware models standing in for the VP9 and H.264 microcode. The firmware model run by
//! a core is picked by the code loaded into it, see [`firmware_package`].

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::anyhow;

use crate::codec::vp9::parse_aml_header;
use crate::codec::vp9::FrameInfo;
use crate::codec::vp9::FrameSize;
use crate::codec::vp9::FrameType;
use crate::codec::vp9::AML_HEADER_SIZE;
use crate::codec::vp9::NUM_REF_FRAMES;
use crate::decoder::h264;
use crate::decoder::vp9;
use crate::decoder::vp9::HardwareRenderParams;
use crate::decoder::DecodeError;
use crate::decoder::DecoderClient;
use crate::decoder::FrameAllocation;
use crate::decoder::FrameRequest;
use crate::device::PlatformResources;
use crate::firmware::FirmwareBlob;
use crate::firmware::FirmwareType;
use crate::firmware::PackageBuilder;
use crate::frame::DecodedFrame;
use crate::irq::IrqEvent;
use crate::memory::AllocError;
use crate::memory::AllocationRequest;
use crate::memory::Buffer;
use crate::memory::BufferAllocator;
use crate::memory::DmaRegion;
use crate::memory::HeapAllocator;
use crate::mmio::Bank;
use crate::mmio::Register;
use crate::mmio::RegisterBanks;
use crate::mmio::RegisterIo;
use crate::registers::dmc_regs;
use crate::registers::hevc;
use crate::registers::parser;
use crate::registers::vdec1;
use crate::secure::ProtectedUnit;
use crate::secure::SecureMonitor;
use crate::secure::TeeClient;
use crate::CoreKind;
use crate::Resolution;
use crate::SocKind;

pub const H264_FIRMWARE: &[u8] = b"fake:h264:single";
pub const H264_MULTI_FIRMWARE: &[u8] = b"fake:h264:multi\0";
pub const VP9_FIRMWARE: &[u8] = b"fake:vp9:mmu\0\0\0\0";

/// A firmware package with the images of the simulated firmware for G12A.
pub fn firmware_package() -> Vec<u8> {
    PackageBuilder::new()
        .add(FirmwareType::H264.name(SocKind::G12a), "vdec", H264_FIRMWARE)
        .add(
            FirmwareType::H264Multi.name(SocKind::G12a),
            "vdec",
            H264_MULTI_FIRMWARE,
        )
        .add(FirmwareType::Vp9Mmu.name(SocKind::G12a), "hevc", VP9_FIRMWARE)
        .build()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    Flush { phys: u32, len: usize },
    WritePointer { core: CoreKind, addr: u32 },
}

type Trace = Arc<Mutex<Vec<TraceEvent>>>;

/// A decoded canvas table entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CanvasEntry {
    pub addr: u32,
    pub stride: u32,
    pub height: u32,
}

struct TracedRegion {
    inner: Buffer,
    trace: Trace,
}

impl DmaRegion for TracedRegion {
    fn phys_base(&self) -> u32 {
        self.inner.phys_base()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn is_secure(&self) -> bool {
        self.inner.is_secure()
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<(), AllocError> {
        self.inner.write(offset, data)
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), AllocError> {
        self.inner.read(offset, out)
    }

    fn cache_flush(&self, offset: usize, len: usize) {
        self.trace.lock().unwrap().push(TraceEvent::Flush {
            phys: self.phys_base() + offset as u32,
            len,
        });
        self.inner.cache_flush(offset, len)
    }

    fn cache_invalidate(&self, offset: usize, len: usize) {
        self.inner.cache_invalidate(offset, len)
    }
}

/// Heap allocator recording cache flushes.
struct TracedAllocator {
    heap: Arc<HeapAllocator>,
    trace: Trace,
}

impl BufferAllocator for TracedAllocator {
    fn allocate(&self, request: &AllocationRequest) -> Result<Buffer, AllocError> {
        Ok(Arc::new(TracedRegion {
            inner: self.heap.allocate(request)?,
            trace: self.trace.clone(),
        }))
    }
}

#[derive(Default)]
struct RecordingMonitor {
    calls: Mutex<Vec<(ProtectedUnit, bool)>>,
}

impl SecureMonitor for RecordingMonitor {
    fn set_protected(&self, unit: ProtectedUnit, enable: bool) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push((unit, enable));
        Ok(())
    }
}

/// What the simulated trusted application was asked to do.
#[derive(Default)]
pub struct TeeLog {
    pub preloads: usize,
    pub loads: Vec<FirmwareType>,
    package: Option<Vec<u8>>,
}

/// State shared by the simulation that is not behind the register file lock.
struct Env {
    heap: Arc<HeapAllocator>,
    trace: Trace,
    stall_dma: AtomicBool,
    stall_parser: AtomicBool,
    hang: AtomicBool,
    vdec1_irq: Arc<IrqEvent>,
    hevc_irq: Arc<IrqEvent>,
    parser_irq: Arc<IrqEvent>,
    monitor: Arc<RecordingMonitor>,
    tee: Mutex<TeeLog>,
}

impl Env {
    fn read_phys(&self, phys: u32, out: &mut [u8]) {
        self.heap
            .read_phys(phys, out)
            .unwrap_or_else(|e| panic!("simulated DMA read at {:#x}: {}", phys, e));
    }

    fn write_phys(&self, phys: u32, data: &[u8]) {
        self.heap
            .write_phys(phys, data)
            .unwrap_or_else(|e| panic!("simulated DMA write at {:#x}: {}", phys, e));
    }
}

struct SocInner {
    env: Env,
    sim: Mutex<Sim>,
    writes: AtomicUsize,
}

impl SocInner {
    fn read(&self, reg: Register) -> u32 {
        let value = self.sim.lock().unwrap().get(reg);
        let stalled = self.env.stall_dma.load(Ordering::SeqCst)
            && matches!(
                reg,
                vdec1::IMEM_DMA_CTRL
                    | vdec1::LMEM_DMA_CTRL
                    | vdec1::DCAC_DMA_CTRL
                    | hevc::HEVC_IMEM_DMA_CTRL
                    | hevc::HEVC_LMEM_DMA_CTRL
            );
        if stalled {
            value | vdec1::DMA_BUSY
        } else {
            value
        }
    }

    fn write(&self, reg: Register, value: u32) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.sim.lock().unwrap().write(&self.env, reg, value);
    }
}

/// One register bank of the simulated SoC.
struct FakeBank {
    bank: Bank,
    soc: Arc<SocInner>,
}

impl RegisterIo for FakeBank {
    fn read32(&self, offset: u32) -> u32 {
        self.soc.read(Register::new(self.bank, offset / 4))
    }

    fn write32(&self, offset: u32, value: u32) {
        self.soc.write(Register::new(self.bank, offset / 4), value)
    }
}

struct FakeTee {
    soc: Arc<SocInner>,
}

impl TeeClient for FakeTee {
    fn preload_firmware(&self, package: &[u8]) -> anyhow::Result<()> {
        let mut log = self.soc.env.tee.lock().unwrap();
        log.preloads += 1;
        log.package = Some(package.to_vec());
        Ok(())
    }

    fn load_video_firmware(&self, firmware: FirmwareType, soc: SocKind) -> anyhow::Result<()> {
        let package = {
            let mut log = self.soc.env.tee.lock().unwrap();
            log.loads.push(firmware);
            log.package
                .clone()
                .ok_or_else(|| anyhow!("firmware was not pre-loaded"))?
        };
        let blob = FirmwareBlob::new(package)?;
        let code = blob.get_firmware_data(firmware, soc)?.to_vec();
        let core = match firmware {
            FirmwareType::H264 | FirmwareType::H264Multi => CoreKind::Vdec1,
            FirmwareType::Vp9Mmu => CoreKind::Hevc,
        };
        self.soc.sim.lock().unwrap().install_firmware(core, code);
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakeSoc {
    inner: Arc<SocInner>,
}

impl Default for FakeSoc {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSoc {
    pub fn new() -> Self {
        let irq = || Arc::new(IrqEvent::new().unwrap());
        Self {
            inner: Arc::new(SocInner {
                env: Env {
                    heap: Arc::new(HeapAllocator::new()),
                    trace: Default::default(),
                    stall_dma: AtomicBool::new(false),
                    stall_parser: AtomicBool::new(false),
                    hang: AtomicBool::new(false),
                    vdec1_irq: irq(),
                    hevc_irq: irq(),
                    parser_irq: irq(),
                    monitor: Default::default(),
                    tee: Default::default(),
                },
                sim: Default::default(),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn banks(&self) -> RegisterBanks {
        let bank = |bank| -> Arc<dyn RegisterIo> {
            Arc::new(FakeBank {
                bank,
                soc: self.inner.clone(),
            })
        };
        RegisterBanks::new(
            bank(Bank::Cbus),
            bank(Bank::Dosbus),
            bank(Bank::Aobus),
            bank(Bank::Hiubus),
            bank(Bank::Dmc),
        )
    }

    pub fn allocator(&self) -> Arc<dyn BufferAllocator> {
        Arc::new(TracedAllocator {
            heap: self.inner.env.heap.clone(),
            trace: self.inner.env.trace.clone(),
        })
    }

    pub fn monitor(&self) -> Arc<dyn SecureMonitor> {
        self.inner.env.monitor.clone()
    }

    pub fn tee(&self) -> Arc<dyn TeeClient> {
        Arc::new(FakeTee {
            soc: self.inner.clone(),
        })
    }

    /// Everything the engine needs to run on this SoC, with `firmware` as the package.
    pub fn platform(&self, firmware: Vec<u8>) -> PlatformResources {
        PlatformResources {
            regs: self.banks(),
            vdec1_irq: self.vdec1_irq(),
            hevc_irq: self.hevc_irq(),
            parser_irq: self.parser_irq(),
            secure_monitor: Some(self.monitor()),
            tee: Some(self.tee()),
            firmware,
        }
    }

    pub fn parser_irq(&self) -> Arc<IrqEvent> {
        self.inner.env.parser_irq.clone()
    }

    pub fn vdec1_irq(&self) -> Arc<IrqEvent> {
        self.inner.env.vdec1_irq.clone()
    }

    pub fn hevc_irq(&self) -> Arc<IrqEvent> {
        self.inner.env.hevc_irq.clone()
    }

    pub fn read_phys(&self, phys: u32, out: &mut [u8]) {
        self.inner.env.read_phys(phys, out)
    }

    pub fn live_regions(&self) -> usize {
        self.inner.env.heap.live_regions()
    }

    pub fn register(&self, reg: Register) -> u32 {
        self.inner.sim.lock().unwrap().get(reg)
    }

    /// Register writes since creation.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// The code last loaded into `core`, padded to whole words.
    pub fn loaded_firmware(&self, core: CoreKind) -> Option<Vec<u8>> {
        self.inner.sim.lock().unwrap().firmware[core.index()].clone()
    }

    pub fn canvas_entry(&self, index: u8) -> Option<CanvasEntry> {
        self.inner.sim.lock().unwrap().canvases.get(&index).copied()
    }

    pub fn trace(&self) -> Vec<TraceEvent> {
        self.inner.env.trace.lock().unwrap().clone()
    }

    pub fn clear_trace(&self) {
        self.inner.env.trace.lock().unwrap().clear()
    }

    /// Keeps every DMA engine busy.
    pub fn stall_dma(&self, stall: bool) {
        self.inner.env.stall_dma.store(stall, Ordering::SeqCst)
    }

    /// Makes the parser ignore fetch commands.
    pub fn stall_parser(&self, stall: bool) {
        self.inner.env.stall_parser.store(stall, Ordering::SeqCst)
    }

    /// Silences the firmware interrupts.
    pub fn hang_firmware(&self, hang: bool) {
        self.inner.env.hang.store(hang, Ordering::SeqCst)
    }

    /// Moves the read cursor of `core` forward, as if the firmware had consumed `len` bytes.
    pub fn consume_input(&self, core: CoreKind, len: u32) {
        self.inner.sim.lock().unwrap().advance(core, len)
    }

    /// The oldest interrupt not taken yet.
    pub fn take_irq(&self) -> Option<CoreKind> {
        self.inner.sim.lock().unwrap().pending_irqs.pop_front()
    }

    /// Bus addresses of the frames decoded by either firmware, in decode order.
    pub fn decoded(&self) -> Vec<u32> {
        self.inner.sim.lock().unwrap().decoded.clone()
    }

    /// Decode commands the VP9 firmware received.
    pub fn decode_commands(&self) -> usize {
        self.inner.sim.lock().unwrap().decode_commands
    }

    pub fn monitor_calls(&self) -> Vec<(ProtectedUnit, bool)> {
        self.inner.env.monitor.calls.lock().unwrap().clone()
    }

    pub fn tee_log(&self) -> MutexGuard<'_, TeeLog> {
        self.inner.env.tee.lock().unwrap()
    }
}

const VDEC1_STREAM_REGS: [Register; 9] = [
    vdec1::VLD_MEM_VIFIFO_START_PTR,
    vdec1::VLD_MEM_VIFIFO_CURR_PTR,
    vdec1::VLD_MEM_VIFIFO_END_PTR,
    vdec1::VLD_MEM_VIFIFO_CONTROL,
    vdec1::VLD_MEM_VIFIFO_WP,
    vdec1::VLD_MEM_VIFIFO_RP,
    vdec1::VLD_MEM_VIFIFO_LEVEL,
    vdec1::VLD_MEM_VIFIFO_BUF_CNTL,
    vdec1::VLD_MEM_VIFIFO_WRAP_COUNT,
];

const HEVC_STREAM_REGS: [Register; 7] = [
    hevc::HEVC_STREAM_CONTROL,
    hevc::HEVC_STREAM_START_ADDR,
    hevc::HEVC_STREAM_END_ADDR,
    hevc::HEVC_STREAM_WR_PTR,
    hevc::HEVC_STREAM_RD_PTR,
    hevc::HEVC_STREAM_FIFO_CTL,
    hevc::HEVC_SHIFT_BYTE_COUNT,
];

fn stream_regs(core: CoreKind) -> &'static [Register] {
    match core {
        CoreKind::Vdec1 => &VDEC1_STREAM_REGS,
        CoreKind::Hevc => &HEVC_STREAM_REGS,
    }
}

/// Cursors of a core's input FIFO, `end` exclusive.
#[derive(Copy, Clone, Debug)]
struct Ring {
    start: u32,
    end: u32,
    rd: u32,
    wr: u32,
}

impl Ring {
    fn size(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    fn level(&self) -> u32 {
        if self.size() == 0 {
            0
        } else if self.wr >= self.rd {
            self.wr - self.rd
        } else {
            self.size() - (self.rd - self.wr)
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct Vp9Model {
    running: bool,
    /// Bytes of the frame under decode, consumed once it is decoded.
    frame_len: Option<u32>,
    /// Reference slots refreshed by the frame under decode, and its size.
    frame: Option<(u8, Resolution)>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum H264Wait {
    StreamInfo,
    Frames,
}

#[derive(Copy, Clone, Debug, Default)]
struct H264Model {
    multi: bool,
    running: bool,
    wait: Option<H264Wait>,
    /// The frame buffers are known.
    configured: bool,
    frame_count: u32,
    /// Frames held outside the firmware.
    busy: u32,
    info: Option<u32>,
    /// Waiting for a frame to be released.
    blocked: bool,
}

#[derive(Copy, Clone, Debug, Default)]
enum Model {
    #[default]
    Idle,
    Vp9(Vp9Model),
    H264(H264Model),
}

impl Model {
    fn for_code(code: &[u8]) -> Self {
        if code.starts_with(VP9_FIRMWARE) {
            Model::Vp9(Default::default())
        } else if code.starts_with(H264_MULTI_FIRMWARE) {
            Model::H264(H264Model {
                multi: true,
                ..Default::default()
            })
        } else if code.starts_with(H264_FIRMWARE) {
            Model::H264(Default::default())
        } else {
            Model::Idle
        }
    }
}

#[derive(Default)]
struct Sim {
    regs: HashMap<Register, u32>,
    canvases: HashMap<u8, CanvasEntry>,
    firmware: [Option<Vec<u8>>; 2],
    models: [Model; 2],
    /// Sizes of the VP9 reference slots, by stream buffer.
    vp9_slots: HashMap<u32, [Option<Resolution>; NUM_REF_FRAMES]>,
    pending_irqs: VecDeque<CoreKind>,
    decoded: Vec<u32>,
    decode_commands: usize,
}

fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(3)
        .position(|w| w == [0, 0, 1])
        .map(|p| p + from)
}

impl Sim {
    fn get(&self, reg: Register) -> u32 {
        self.regs.get(&reg).copied().unwrap_or(0)
    }

    fn set(&mut self, reg: Register, value: u32) {
        self.regs.insert(reg, value);
    }

    fn write(&mut self, env: &Env, reg: Register, value: u32) {
        if reg == parser::PARSER_INT_STATUS {
            let status = self.get(reg) & !value;
            return self.set(reg, status);
        }
        self.set(reg, value);

        match reg {
            vdec1::IMEM_DMA_CTRL if value & vdec1::IMEM_DMA_BUSY != 0 => {
                self.imem_dma(env, CoreKind::Vdec1, value)
            }
            hevc::HEVC_IMEM_DMA_CTRL if value & hevc::IMEM_DMA_BUSY != 0 => {
                self.imem_dma(env, CoreKind::Hevc, value)
            }
            vdec1::VLD_MEM_SWAP_CTRL if value & vdec1::SWAP_ENABLE != 0 => {
                self.swap(env, CoreKind::Vdec1, value & vdec1::SWAP_SAVE != 0)
            }
            hevc::HEVC_STREAM_SWAP_CTRL if value & hevc::SWAP_ENABLE != 0 => {
                self.swap(env, CoreKind::Hevc, value & hevc::SWAP_SAVE != 0)
            }
            vdec1::DOS_MEM_PD_VDEC if value == 0xffff_ffff => self.power_down(CoreKind::Vdec1),
            hevc::DOS_MEM_PD_HEVC if value == 0xffff_ffff => self.power_down(CoreKind::Hevc),
            vdec1::VLD_MEM_VIFIFO_START_PTR => self.set(vdec1::VLD_MEM_VIFIFO_WRAP_COUNT, 0),
            hevc::HEVC_STREAM_START_ADDR => self.set(hevc::HEVC_SHIFT_BYTE_COUNT, 0),
            vdec1::VLD_MEM_VIFIFO_WP => {
                Self::trace_write_pointer(env, CoreKind::Vdec1, value);
                self.h264_input(env);
            }
            hevc::HEVC_STREAM_WR_PTR => Self::trace_write_pointer(env, CoreKind::Hevc, value),
            vdec1::VDEC_ASSIST_MBOX1_CLR_REG => self.set(vdec1::VDEC_ASSIST_MBOX1_IRQ_REG, 0),
            hevc::HEVC_ASSIST_MBOX0_CLR_REG => self.set(hevc::HEVC_ASSIST_MBOX0_IRQ_REG, 0),
            parser::PARSER_FETCH_CMD
                if value & parser::FETCH_CMD_START == parser::FETCH_CMD_START =>
            {
                self.parser_fetch(env, value & parser::FETCH_CMD_LEN_MASK)
            }
            dmc_regs::DMC_CAV_LUT_ADDR if value & dmc_regs::CAV_LUT_WRITE != 0 => {
                self.canvas_write((value & 0xff) as u8)
            }
            hevc::HEVC_MPSR => self.vp9_run(env, value & 1 != 0),
            vp9::DEC_STATUS => self.vp9_command(env, value),
            vdec1::MPSR => self.h264_run(env, value & 1 != 0),
            h264::MAILBOX_COMMAND => self.h264_command(env, value),
            h264::FRAME_RELEASE_A | h264::FRAME_RELEASE_B if value != 0 => {
                self.h264_release(env, reg, value)
            }
            _ => (),
        }
    }

    fn trace_write_pointer(env: &Env, core: CoreKind, addr: u32) {
        env.trace
            .lock()
            .unwrap()
            .push(TraceEvent::WritePointer { core, addr });
    }

    fn install_firmware(&mut self, core: CoreKind, code: Vec<u8>) {
        self.models[core.index()] = Model::for_code(&code);
        self.firmware[core.index()] = Some(code);
    }

    fn imem_dma(&mut self, env: &Env, core: CoreKind, value: u32) {
        if env.stall_dma.load(Ordering::SeqCst) {
            return;
        }
        let (ctrl, addr, count, busy) = match core {
            CoreKind::Vdec1 => (
                vdec1::IMEM_DMA_CTRL,
                vdec1::IMEM_DMA_ADR,
                vdec1::IMEM_DMA_COUNT,
                vdec1::IMEM_DMA_BUSY,
            ),
            CoreKind::Hevc => (
                hevc::HEVC_IMEM_DMA_CTRL,
                hevc::HEVC_IMEM_DMA_ADR,
                hevc::HEVC_IMEM_DMA_COUNT,
                hevc::IMEM_DMA_BUSY,
            ),
        };
        let mut code = vec![0u8; self.get(count) as usize * 4];
        env.read_phys(self.get(addr), &mut code);
        self.install_firmware(core, code);
        self.set(ctrl, value & !busy);
    }

    fn swap(&mut self, env: &Env, core: CoreKind, save: bool) {
        let addr = match core {
            CoreKind::Vdec1 => self.get(vdec1::VLD_MEM_SWAP_ADDR),
            CoreKind::Hevc => self.get(hevc::HEVC_STREAM_SWAP_ADDR),
        };
        let regs = stream_regs(core);
        let mut context = vec![0u8; regs.len() * 4];
        if save {
            for (reg, word) in regs.iter().zip(context.chunks_mut(4)) {
                word.copy_from_slice(&self.get(*reg).to_le_bytes());
            }
            env.write_phys(addr, &context);
        } else {
            env.read_phys(addr, &mut context);
            for (reg, word) in regs.iter().zip(context.chunks(4)) {
                self.set(*reg, u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
            }
        }
    }

    fn power_down(&mut self, core: CoreKind) {
        for reg in stream_regs(core) {
            self.regs.remove(reg);
        }
        self.models[core.index()] = Model::Idle;
        self.firmware[core.index()] = None;
    }

    fn parser_fetch(&mut self, env: &Env, len: u32) {
        if env.stall_parser.load(Ordering::SeqCst) {
            return;
        }
        let mut data = vec![0u8; len as usize];
        env.read_phys(self.get(parser::PARSER_FETCH_ADDR), &mut data);

        let start = self.get(parser::PARSER_VIDEO_START_PTR);
        let end = self.get(parser::PARSER_VIDEO_END_PTR) + 8;
        let mut wp = self.get(parser::PARSER_VIDEO_WP);
        let mut rest = data.as_slice();
        while !rest.is_empty() {
            let chunk = rest.len().min((end - wp) as usize);
            env.write_phys(wp, &rest[..chunk]);
            rest = &rest[chunk..];
            wp += chunk as u32;
            if wp >= end {
                wp = start;
            }
        }
        self.set(parser::PARSER_VIDEO_WP, wp);
        let status = self.get(parser::PARSER_INT_STATUS) | parser::INT_FETCH_DONE;
        self.set(parser::PARSER_INT_STATUS, status);
        env.parser_irq.trigger().unwrap();
    }

    fn canvas_write(&mut self, index: u8) {
        let low = self.get(dmc_regs::DMC_CAV_LUT_DATAL);
        let high = self.get(dmc_regs::DMC_CAV_LUT_DATAH);
        let width = ((low >> 29) & 0x7) | ((high & 0x1ff) << 3);
        self.canvases.insert(
            index,
            CanvasEntry {
                addr: (low & 0x1fff_ffff) << 3,
                stride: width << 3,
                height: (high >> 9) & 0x1fff,
            },
        );
    }

    fn ring(&self, core: CoreKind) -> Ring {
        match core {
            CoreKind::Vdec1 => Ring {
                start: self.get(vdec1::VLD_MEM_VIFIFO_START_PTR),
                end: self.get(vdec1::VLD_MEM_VIFIFO_END_PTR) + 8,
                rd: self.get(vdec1::VLD_MEM_VIFIFO_RP),
                wr: self.get(vdec1::VLD_MEM_VIFIFO_WP),
            },
            CoreKind::Hevc => Ring {
                start: self.get(hevc::HEVC_STREAM_START_ADDR),
                end: self.get(hevc::HEVC_STREAM_END_ADDR) + 8,
                rd: self.get(hevc::HEVC_STREAM_RD_PTR),
                wr: self.get(hevc::HEVC_STREAM_WR_PTR),
            },
        }
    }

    /// The bytes between the read and write cursors of `core`.
    fn fifo_data(&self, env: &Env, core: CoreKind) -> Vec<u8> {
        let ring = self.ring(core);
        let len = ring.level() as usize;
        let mut out = vec![0u8; len];
        let first = len.min((ring.end - ring.rd) as usize);
        env.read_phys(ring.rd, &mut out[..first]);
        if first < len {
            env.read_phys(ring.start, &mut out[first..]);
        }
        out
    }

    fn advance(&mut self, core: CoreKind, len: u32) {
        let ring = self.ring(core);
        let mut rd = ring.rd + len;
        let wrapped = rd >= ring.end;
        if wrapped {
            rd = ring.start + (rd - ring.end);
        }
        match core {
            CoreKind::Vdec1 => {
                self.set(vdec1::VLD_MEM_VIFIFO_RP, rd);
                if wrapped {
                    let count = self.get(vdec1::VLD_MEM_VIFIFO_WRAP_COUNT);
                    self.set(vdec1::VLD_MEM_VIFIFO_WRAP_COUNT, count + 1);
                }
            }
            CoreKind::Hevc => {
                self.set(hevc::HEVC_STREAM_RD_PTR, rd);
                let count = self.get(hevc::HEVC_SHIFT_BYTE_COUNT);
                self.set(hevc::HEVC_SHIFT_BYTE_COUNT, count.wrapping_add(len));
            }
        }
    }

    fn raise(&mut self, env: &Env, core: CoreKind) {
        if env.hang.load(Ordering::SeqCst) {
            return;
        }
        let irq = match core {
            CoreKind::Vdec1 => {
                self.set(vdec1::VDEC_ASSIST_MBOX1_IRQ_REG, 1);
                &env.vdec1_irq
            }
            CoreKind::Hevc => {
                self.set(hevc::HEVC_ASSIST_MBOX0_IRQ_REG, 1);
                &env.hevc_irq
            }
        };
        self.pending_irqs.push_back(core);
        irq.trigger().unwrap();
    }

    fn with_vp9(&mut self, env: &Env, f: impl FnOnce(&mut Self, &Env, &mut Vp9Model)) {
        let Model::Vp9(mut model) = self.models[CoreKind::Hevc.index()] else {
            return;
        };
        f(self, env, &mut model);
        self.models[CoreKind::Hevc.index()] = Model::Vp9(model);
    }

    fn with_h264(&mut self, env: &Env, f: impl FnOnce(&mut Self, &Env, &mut H264Model)) {
        let Model::H264(mut model) = self.models[CoreKind::Vdec1.index()] else {
            return;
        };
        f(self, env, &mut model);
        self.models[CoreKind::Vdec1.index()] = Model::H264(model);
    }

    fn vp9_status(&mut self, env: &Env, status: u32) {
        self.set(vp9::DEC_STATUS, status);
        self.raise(env, CoreKind::Hevc);
    }

    fn vp9_run(&mut self, env: &Env, run: bool) {
        self.with_vp9(env, |sim, env, model| {
            model.running = run;
            if run {
                sim.vp9_scan(env, model);
            }
        })
    }

    fn vp9_command(&mut self, env: &Env, command: u32) {
        self.with_vp9(env, |sim, env, model| match command {
            vp9::COMMAND_ACTION_DONE => {
                if let Some(len) = model.frame_len.take() {
                    sim.advance(CoreKind::Hevc, len);
                }
                if model.running {
                    sim.vp9_scan(env, model);
                }
            }
            vp9::COMMAND_DECODE_SLICE => sim.vp9_decode(env, model),
            _ => (),
        })
    }

    /// Parses the header of the next frame in the FIFO.
    fn vp9_scan(&mut self, env: &Env, model: &mut Vp9Model) {
        let data = self.fifo_data(env, CoreKind::Hevc);
        if data.is_empty() {
            return self.vp9_status(env, vp9::STATUS_INPUT_CONSUMED);
        }
        if data.len() < AML_HEADER_SIZE {
            return self.vp9_status(env, vp9::STATUS_INPUT_STARVED);
        }
        let size = match parse_aml_header(&data) {
            Ok(size) => size,
            Err(_) => {
                // Garbage is skipped.
                self.advance(CoreKind::Hevc, data.len() as u32);
                return self.vp9_status(env, vp9::STATUS_INPUT_CONSUMED);
            }
        };
        if AML_HEADER_SIZE + size > data.len() {
            return self.vp9_status(env, vp9::STATUS_INPUT_STARVED);
        }
        let frame_len = (AML_HEADER_SIZE + size) as u32;
        let Ok(info) = FrameInfo::peek(&data[AML_HEADER_SIZE..AML_HEADER_SIZE + size]) else {
            self.advance(CoreKind::Hevc, frame_len);
            return self.vp9_status(env, vp9::STATUS_INPUT_CONSUMED);
        };

        let stream = self.get(hevc::HEVC_STREAM_START_ADDR);
        let slots = self.vp9_slots.entry(stream).or_default();
        let resolution = match info.size {
            FrameSize::Explicit(resolution) => resolution,
            FrameSize::FromRef(slot) => slots[slot as usize].unwrap_or_default(),
        };
        let params = HardwareRenderParams {
            profile: info.profile,
            show_existing_frame: info.show_existing_frame.is_some(),
            frame_to_show: info.show_existing_frame.unwrap_or(0),
            frame_type: info.frame_type,
            show_frame: info.show_frame,
            error_resilient: info.error_resilient,
            intra_only: info.intra_only,
            refresh_frame_flags: info.refresh_frame_flags,
            width: resolution.width,
            height: resolution.height,
            render_width: resolution.width,
            render_height: resolution.height,
            ref_frame_idx: info.ref_frame_idx,
            ref_frame_sign_bias: info.ref_frame_sign_bias,
            loop_filter: info.loop_filter.clone(),
            bit_depth: info.bit_depth,
        };
        env.write_phys(self.get(vp9::RPM_BUFFER), &params.to_rpm());

        model.frame_len = Some(frame_len);
        model.frame = info
            .needs_output_frame()
            .then_some((info.refresh_frame_flags, resolution));
        self.vp9_status(env, vp9::STATUS_HEADER_DONE);
    }

    fn vp9_decode(&mut self, env: &Env, model: &mut Vp9Model) {
        self.decode_commands += 1;
        let target = self.get(hevc::HEVC_SAO_Y_START_ADDR);
        self.decoded.push(target);
        env.write_phys(target, &(self.decoded.len() as u32).to_le_bytes());

        if let Some(len) = model.frame_len.take() {
            self.advance(CoreKind::Hevc, len);
        }
        if let Some((refresh, resolution)) = model.frame.take() {
            let stream = self.get(hevc::HEVC_STREAM_START_ADDR);
            let slots = self.vp9_slots.entry(stream).or_default();
            for (i, slot) in slots.iter_mut().enumerate() {
                if refresh & (1 << i) != 0 {
                    *slot = Some(resolution);
                }
            }
        }
        self.vp9_status(env, vp9::STATUS_FRAME_DECODED);
    }

    fn h264_mailbox(&mut self, env: &Env, model: &mut H264Model, command: u32) {
        self.set(h264::MAILBOX_COMMAND, command);
        if command == h264::CMD_INPUT_CONSUMED || command == h264::CMD_FATAL_ERROR {
            model.running = false;
        }
        self.raise(env, CoreKind::Vdec1);
    }

    fn h264_run(&mut self, env: &Env, run: bool) {
        self.with_h264(env, |sim, env, model| {
            model.running = run;
            if !run {
                return;
            }
            let restored = sim.get(h264::RESTORE_FRAME_COUNT);
            if !model.configured && restored != 0 {
                model.configured = true;
                model.frame_count = restored;
                model.busy = sim.get(h264::RESTORE_BUSY_MASK);
            }
            sim.h264_scan(env, model);
        })
    }

    fn h264_input(&mut self, env: &Env) {
        self.with_h264(env, |sim, env, model| sim.h264_scan(env, model))
    }

    fn h264_command(&mut self, env: &Env, value: u32) {
        self.with_h264(env, |sim, env, model| match model.wait {
            Some(H264Wait::StreamInfo) if value != 0 => {
                model.wait = None;
                model.configured = true;
                model.frame_count = (value >> 16) & 0xff;
                model.busy = 0;
                sim.h264_scan(env, model);
            }
            Some(H264Wait::Frames) if value == 0 => {
                model.wait = None;
                sim.h264_scan(env, model);
            }
            _ => (),
        })
    }

    fn h264_release(&mut self, env: &Env, reg: Register, value: u32) {
        self.set(reg, 0);
        self.with_h264(env, |sim, env, model| {
            model.busy &= !(1 << (value - 1));
            if model.blocked {
                model.blocked = false;
                sim.h264_scan(env, model);
            }
        })
    }

    /// Stream offset of the byte `pos` bytes past the read cursor.
    fn h264_stream_offset(&self, pos: usize) -> u32 {
        let ring = self.ring(CoreKind::Vdec1);
        let wraps = self.get(vdec1::VLD_MEM_VIFIFO_WRAP_COUNT) as u64;
        (wraps * ring.size() as u64 + (ring.rd - ring.start) as u64 + pos as u64) as u32
    }

    /// Runs through the NAL units in the FIFO until one needs the driver.
    fn h264_scan(&mut self, env: &Env, model: &mut H264Model) {
        while model.running && model.wait.is_none() && !model.blocked {
            let data = self.fifo_data(env, CoreKind::Vdec1);
            let nal_start = match find_start_code(&data, 0) {
                Some(code) if code + 3 < data.len() => code + 3,
                _ => {
                    self.advance(CoreKind::Vdec1, data.len() as u32);
                    if model.multi {
                        self.h264_mailbox(env, model, h264::CMD_INPUT_CONSUMED);
                    }
                    return;
                }
            };
            let nal_end = find_start_code(&data, nal_start).unwrap_or(data.len());
            let nal = &data[nal_start..nal_end];

            match nal[0] & 0x1f {
                // Sequence parameter set, reduced to the geometry.
                7 => {
                    let info = nal.get(1).copied().unwrap_or(0) as u32
                        | (nal.get(2).copied().unwrap_or(0) as u32) << 8
                        | (nal.get(3).copied().unwrap_or(0) as u32) << 16;
                    self.advance(CoreKind::Vdec1, nal_end as u32);
                    let known = model.info.map_or(true, |known| known == info);
                    model.info = Some(info);
                    if model.configured && known {
                        continue;
                    }
                    model.configured = false;
                    model.wait = Some(H264Wait::StreamInfo);
                    self.set(h264::MAILBOX_ARG, info);
                    return self.h264_mailbox(env, model, h264::CMD_INITIALIZE_STREAM);
                }
                1 | 5 if model.configured => {
                    let Some(index) = (0..model.frame_count).find(|i| model.busy & (1 << i) == 0)
                    else {
                        model.blocked = true;
                        return;
                    };
                    let offset = self.h264_stream_offset(nal_start - 3);
                    self.advance(CoreKind::Vdec1, nal_end as u32);
                    model.busy |= 1 << index;

                    let canvas = self.get(vdec1::ANC0_CANVAS_ADDR.at(index)) & 0xff;
                    if let Some(entry) = self.canvases.get(&(canvas as u8)).copied() {
                        self.decoded.push(entry.addr);
                        env.write_phys(entry.addr, &(self.decoded.len() as u32).to_le_bytes());
                    }
                    self.set(h264::MAILBOX_ARG, 1);
                    self.set(h264::FRAME_INDEX, index);
                    self.set(h264::FRAME_OFFSET, offset);
                    model.wait = Some(H264Wait::Frames);
                    return self.h264_mailbox(env, model, h264::CMD_NEW_FRAMES);
                }
                // Reserved type, standing for a stream the firmware gives up on.
                31 => {
                    self.advance(CoreKind::Vdec1, nal_end as u32);
                    return self.h264_mailbox(env, model, h264::CMD_FATAL_ERROR);
                }
                _ => self.advance(CoreKind::Vdec1, nal_end as u32),
            }
        }
    }
}

/// How [`TestClient`] answers frame requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocationMode {
    Allocate,
    Defer,
    Fail,
}

/// Delivered frames of several clients, as `(tag, bus address)`.
pub type OrderLog = Arc<Mutex<Vec<(u32, u32)>>>;

pub struct ClientState {
    pub frames: Vec<DecodedFrame>,
    pub errors: Vec<DecodeError>,
    pub input_needed: usize,
    pub end_of_stream: usize,
    pub requests: Vec<FrameRequest>,
    pub mode: AllocationMode,
    pub free_output: bool,
    allocator: Option<Arc<dyn BufferAllocator>>,
    order: Option<(u32, OrderLog)>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
            input_needed: 0,
            end_of_stream: 0,
            requests: Vec::new(),
            mode: AllocationMode::Allocate,
            free_output: true,
            allocator: None,
            order: None,
        }
    }
}

/// A client recording everything it is told. Clones share their state.
#[derive(Clone, Default)]
pub struct TestClient {
    state: Arc<Mutex<ClientState>>,
}

impl TestClient {
    /// A client allocating its frames from `allocator`.
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        let client = Self::default();
        client.state().allocator = Some(allocator);
        client
    }

    /// Also records delivered frames in `log` under `tag`.
    pub fn logging_to(self, tag: u32, log: &OrderLog) -> Self {
        self.state().order = Some((tag, log.clone()));
        self
    }

    pub fn boxed(&self) -> Box<dyn DecoderClient> {
        Box::new(self.clone())
    }

    pub fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap()
    }

    pub fn set_free_output(&self, free: bool) {
        self.state().free_output = free;
    }

    pub fn set_allocation(&self, mode: AllocationMode) {
        self.state().mode = mode;
    }

    pub fn frame_count(&self) -> usize {
        self.state().frames.len()
    }

    pub fn last_frame(&self) -> Option<DecodedFrame> {
        self.state().frames.last().cloned()
    }

    /// Buffers satisfying `request`.
    pub fn allocate(&self, request: &FrameRequest) -> Vec<Buffer> {
        let allocator = self
            .state()
            .allocator
            .clone()
            .expect("client without an allocator");
        (0..request.count)
            .map(|_| {
                let request = AllocationRequest::new("client frame", request.size)
                    .protected(request.protected.then_some(ProtectedUnit::Hevc));
                allocator.allocate(&request).unwrap()
            })
            .collect()
    }
}

impl DecoderClient for TestClient {
    fn on_frame_ready(&mut self, frame: DecodedFrame) {
        let mut state = self.state();
        if let Some((tag, log)) = &state.order {
            log.lock().unwrap().push((*tag, frame.buffer.phys_base()));
        }
        state.frames.push(frame);
    }

    fn on_error(&mut self, error: DecodeError) {
        self.state().errors.push(error);
    }

    fn on_input_needed(&mut self) {
        self.state().input_needed += 1;
    }

    fn on_end_of_stream(&mut self) {
        self.state().end_of_stream += 1;
    }

    fn has_free_output(&self) -> bool {
        self.state().free_output
    }

    fn initialize_frames(&mut self, request: &FrameRequest) -> FrameAllocation {
        let (mode, has_allocator) = {
            let mut state = self.state();
            state.requests.push(request.clone());
            (state.mode, state.allocator.is_some())
        };
        match mode {
            AllocationMode::Allocate if has_allocator => {
                FrameAllocation::Ready(self.allocate(request))
            }
            AllocationMode::Allocate | AllocationMode::Fail => FrameAllocation::Failed,
            AllocationMode::Defer => FrameAllocation::Deferred,
        }
    }
}

/// Writes bits MSB first.
pub struct BitWriter {
    out: Vec<u8>,
    nth_bit: u8,
    curr_byte: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            out: Vec::new(),
            nth_bit: 0,
            curr_byte: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit)
    pub fn write_f(&mut self, bits: usize, value: u32) {
        assert!(bits <= 32, "invalid bit count {}", bits);
        for bit in (0..bits).rev() {
            self.write_bit(value & (1 << bit) != 0);
        }
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.push(self.curr_byte);
            self.nth_bit = 0;
            self.curr_byte = 0;
        }
    }

    /// Outputs the cached bits, zero padded.
    pub fn finish(mut self) -> Vec<u8> {
        if self.nth_bit != 0 {
            self.out.push(self.curr_byte);
        }
        self.out
    }
}

/// Builds VP9 frames whose uncompressed header carries the given fields. The compressed part is
/// a few bytes of filler.
pub struct Vp9FrameBuilder {
    show_existing: Option<u8>,
    frame_type: FrameType,
    show_frame: bool,
    refresh: u8,
    refs: [u8; 3],
    size: Resolution,
    size_from_ref: Option<usize>,
    loop_filter: (u8, u8),
}

impl Vp9FrameBuilder {
    fn new(frame_type: FrameType) -> Self {
        Self {
            show_existing: None,
            frame_type,
            show_frame: true,
            refresh: 0xff,
            refs: [0, 1, 2],
            size: Resolution::from((64, 64)),
            size_from_ref: None,
            loop_filter: (0, 0),
        }
    }

    pub fn keyframe(width: u32, height: u32) -> Self {
        Self {
            size: Resolution::from((width, height)),
            ..Self::new(FrameType::KeyFrame)
        }
    }

    pub fn inter(refs: [u8; 3], refresh: u8) -> Self {
        Self {
            refs,
            refresh,
            ..Self::new(FrameType::InterFrame)
        }
    }

    pub fn show_existing(slot: u8) -> Self {
        Self {
            show_existing: Some(slot),
            ..Self::new(FrameType::InterFrame)
        }
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.size = Resolution::from((width, height));
        self
    }

    /// Takes the size of the reference at position `position` of the reference list.
    pub fn size_from_ref(mut self, position: usize) -> Self {
        self.size_from_ref = Some(position);
        self
    }

    pub fn loop_filter(mut self, level: u8, sharpness: u8) -> Self {
        self.loop_filter = (level, sharpness);
        self
    }

    fn write_size(&self, w: &mut BitWriter) {
        w.write_f(16, self.size.width - 1);
        w.write_f(16, self.size.height - 1);
        // No render size.
        w.write_bit(false);
    }

    pub fn build(&self) -> Vec<u8> {
        let mut w = BitWriter::new();
        // Frame marker, profile 0.
        w.write_f(2, 2);
        w.write_f(2, 0);

        if let Some(slot) = self.show_existing {
            w.write_bit(true);
            w.write_f(3, slot as u32);
            return w.finish();
        }
        w.write_bit(false);
        w.write_bit(self.frame_type == FrameType::InterFrame);
        w.write_bit(self.show_frame);
        // error_resilient_mode
        w.write_bit(false);

        match self.frame_type {
            FrameType::KeyFrame => {
                w.write_f(24, 0x49_83_42);
                // BT.601, studio range.
                w.write_f(3, 1);
                w.write_bit(false);
                self.write_size(&mut w);
            }
            FrameType::InterFrame => {
                if !self.show_frame {
                    // intra_only
                    w.write_bit(false);
                }
                // reset_frame_context
                w.write_f(2, 0);
                w.write_f(8, self.refresh as u32);
                for &slot in &self.refs {
                    w.write_f(3, slot as u32);
                    w.write_bit(false);
                }
                match self.size_from_ref {
                    Some(position) => {
                        for i in 0..=position {
                            w.write_bit(i == position);
                        }
                        w.write_bit(false);
                    }
                    None => {
                        for _ in 0..3 {
                            w.write_bit(false);
                        }
                        self.write_size(&mut w);
                    }
                }
                // allow_high_precision_mv, switchable interpolation filter
                w.write_bit(true);
                w.write_bit(true);
            }
        }

        // refresh_frame_context, frame_parallel_decoding_mode, frame_context_idx
        w.write_f(2, 0);
        w.write_f(2, 0);
        w.write_f(6, self.loop_filter.0 as u32);
        w.write_f(3, self.loop_filter.1 as u32);
        // No loop filter deltas.
        w.write_bit(false);
        // base_q_idx
        w.write_f(8, 60);

        let mut frame = w.finish();
        frame.extend_from_slice(&[0x5a; 8]);
        frame
    }
}

/// A sequence parameter set as understood by the simulated H.264 firmware: the geometry in
/// macroblocks and the reference frame count.
pub fn h264_sps(mb_width: u8, mb_height: u8, max_dpb: u8) -> Vec<u8> {
    vec![0, 0, 0, 1, 0x67, mb_width, mb_height, max_dpb]
}

/// A picture slice, IDR or not.
pub fn h264_picture(idr: bool) -> Vec<u8> {
    let header = if idr { 0x65 } else { 0x41 };
    vec![0, 0, 0, 1, header, 0x88, 0x84, 0x21, 0x7f]
}

/// A NAL unit the simulated firmware treats as a fatal error.
pub fn h264_poison() -> Vec<u8> {
    vec![0, 0, 0, 1, 0x1f, 0xff]
}
