// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vdec-fw, a tool to inspect firmware packages. Lists the images of a package, and extracts the
//! microcode of one of them.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use amlvdec::firmware::FirmwareBlob;
use amlvdec::firmware::FirmwareType;
use amlvdec::SocKind;
use anyhow::anyhow;
use anyhow::Context;
use argh::FromArgs;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
struct FirmwareArg(FirmwareType);

impl FromStr for FirmwareArg {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" => Ok(FirmwareArg(FirmwareType::H264)),
            "h264-multi" => Ok(FirmwareArg(FirmwareType::H264Multi)),
            "vp9" | "vp9-mmu" => Ok(FirmwareArg(FirmwareType::Vp9Mmu)),
            _ => Err("unrecognized firmware. Valid values: h264, h264-multi, vp9"),
        }
    }
}

/// Inspect a video decoder firmware package
#[derive(Debug, FromArgs)]
struct Args {
    /// firmware package
    #[argh(positional)]
    input: PathBuf,

    /// name of the image to extract, as listed
    #[argh(option)]
    name: Option<String>,

    /// firmware to extract for the selected SoC (h264, h264-multi or vp9)
    #[argh(option)]
    firmware: Option<FirmwareArg>,

    /// the SoC the firmware is selected for. Default: g12a
    #[argh(option, default = "SocKind::G12a")]
    soc: SocKind,

    /// file to write the extracted microcode to
    #[argh(option)]
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let mut data = Vec::new();
    File::open(&args.input)
        .and_then(|mut f| f.read_to_end(&mut data))
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let blob = FirmwareBlob::new(data).context("invalid firmware package")?;
    log::debug!("{} images in {}", blob.images().len(), args.input.display());

    let name = match (args.name, args.firmware) {
        (Some(_), Some(_)) => return Err(anyhow!("--name and --firmware are exclusive")),
        (Some(name), None) => name,
        (None, Some(FirmwareArg(firmware))) => firmware.name(args.soc).to_owned(),
        (None, None) => {
            for info in blob.images() {
                println!("{}", info);
            }
            return Ok(());
        }
    };

    let (info, code) = blob.find(&name)?;
    println!("{}", info);
    match args.output {
        Some(path) => File::create(&path)
            .and_then(|mut f| f.write_all(code))
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{} code bytes, checksum {:#010x}", code.len(), info.checksum),
    }

    Ok(())
}
