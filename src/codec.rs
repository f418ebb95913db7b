// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream helpers the decoders need on the CPU side. The hardware parses everything else.

pub mod vp9;
