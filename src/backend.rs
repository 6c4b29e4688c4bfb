// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoder implementations shipped with this crate.
//!
//! Real encoders (software codecs, VAAPI or V4L2 hardware) live outside of this crate and plug in
//! through [`crate::encoder::VideoEncoder`]. This module only hosts encoders that are useful to
//! exercise the sender itself.

pub mod dummy;
