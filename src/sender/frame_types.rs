// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

use crate::encoder::FrameType;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("stream index {index} out of range for {len} streams")]
pub struct StreamIndexError {
    pub index: usize,
    pub len: usize,
}

/// The frame type requested for the next frame of every simulcast stream.
///
/// The schedule is only resized by [`FrameTypeSchedule::reset`] on codec registration. Out of
/// range accesses are errors, never implicit growth, as an encode call may be running on a copy
/// of the schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameTypeSchedule {
    types: Vec<FrameType>,
    /// Bumped on every reset so copies taken before a codec switch can be told apart.
    generation: u64,
}

impl Default for FrameTypeSchedule {
    fn default() -> Self {
        Self {
            types: vec![FrameType::Delta],
            generation: 0,
        }
    }
}

impl FrameTypeSchedule {
    pub fn new() -> Self {
        Default::default()
    }

    /// Resizes the schedule to `stream_count` streams (at least one) and requests a key frame on
    /// each of them.
    pub fn reset(&mut self, stream_count: usize) {
        self.types.clear();
        self.types.resize(stream_count.max(1), FrameType::Key);
        self.generation = self.generation.wrapping_add(1);
    }

    /// Changes on every [`FrameTypeSchedule::reset`].
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn as_slice(&self) -> &[FrameType] {
        &self.types
    }

    pub fn get(&self, index: usize) -> Option<FrameType> {
        self.types.get(index).copied()
    }

    pub fn check_index(&self, index: usize) -> Result<(), StreamIndexError> {
        if index >= self.types.len() {
            return Err(StreamIndexError {
                index,
                len: self.types.len(),
            });
        }
        Ok(())
    }

    pub fn set(&mut self, index: usize, frame_type: FrameType) -> Result<(), StreamIndexError> {
        self.check_index(index)?;
        self.types[index] = frame_type;
        Ok(())
    }

    pub fn request_key_frame(&mut self, index: usize) -> Result<(), StreamIndexError> {
        self.set(index, FrameType::Key)
    }

    /// Downgrades every stream to [`FrameType::Delta`] whose entry still equals what `encoded`
    /// (a copy taken before the encode call) carried. Requests that arrived during the encode
    /// survive, and nothing changes if the schedule was reset since the copy was taken.
    pub fn clear_satisfied(&mut self, encoded: &FrameTypeSchedule) {
        if encoded.generation != self.generation {
            return;
        }

        for (current, used) in self.types.iter_mut().zip(encoded.types.iter()) {
            if current == used {
                *current = FrameType::Delta;
            }
        }
    }
}
