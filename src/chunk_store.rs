/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The DoubleBufferedChunkStore, which stages demuxed chunks for the decoder
//! job and enforces the prefetch/rotation discipline.

use crate::access_unit::{AccessUnit, AccessUnitChunk, MediaConfig};

/// Selects one of the two chunk slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSelector {
    /// The slot units are currently consumed from.
    Active,
    /// The slot new prefetches land in.
    Inactive,
}

#[derive(Debug, Default)]
struct Slot {
    chunk: Option<AccessUnitChunk>,
    cursor: usize,
}

impl Slot {
    fn unread(&self) -> usize {
        self.chunk
            .as_ref()
            .map_or(0, |c| c.units.len().saturating_sub(self.cursor))
    }

    fn current(&self) -> Option<&AccessUnit> {
        self.chunk.as_ref().and_then(|c| c.units.get(self.cursor))
    }
}

/// Holds exactly two access-unit chunks, an active index and one read cursor
/// per slot.
///
/// The inactive slot is always the target of a new prefetch. Rotation from
/// inactive to active happens only when the active slot's cursor has been
/// advanced past its last unit, never on a mere read.
#[derive(Debug, Default)]
pub struct DoubleBufferedChunkStore {
    slots: [Slot; 2],
    active: usize,
    prefetch_outstanding: bool,
}

impl DoubleBufferedChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_unread_unit(&self, selector: SlotSelector) -> bool {
        self.slot(selector).unread() > 0
    }

    /// True when either slot still has an unread unit.
    pub fn has_current_unit(&self) -> bool {
        self.has_unread_unit(SlotSelector::Active) || self.has_unread_unit(SlotSelector::Inactive)
    }

    /// The next unit to consume.
    ///
    /// When the active slot is exhausted this transparently reads from the
    /// inactive slot without rotating; the rotation is deferred until the
    /// cursor is actually advanced past the boundary.
    pub fn current_unit(&self) -> Option<&AccessUnit> {
        if self.has_unread_unit(SlotSelector::Active) {
            self.slot(SlotSelector::Active).current()
        } else {
            self.slot(SlotSelector::Inactive).current()
        }
    }

    /// Config descriptor of the chunk the current unit belongs to.
    pub fn current_chunk_config(&self) -> Option<&MediaConfig> {
        let selector = if self.has_unread_unit(SlotSelector::Active) {
            SlotSelector::Active
        } else {
            SlotSelector::Inactive
        };
        self.slot(selector)
            .chunk
            .as_ref()
            .and_then(|c| c.config.as_ref())
    }

    /// Advances the read cursor past the current unit, rotating first when
    /// the active slot is exhausted.
    pub fn advance_cursor(&mut self) {
        if !self.has_unread_unit(SlotSelector::Active) {
            if !self.has_unread_unit(SlotSelector::Inactive) {
                return;
            }
            self.rotate();
        }
        self.slots[self.active].cursor += 1;
    }

    /// Swaps the active and inactive slots and resets the new active cursor.
    pub fn rotate(&mut self) {
        self.active ^= 1;
        self.slots[self.active].cursor = 0;
    }

    /// Marks the inactive slot as the target of an outstanding prefetch.
    ///
    /// Returns false when a prefetch is already outstanding: the caller must
    /// not issue a duplicate demuxer pull, only update which completion
    /// callback fires.
    pub fn begin_prefetch(&mut self) -> bool {
        if self.prefetch_outstanding {
            return false;
        }
        self.prefetch_outstanding = true;
        true
    }

    pub fn prefetch_outstanding(&self) -> bool {
        self.prefetch_outstanding
    }

    /// Lands a fulfilled demuxer pull in the inactive slot.
    pub fn deliver_chunk(&mut self, chunk: AccessUnitChunk) {
        let inactive = self.active ^ 1;
        self.slots[inactive] = Slot {
            chunk: Some(chunk),
            cursor: 0,
        };
        self.prefetch_outstanding = false;
    }

    pub fn cancel_prefetch(&mut self) {
        self.prefetch_outstanding = false;
    }

    /// Drops both chunks and their cursors. Used when the stream is flushed.
    pub fn reset(&mut self) {
        self.slots = [Slot::default(), Slot::default()];
        self.active = 0;
    }

    fn slot(&self, selector: SlotSelector) -> &Slot {
        match selector {
            SlotSelector::Active => &self.slots[self.active],
            SlotSelector::Inactive => &self.slots[self.active ^ 1],
        }
    }
}
