// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared memory layout of one relay namespace.
//
// Everything lives in a single segment at fixed offsets, so processes only
// ever share names and offsets, never addresses. A zero-filled segment is a
// valid empty registry: booleans are u32 and the leader is stored as
// `slot + 1`.

pub const CHANNEL_COUNT: usize = 16;
pub const NOTES_PER_TABLE: usize = 128;
pub const MAX_NOTES: usize = 128;

/// Index of a slot, equal to the channel number it stands for.
pub type SlotIndex = usize;

pub type Pid = i32;

/// A table of one frequency (Hz) per MIDI note.
pub type FrequencyTable = [f64; NOTES_PER_TABLE];

/// Request from a slot occupant to the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingAction {
    #[default]
    None,
    EnableRelay,
    DisableRelay,
}

impl PendingAction {
    fn to_raw(self) -> u32 {
        match self {
            PendingAction::None => 0,
            PendingAction::EnableRelay => 1,
            PendingAction::DisableRelay => 2,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => PendingAction::EnableRelay,
            2 => PendingAction::DisableRelay,
            _ => PendingAction::None,
        }
    }
}

/// One sounding note, published for other instances to display.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NoteRecord {
    pub frequency: f64,
    pub amplitude: f32,
    pub note: u8,
    pub velocity: u8,
    pub channel: u8,
}

/// 12-TET, A4 = 440 Hz.
pub fn equal_temperament() -> FrequencyTable {
    std::array::from_fn(|n| 440.0 * 2f64.powf((n as f64 - 69.0) / 12.0))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Copy of one registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slot {
    pub occupied: bool,
    pub owner_pid: Pid,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SlotData {
    occupied: u32,
    owner_pid: i32,
}

#[repr(C)]
pub(crate) struct RegistryData {
    leader: u32,
    retired: u32,
    slots: [SlotData; CHANNEL_COUNT],
}

impl RegistryData {
    pub(crate) fn slot(&self, idx: SlotIndex) -> Slot {
        let s = self.slots[idx];
        Slot {
            occupied: s.occupied != 0,
            owner_pid: s.owner_pid,
        }
    }

    pub(crate) fn occupy(&mut self, idx: SlotIndex, pid: Pid) {
        self.slots[idx] = SlotData {
            occupied: 1,
            owner_pid: pid,
        };
    }

    pub(crate) fn vacate(&mut self, idx: SlotIndex) {
        self.slots[idx] = SlotData {
            occupied: 0,
            owner_pid: 0,
        };
    }

    pub(crate) fn leader(&self) -> Option<SlotIndex> {
        match self.leader as usize {
            0 => None,
            n if n <= CHANNEL_COUNT => Some(n - 1),
            // Garbage from a corrupted segment reads as "no leader".
            _ => None,
        }
    }

    pub(crate) fn set_leader(&mut self, leader: Option<SlotIndex>) {
        self.leader = leader.map_or(0, |s| s as u32 + 1);
    }

    pub(crate) fn retired(&self) -> bool {
        self.retired != 0
    }

    pub(crate) fn retire(&mut self) {
        self.retired = 1;
    }

    pub(crate) fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            leader: self.leader(),
            retired: self.retired(),
            slots: std::array::from_fn(|i| self.slot(i)),
        }
    }

    #[cfg(test)]
    pub(crate) fn zeroed() -> Box<Self> {
        Box::new(RegistryData {
            leader: 0,
            retired: 0,
            slots: [SlotData {
                occupied: 0,
                owner_pid: 0,
            }; CHANNEL_COUNT],
        })
    }
}

/// Copy of the whole registry, taken under its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub leader: Option<SlotIndex>,
    pub retired: bool,
    pub slots: [Slot; CHANNEL_COUNT],
}

impl RegistrySnapshot {
    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| s.occupied).count()
    }
}

// ---------------------------------------------------------------------------
// Per-channel blocks
// ---------------------------------------------------------------------------

#[repr(C)]
pub(crate) struct TuningBlock {
    pending: u32,
    dirty: u32,
    frequencies: FrequencyTable,
}

impl TuningBlock {
    pub(crate) fn pending(&self) -> PendingAction {
        PendingAction::from_raw(self.pending)
    }

    pub(crate) fn set_pending(&mut self, action: PendingAction) {
        self.pending = action.to_raw();
    }

    pub(crate) fn dirty(&self) -> bool {
        self.dirty != 0
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty as u32;
    }

    pub(crate) fn frequencies(&self) -> &FrequencyTable {
        &self.frequencies
    }

    pub(crate) fn set_frequencies(&mut self, freqs: &FrequencyTable) {
        self.frequencies = *freqs;
    }

    /// State of a freshly claimed channel.
    pub(crate) fn reset(&mut self) {
        self.frequencies = equal_temperament();
        self.dirty = 0;
        self.set_pending(PendingAction::EnableRelay);
    }

    pub(crate) fn snapshot(&self) -> TuningSnapshot {
        TuningSnapshot {
            pending: self.pending(),
            dirty: self.dirty(),
            frequencies: self.frequencies,
        }
    }
}

/// Copy of a channel tuning block, taken under its lock.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningSnapshot {
    pub pending: PendingAction,
    pub dirty: bool,
    pub frequencies: FrequencyTable,
}

#[repr(C)]
pub(crate) struct NotesBlock {
    len: u32,
    notes: [NoteRecord; MAX_NOTES],
}

impl NotesBlock {
    pub(crate) fn notes(&self) -> &[NoteRecord] {
        let len = (self.len as usize).min(MAX_NOTES);
        &self.notes[..len]
    }

    /// Overwrite the published notes. Returns how many were dropped.
    pub(crate) fn publish(&mut self, notes: &[NoteRecord]) -> usize {
        let len = notes.len().min(MAX_NOTES);
        self.notes[..len].copy_from_slice(&notes[..len]);
        self.len = len as u32;
        notes.len() - len
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }
}

/// The whole segment.
#[repr(C)]
pub(crate) struct SharedLayout {
    pub(crate) registry: RegistryData,
    pub(crate) tuning: [TuningBlock; CHANNEL_COUNT],
    pub(crate) notes: [NotesBlock; CHANNEL_COUNT],
}

pub(crate) const SEGMENT_SIZE: usize = std::mem::size_of::<SharedLayout>();
