//! Lock word encodings.
//!
//! Every view is a transparent newtype over the raw word value. Views convert
//! into each other freely with `From`, no validation is performed: callers
//! test the shape and binding bits first and then reinterpret.
//!
//! Words are always carried as `u64`. On the [`WordLayout::Split32`] layout
//! only the low 32 bits are ever populated.

use std::{fmt, num::NonZeroU64};

use easy_bitfield::*;

use crate::object_model::header::ObjectHeader;

/// 0 = lightweight (thin or biased), 1 = inflated.
pub type ShapeField = BitField<u64, bool, 0, 1, false>;
/// Inflated: 1 = bound to a monitor. Lightweight: 1 = biased.
pub type MiscBitField = BitField<u64, bool, { ShapeField::NEXT_BIT }, 1, false>;
pub type RecursionCountField = BitField<u64, u64, { MiscBitField::NEXT_BIT }, 6, false>;
pub type LockOwnerField = BitField<u64, u64, { RecursionCountField::NEXT_BIT }, 24, false>;
/// Hashcode carried in the upper half of a 64-bit misc word.
pub type WideHashcodeField = BitField<u64, u64, { LockOwnerField::NEXT_BIT }, 32, false>;
/// Hashcode carried in a 32-bit hash word, right above the status bits.
pub type SplitHashcodeField = BitField<u64, u64, { MiscBitField::NEXT_BIT }, 30, false>;

pub const SHAPE_BIT: u64 = 0b01;
pub const MISC_BIT: u64 = 0b10;
pub const STATUS_MASK: u64 = SHAPE_BIT | MISC_BIT;

/// Largest recursion count a lightweight word can carry.
pub const MAX_RECURSION_COUNT: u32 = (1 << 6) - 1;
/// Largest thread id a lightweight word can carry.
pub const MAX_LOCK_OWNER_ID: u32 = (1 << 24) - 1;

/// Reference to a heavyweight monitor as stored in a bound lock word.
///
/// Packed as `(index + 1) << 2` where `index` is the position of the monitor in
/// its manager's table. The packed value is never zero and never has a status
/// bit set.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorHandle(NonZeroU64);

impl MonitorHandle {
    /// Largest table index whose handle still fits a 32-bit word.
    pub const MAX_SPLIT32_INDEX: usize = (u32::MAX >> 2) as usize - 1;

    pub fn from_index(index: usize) -> Self {
        let packed = (index as u64 + 1) << 2;
        match NonZeroU64::new(packed) {
            Some(packed) => Self(packed),
            None => unreachable!("monitor index {index} overflows a lock word"),
        }
    }

    pub fn index(self) -> usize {
        ((self.0.get() >> 2) - 1) as usize
    }

    pub fn to_word(self) -> u64 {
        self.0.get()
    }

    /// Mask off the status bits of `word` and reinterpret the rest.
    pub fn from_word(word: u64) -> Option<Self> {
        NonZeroU64::new(word & !STATUS_MASK).map(Self)
    }
}

impl fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MonitorHandle(#{})", self.index())
    }
}

macro_rules! lockword_view {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[repr(transparent)]
            #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
            pub struct $name(u64);

            impl $name {
                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                pub const fn raw(self) -> u64 {
                    self.0
                }

                pub const fn is_zero(self) -> bool {
                    self.0 == 0
                }

                pub fn is_inflated(self) -> bool {
                    ShapeField::decode(self.0)
                }
            }

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!(stringify!($name), "({:#x})"), self.0)
                }
            }

            impl From<u64> for $name {
                fn from(raw: u64) -> Self {
                    Self(raw)
                }
            }

            impl From<$name> for u64 {
                fn from(word: $name) -> u64 {
                    word.0
                }
            }
        )*
    };
}

macro_rules! lockword_conversions {
    ($from:ident => $($to:ident),*) => {
        $(
            impl From<$from> for $to {
                fn from(word: $from) -> Self {
                    Self(word.0)
                }
            }
        )*
    };
}

lockword_view! {
    /// A lock word whose mode is not yet known.
    ModalLockword,
    /// Inflated lock word: either unbound (carrying a hashcode) or bound to a monitor.
    InflatedMonitorLockword,
    /// Any word that carries an identity hashcode.
    HashableLockword,
    /// Thin lock word: owner thread id and recursion count.
    ThinLockword,
    /// Biased lock word. Only exists on the 64-bit layout.
    BiasedLockword,
}

lockword_conversions!(ModalLockword => InflatedMonitorLockword, HashableLockword, ThinLockword, BiasedLockword);
lockword_conversions!(InflatedMonitorLockword => ModalLockword, HashableLockword);
lockword_conversions!(HashableLockword => ModalLockword, InflatedMonitorLockword, ThinLockword, BiasedLockword);
lockword_conversions!(ThinLockword => ModalLockword, HashableLockword);
lockword_conversions!(BiasedLockword => ModalLockword, HashableLockword);

impl ModalLockword {
    pub fn is_bound(self) -> bool {
        InflatedMonitorLockword::from(self).is_bound()
    }
}

impl InflatedMonitorLockword {
    pub fn is_bound(self) -> bool {
        self.0 & STATUS_MASK == STATUS_MASK
    }

    pub fn bound_from_monitor(handle: MonitorHandle) -> Self {
        Self(handle.to_word() | STATUS_MASK)
    }

    pub const fn bound_from_zero() -> Self {
        Self(STATUS_MASK)
    }

    /// Monitor referenced by a bound word.
    ///
    /// # Panics
    ///
    /// Panics when the word is bound but carries no reference, which only
    /// happens for a corrupted header.
    pub fn get_bound_monitor(self) -> MonitorHandle {
        debug_assert!(self.is_bound(), "{self:?} is not bound");
        match MonitorHandle::from_word(self.0) {
            Some(handle) => handle,
            None => panic!("bound lock word {self:?} does not reference a monitor"),
        }
    }

    pub fn unbound_from_hashcode(layout: WordLayout, hash: u32) -> Self {
        match layout {
            WordLayout::Wide64 => Self(SHAPE_BIT | WideHashcodeField::encode(hash as u64)),
            WordLayout::Split32 => Self(SHAPE_BIT),
        }
    }

    pub fn from_hashcode(layout: WordLayout, hash: u32) -> Self {
        Self(HashableLockword::from_hashcode(layout, hash).0)
    }

    /// Unbound inflated form of an unbound word, keeping its hashcode. Maps
    /// the all-zero word of a fresh object to the hashless unbound word.
    pub fn as_unbound(self) -> Self {
        debug_assert!(!self.is_bound(), "{self:?} is bound");
        Self(self.0 | SHAPE_BIT)
    }
}

impl HashableLockword {
    pub fn from_hashcode(layout: WordLayout, hash: u32) -> Self {
        Self::default().with_hashcode(layout, hash)
    }

    pub fn hashcode(self, layout: WordLayout) -> u32 {
        match layout {
            WordLayout::Wide64 => WideHashcodeField::decode(self.0) as u32,
            WordLayout::Split32 => SplitHashcodeField::decode(self.0) as u32,
        }
    }

    pub fn with_hashcode(self, layout: WordLayout, hash: u32) -> Self {
        debug_assert!(hash as u64 <= layout.hashcode_mask(), "hashcode {hash:#x} too wide");
        match layout {
            WordLayout::Wide64 => Self(WideHashcodeField::update(hash as u64, self.0)),
            WordLayout::Split32 => Self(SplitHashcodeField::update(hash as u64, self.0)),
        }
    }
}

impl ThinLockword {
    pub fn is_thin_lockword(word: ModalLockword) -> bool {
        word.0 & STATUS_MASK == 0
    }

    pub fn unlocked_from_hashcode(layout: WordLayout, hash: u32) -> Self {
        match layout {
            WordLayout::Wide64 => Self(WideHashcodeField::encode(hash as u64)),
            WordLayout::Split32 => Self(0),
        }
    }

    pub fn lock_owner_id(self) -> u32 {
        LockOwnerField::decode(self.0) as u32
    }

    pub fn recursion_count(self) -> u32 {
        RecursionCountField::decode(self.0) as u32
    }

    /// A zero count means the lock is not held.
    pub fn count_underflow(self) -> bool {
        self.recursion_count() == 0
    }

    pub fn count_overflow(self) -> bool {
        self.recursion_count() == MAX_RECURSION_COUNT
    }

    pub fn as_unlocked(self) -> Self {
        Self(LockOwnerField::update(0, RecursionCountField::update(0, self.0)))
    }

    pub fn as_locked_once_by(self, id: u32) -> Self {
        debug_assert!(id != 0 && id <= MAX_LOCK_OWNER_ID);
        Self(LockOwnerField::update(
            id as u64,
            RecursionCountField::update(1, self.0),
        ))
    }

    pub fn increment_count(self) -> Self {
        debug_assert!(!self.count_overflow());
        Self(RecursionCountField::update(
            self.recursion_count() as u64 + 1,
            self.0,
        ))
    }

    /// Drops one level of recursion. Releasing the last level also clears the owner.
    pub fn decrement_count(self) -> Self {
        debug_assert!(!self.count_underflow());
        if self.recursion_count() == 1 {
            self.as_unlocked()
        } else {
            Self(RecursionCountField::update(
                self.recursion_count() as u64 - 1,
                self.0,
            ))
        }
    }
}

impl BiasedLockword {
    pub fn is_biased_lockword(word: ModalLockword) -> bool {
        word.0 & STATUS_MASK == MISC_BIT
    }

    pub fn anon_biased_from_hashcode(hash: u32) -> Self {
        Self(MISC_BIT | WideHashcodeField::encode(hash as u64))
    }

    pub fn bias_owner_id(self) -> u32 {
        LockOwnerField::decode(self.0) as u32
    }

    pub fn recursion_count(self) -> u32 {
        RecursionCountField::decode(self.0) as u32
    }

    pub fn count_underflow(self) -> bool {
        self.recursion_count() == 0
    }

    pub fn as_biased_to(self, id: u32) -> Self {
        debug_assert!(id != 0 && id <= MAX_LOCK_OWNER_ID);
        Self(LockOwnerField::update(id as u64, self.0))
    }

    pub fn increment_count(self) -> Self {
        debug_assert!(self.recursion_count() < MAX_RECURSION_COUNT);
        Self(RecursionCountField::update(
            self.recursion_count() as u64 + 1,
            self.0,
        ))
    }

    /// Biased to nobody, unlocked, hashcode kept.
    pub fn as_anon_biased(self) -> Self {
        Self(LockOwnerField::update(0, RecursionCountField::update(0, self.0)))
    }

    /// Same owner, count and hashcode re-encoded as a thin word.
    pub fn as_unbiasable(self) -> ThinLockword {
        ThinLockword(MiscBitField::update(false, self.0))
    }
}

/// How lock state is spread over an object's words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordLayout {
    /// One 64-bit misc word carries shape, binding, monitor and hashcode.
    Wide64,
    /// A 32-bit misc word carries shape and binding bits, a separate 32-bit
    /// hash word carries the hashcode or the monitor reference.
    Split32,
}

/// Both lock state words of an object, read misc word first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockwordSnapshot {
    pub lockword: InflatedMonitorLockword,
    pub hashword: InflatedMonitorLockword,
}

impl WordLayout {
    pub fn host() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_pointer_width = "64")] {
                Self::Wide64
            } else {
                Self::Split32
            }
        }
    }

    pub const fn is_64bit(self) -> bool {
        matches!(self, Self::Wide64)
    }

    pub const fn word_mask(self) -> u64 {
        match self {
            Self::Wide64 => u64::MAX,
            Self::Split32 => u32::MAX as u64,
        }
    }

    pub const fn hashcode_mask(self) -> u64 {
        match self {
            Self::Wide64 => (1 << 32) - 1,
            Self::Split32 => (1 << 30) - 1,
        }
    }

    pub fn fits(self, word: u64) -> bool {
        word & !self.word_mask() == 0
    }

    /// Read the hash word. Always zero on the 64-bit layout.
    pub fn read_hashword(self, header: &ObjectHeader) -> InflatedMonitorLockword {
        match self {
            Self::Wide64 => {
                let hashword = header.read_hash();
                assert!(hashword == 0, "hash word must stay zero on the 64-bit layout");
                InflatedMonitorLockword::default()
            }
            Self::Split32 => InflatedMonitorLockword(header.read_hash()),
        }
    }

    pub fn snapshot(self, header: &ObjectHeader) -> LockwordSnapshot {
        let lockword = InflatedMonitorLockword(header.read_misc());
        let hashword = self.read_hashword(header);
        LockwordSnapshot { lockword, hashword }
    }

    /// Word that carries the hashcode of an unbound object.
    pub fn hash_carrier(self, snapshot: &LockwordSnapshot) -> HashableLockword {
        match self {
            Self::Wide64 => snapshot.lockword.into(),
            Self::Split32 => snapshot.hashword.into(),
        }
    }

    /// Monitor bound to the object the snapshot was taken from, if any.
    ///
    /// On the 32-bit layout the two words are not bound atomically. The
    /// inflated fast path binds the hash word first, thin inflation binds the
    /// misc word first. A bound hash word is decisive either way. A bound misc
    /// word with an unbound snapshot hash word means the binder has not
    /// installed the reference yet; the hash word is re-read until it shows up.
    pub fn bound_monitor(
        self,
        header: &ObjectHeader,
        snapshot: &LockwordSnapshot,
    ) -> Option<MonitorHandle> {
        match self {
            Self::Wide64 => snapshot
                .lockword
                .is_bound()
                .then(|| snapshot.lockword.get_bound_monitor()),
            Self::Split32 => {
                if snapshot.hashword.is_bound() {
                    return Some(snapshot.hashword.get_bound_monitor());
                }
                if !snapshot.lockword.is_bound() {
                    return None;
                }
                loop {
                    let hashword = InflatedMonitorLockword(header.read_hash());
                    if hashword.is_bound() {
                        return Some(hashword.get_bound_monitor());
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Words to install when binding `handle`: `(misc, hash)`.
    pub fn bound_words(
        self,
        handle: MonitorHandle,
    ) -> (InflatedMonitorLockword, InflatedMonitorLockword) {
        let bound = InflatedMonitorLockword::bound_from_monitor(handle);
        match self {
            Self::Wide64 => (bound, InflatedMonitorLockword::default()),
            Self::Split32 => (InflatedMonitorLockword::bound_from_zero(), bound),
        }
    }
}

impl Default for WordLayout {
    fn default() -> Self {
        Self::host()
    }
}
