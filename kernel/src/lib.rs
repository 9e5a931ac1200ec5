#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod mem;
pub mod sync;

pub use mem::{
    AddressSpace, BackingStore, MemBackingStore, NullTranslation, ReplacementPolicy, SpaceId,
    TranslationControl, Vm, VmError,
};
