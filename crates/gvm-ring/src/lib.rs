#![doc = include_str!("../README.md")]

pub mod ring;

pub use ring::{CompletionRing, ReadySlot, RingConsumer, RingStats, SlotRef};
