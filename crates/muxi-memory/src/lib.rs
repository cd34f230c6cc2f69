// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Layered memory stack for the orchestration runtime: Hybrid Buffer Memory
//! (spec §4.4), Long-Term Memory (spec §4.5), and Memobase (spec §4.6).

pub mod buffer;
pub mod errors;
pub mod long_term;
pub mod memobase;

pub use buffer::{BufferItem, BufferMemory, Filter, Metadata, SearchHit};
pub use errors::MemoryError;
pub use long_term::{LongTermFilter, LongTermHit, LongTermRecord, LongTermStore, SqliteLongTermStore};
pub use memobase::{Memobase, PutOutcome, Source, UserContextEntry};
