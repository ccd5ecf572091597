// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # aspace
//!
//! > Per-process virtual address space management.
//!
//! This crate tracks the set of virtual memory regions owned by one process:
//! it allocates, splits, merges and tears down regions, and keeps them in
//! sync with a hardware page-table root supplied by a [`platform`].
//!
//! To use it, provide a type implementing [`platform::Provider`]; then create
//! one [`space::AddressSpace`] per process via a shared
//! [`paging::MemoryContext`]. The crate never touches hardware directly: page
//! tables, memory objects, randomness, logging and performance events are all
//! reached through the platform traits.

#![no_std]

extern crate alloc;

pub mod paging;
pub mod platform;
pub mod range;
pub mod region;
pub mod space;
pub mod vmobject;

pub use range::{PAGE_MASK, PAGE_SIZE, VirtualRange};
pub use space::AddressSpace;
