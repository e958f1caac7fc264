// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Demand paging: frame map, page tables, backing stores, replacement
//! policies, and the fault coordinator that ties them together.

pub mod address_space;
pub mod coremap;
pub mod page_table;
pub mod pager;
pub mod policy;
pub mod swap;


#[cfg(test)]
mod tests_prop;
