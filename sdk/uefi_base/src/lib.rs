//! Base UEFI Definitions
//!
//! Common constants, alignment helpers, and error types shared by the memory
//! services workspace.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![no_std]

#[macro_use]
pub mod macros;

pub mod base;
pub mod error;
