// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Maps the flags of a fault record to the action that resolves it.

use bitflags::bitflags;

use crate::monitor::FaultEvent;

bitflags! {
    /// Page fault flags, bit compatible with `UFFD_PAGEFAULT_FLAG_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FaultFlags: u64 {
        /// The faulting access was a write.
        const WRITE = 1 << 0;
        /// The page was write protected.
        const WP = 1 << 1;
        /// Minor fault: the page cache already holds the page.
        const MINOR = 1 << 2;
    }
}

/// The four recognized fault categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Read of a page with no content.
    Missing,
    /// Write to a page with no content.
    WriteMissing,
    /// Write-protect fault without the write bit.
    WriteProtect,
    /// Write to a write protected page.
    WriteProtectAndWrite,
}

/// How a fault gets resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Re-arm protection on the page. Content is untouched.
    Reapply,
    /// Clear protection so the pending write completes, then re-arm it after
    /// the grace window.
    GrantThenReapply,
    /// Fill and install the page, then write protect it.
    InstallThenProtect,
}

/// Errors associated with classifying fault records.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ClassifyError {
    /// Unexpected fault flag combination: {0:?}
    UnexpectedEventKind(FaultFlags),
}

impl FaultKind {
    /// Decodes fault flags. Any bit besides `WP` and `WRITE` is rejected.
    pub fn from_flags(flags: FaultFlags) -> Result<Self, ClassifyError> {
        if !(FaultFlags::WP | FaultFlags::WRITE).contains(flags) {
            return Err(ClassifyError::UnexpectedEventKind(flags));
        }

        Ok(
            match (flags.contains(FaultFlags::WP), flags.contains(FaultFlags::WRITE)) {
                (true, false) => FaultKind::WriteProtect,
                (true, true) => FaultKind::WriteProtectAndWrite,
                (false, true) => FaultKind::WriteMissing,
                (false, false) => FaultKind::Missing,
            },
        )
    }

    /// The action taken for this kind of fault.
    pub fn resolution(self) -> Resolution {
        match self {
            FaultKind::WriteProtect => Resolution::Reapply,
            FaultKind::WriteProtectAndWrite => Resolution::GrantThenReapply,
            FaultKind::WriteMissing | FaultKind::Missing => Resolution::InstallThenProtect,
        }
    }
}

impl FaultEvent {
    /// Decodes the kind of this fault.
    pub fn kind(&self) -> Result<FaultKind, ClassifyError> {
        FaultKind::from_flags(self.flags)
    }
}

/// Picks the resolution for a fault record.
pub fn classify(event: &FaultEvent) -> Result<Resolution, ClassifyError> {
    event.kind().map(FaultKind::resolution)
}
