// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the pager crates: host page size discovery and page
//! granularity arithmetic.

use vmm_sys_util::errno;

/// Errors associated with querying host memory parameters.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum PageSizeError {
    /// Failed to query the host page size: {0}
    Sysconf(errno::Error),
    /// Host reported a page size that is not a power of two: {0}
    NotPowerOfTwo(usize),
}

/// Returns the page size of the host, in bytes.
pub fn get_page_size() -> Result<usize, PageSizeError> {
    // SAFETY: `sysconf` has no memory safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = usize::try_from(raw).map_err(|_| PageSizeError::Sysconf(errno::Error::last()))?;

    if !page_size.is_power_of_two() {
        return Err(PageSizeError::NotPowerOfTwo(page_size));
    }

    Ok(page_size)
}

/// Rounds `addr` down to the closest multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_down(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

/// Whether `addr` is a multiple of `align` (a power of two).
#[inline]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}

/// Converts a usize into a u64.
#[cfg(target_pointer_width = "64")]
#[inline]
pub const fn usize_to_u64(num: usize) -> u64 {
    num as u64
}
