// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Page content for missing-page resolutions.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

/// First byte of the alphabet fill.
const ALPHABET_START: u8 = b'A';
/// Number of letters the alphabet fill cycles through.
const ALPHABET_LEN: u64 = 20;

/// Page-sized content handed from a provider to the dispatcher.
///
/// The frame borrows the provider's fill buffer, so it stays exclusively
/// owned until the single install that consumes it returns.
#[derive(Debug)]
pub struct PageFrame<'a> {
    bytes: &'a [u8],
}

impl<'a> PageFrame<'a> {
    /// Wraps a filled buffer.
    pub fn new(bytes: &'a [u8]) -> Self {
        PageFrame { bytes }
    }

    /// Content of the frame.
    pub fn as_slice(&self) -> &[u8] {
        self.bytes
    }

    /// Size of the frame in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the frame is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Produces content for pages resolved by installation.
pub trait PageContentProvider: Send + Debug {
    /// Fills a page for the fault with the given sequence number.
    fn fill(&mut self, sequence: u64) -> PageFrame<'_>;
}

/// Built-in fill policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    /// Every installed page is zeroed.
    #[default]
    Zero,
    /// Installed pages cycle through 'A'..='T', one letter per fault.
    Alphabet,
}

impl FillPolicy {
    /// Byte every position of the page holds for fault `sequence`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn fill_byte(self, sequence: u64) -> u8 {
        match self {
            FillPolicy::Zero => 0,
            // The remainder is below ALPHABET_LEN, so it fits in a u8.
            FillPolicy::Alphabet => ALPHABET_START + (sequence % ALPHABET_LEN) as u8,
        }
    }
}

/// Provider filling whole pages with the byte chosen by a [`FillPolicy`].
///
/// Content depends only on the fault sequence number, never on the address.
#[derive(Debug)]
pub struct PatternProvider {
    policy: FillPolicy,
    page: Vec<u8>,
}

impl PatternProvider {
    /// Creates a provider for pages of `page_size` bytes.
    pub fn new(policy: FillPolicy, page_size: usize) -> Self {
        PatternProvider {
            policy,
            page: vec![0; page_size],
        }
    }
}

impl PageContentProvider for PatternProvider {
    fn fill(&mut self, sequence: u64) -> PageFrame<'_> {
        self.page.fill(self.policy.fill_byte(sequence));
        PageFrame::new(&self.page)
    }
}
