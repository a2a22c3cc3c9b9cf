//! Revision verification for detecting silent data corruption.
//!
//! Walks every page reachable from one revision, bypassing the cache so the
//! bytes actually on disk are decoded, and checks the structural invariants of
//! the indirect trees and node pages. Problems are collected into a
//! [`VerifyReport`] instead of stopping at the first one.

use crate::{
    addressing::IndirectLevels,
    error::{Error, Result},
    page::{Page, PageKind, PageReference, UberPage},
    state::PageStore,
};

/// Result of verifying one revision.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    /// Number of pages read and decoded.
    pub pages_checked: u64,
    /// Pages whose checksum, decryption or decompression failed.
    pub checksum_errors: u64,
    /// Structural problems (wrong page kinds, misplaced keys).
    pub structural_errors: u64,
    /// Detailed error descriptions.
    pub errors: Vec<VerifyError>,
}

impl VerifyReport {
    /// Whether no problem was found.
    pub fn is_clean(&self) -> bool {
        self.checksum_errors == 0 && self.structural_errors == 0
    }
}

/// A single problem found during verification.
#[derive(Debug, Clone)]
pub struct VerifyError {
    /// File offset of the offending page, if it was reached.
    pub offset: Option<u64>,
    /// Human-readable description of the error.
    pub description: String,
}

/// Verifies the pages of committed revisions.
pub struct RevisionVerifier<'a> {
    store: &'a PageStore,
}

impl<'a> RevisionVerifier<'a> {
    /// Creates a verifier over `store`.
    pub fn new(store: &'a PageStore) -> Self {
        Self { store }
    }

    /// Verifies every page reachable from `revision`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RevisionNotFound`] if `revision` is not committed in `uber`.
    /// Corruption is reported in the returned [`VerifyReport`].
    pub fn verify(&self, uber: &UberPage, revision: u64) -> Result<VerifyReport> {
        if revision >= uber.revision_count {
            return Err(Error::RevisionNotFound { revision });
        }
        let mut report = VerifyReport::default();
        let config = self.store.config();

        let revision_levels = config.revision_levels();
        let Some(reference) =
            self.walk_path(uber.revision_index, &revision_levels, revision, &mut report)
        else {
            return Ok(report);
        };
        let offset = reference.location().map(|location| location.offset);
        let revision_root = match self.load(reference, &mut report) {
            Some(Page::RevisionRoot(root)) => root,
            Some(other) => {
                structural(&mut report, offset, kind_mismatch(PageKind::RevisionRoot, &other));
                return Ok(report);
            },
            None => {
                if reference.is_empty() {
                    structural(&mut report, None, format!("revision {revision} is not indexed"));
                }
                return Ok(report);
            },
        };
        if revision_root.revision != revision {
            structural(
                &mut report,
                offset,
                format!(
                    "revision root at index {revision} claims revision {}",
                    revision_root.revision
                ),
            );
        }

        let name_offset = revision_root.name_page.location().map(|location| location.offset);
        match self.load(revision_root.name_page, &mut report) {
            Some(Page::Name(_)) | None => {},
            Some(other) => structural(&mut report, name_offset, kind_mismatch(PageKind::Name, &other)),
        }

        let node_levels = config.node_levels();
        self.verify_node_index(revision_root.node_index, 0, 0, &node_levels, &mut report);
        Ok(report)
    }

    /// Follows the indirect pages on the path to `key` and returns the leaf reference.
    fn walk_path(
        &self,
        root: PageReference,
        levels: &IndirectLevels,
        key: u64,
        report: &mut VerifyReport,
    ) -> Option<PageReference> {
        let offsets = match levels.offsets(key) {
            Ok(offsets) => offsets,
            Err(e) => {
                structural(report, None, e.to_string());
                return None;
            },
        };
        let mut reference = root;
        for offset in offsets {
            let at = reference.location().map(|location| location.offset);
            match self.load(reference, report) {
                Some(Page::Indirect(page)) => reference = page.get(offset),
                Some(other) => {
                    structural(report, at, kind_mismatch(PageKind::Indirect, &other));
                    return None;
                },
                None => {
                    if reference.is_empty() {
                        structural(report, None, format!("key {key} has no indirect page"));
                    }
                    return None;
                },
            }
        }
        Some(reference)
    }

    fn verify_node_index(
        &self,
        reference: PageReference,
        depth: usize,
        prefix: u64,
        levels: &IndirectLevels,
        report: &mut VerifyReport,
    ) {
        let offset = reference.location().map(|location| location.offset);
        let Some(page) = self.load(reference, report) else {
            return;
        };

        if depth == levels.height() {
            let Page::Node(node_page) = page else {
                structural(report, offset, kind_mismatch(PageKind::Node, &page));
                return;
            };
            if node_page.page_key() != prefix {
                structural(
                    report,
                    offset,
                    format!("node page {} stored under page key {prefix}", node_page.page_key()),
                );
            }
            let exponent = self.store.config().node_page_exponent;
            for slot in 0..node_page.capacity() {
                let Some(record) = node_page.get(slot) else {
                    continue;
                };
                let expected = (prefix << exponent) + slot as u64;
                if u64::try_from(record.key).ok() != Some(expected) {
                    structural(
                        report,
                        offset,
                        format!("node {} stored in slot of node {expected}", record.key),
                    );
                }
            }
            return;
        }

        let Page::Indirect(indirect) = page else {
            structural(report, offset, kind_mismatch(PageKind::Indirect, &page));
            return;
        };
        let shift = levels.exponents()[depth];
        for (slot, child) in indirect.references().iter().enumerate() {
            if child.is_empty() {
                continue;
            }
            let child_prefix = prefix + ((slot as u64) << shift);
            self.verify_node_index(*child, depth + 1, child_prefix, levels, report);
        }
    }

    /// Decodes the page behind `reference`, recording failures.
    fn load(&self, reference: PageReference, report: &mut VerifyReport) -> Option<Page> {
        let location = match reference {
            PageReference::Empty => return None,
            PageReference::Logged(_) => {
                structural(report, None, "uncommitted reference in a committed page".to_string());
                return None;
            },
            PageReference::Persisted(location) => location,
        };

        report.pages_checked += 1;
        match self.store.load_uncached(&location) {
            Ok(page) => Some(page),
            Err(e) => {
                let description = format!("cannot decode page at offset {}: {e}", location.offset);
                if matches!(
                    e,
                    Error::ChecksumMismatch { .. } | Error::Decrypt | Error::Decompress { .. }
                ) {
                    report.checksum_errors += 1;
                    report.errors.push(VerifyError { offset: Some(location.offset), description });
                } else {
                    structural(report, Some(location.offset), description);
                }
                None
            },
        }
    }
}

fn structural(report: &mut VerifyReport, offset: Option<u64>, description: String) {
    report.structural_errors += 1;
    report.errors.push(VerifyError { offset, description });
}

fn kind_mismatch(expected: PageKind, found: &Page) -> String {
    format!("expected {expected:?} page, found {:?}", found.kind())
}
