use crate::{
    error::{Error, Result},
    page::{LogKey, Page},
};

/// Arena of the dirty pages of one write transaction.
///
/// [`PageReference::Logged`](crate::page::PageReference::Logged) holds an index
/// into this arena instead of a pointer, so parents and children never alias.
/// Entries are taken out during commit; a taken entry reads as missing.
#[derive(Debug, Default)]
pub struct PageLog {
    entries: Vec<Option<Page>>,
}

impl PageLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a page and returns its key.
    pub fn insert(&mut self, page: Page) -> LogKey {
        self.entries.push(Some(page));
        (self.entries.len() - 1) as LogKey
    }

    /// Borrows a logged page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingLogEntry`] if `key` is unknown or already taken.
    pub fn get(&self, key: LogKey) -> Result<&Page> {
        self.entries
            .get(key as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::MissingLogEntry { key })
    }

    /// Mutably borrows a logged page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingLogEntry`] if `key` is unknown or already taken.
    pub fn get_mut(&mut self, key: LogKey) -> Result<&mut Page> {
        self.entries
            .get_mut(key as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::MissingLogEntry { key })
    }

    /// Removes a page from the log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingLogEntry`] if `key` is unknown or already taken.
    pub fn take(&mut self, key: LogKey) -> Result<Page> {
        self.entries
            .get_mut(key as usize)
            .and_then(Option::take)
            .ok_or(Error::MissingLogEntry { key })
    }

    /// Number of pages still held.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    /// Whether no page is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
