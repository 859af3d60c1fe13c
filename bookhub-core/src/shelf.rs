//! Reading shelves.
//!
//! A shelf row exists per (account, book) once the reader unlocks a chapter
//! or reports progress. [`Bookshelf`] lists an account's rows joined with
//! their books and records the last chapter read, refusing chapters the
//! reader has not yet unlocked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::model::{AccountId, Book, BookId, ShelfEntry};
use crate::store::{LedgerStore, StoreError};

/// Error type for shelf operations.
#[derive(Debug, Error)]
pub enum ShelfError {
    #[error("book not found: {book}")]
    BookNotFound { book: BookId },

    /// The book has fewer chapters than reported.
    #[error("book {book} has {available} chapters, not {chapter}")]
    ChapterOutOfRange {
        book: BookId,
        chapter: u32,
        available: u32,
    },

    /// The chapter is neither free nor unlocked.
    #[error("chapter {chapter} of book {book} is locked ({readable} readable)")]
    ChapterLocked {
        book: BookId,
        chapter: u32,
        readable: u32,
    },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl Classify for ShelfError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::BookNotFound { .. } => ErrorKind::NotFound,
            Self::ChapterOutOfRange { .. } => ErrorKind::InvalidRequest,
            Self::ChapterLocked { .. } => ErrorKind::Conflict,
            Self::Store(e) => e.kind(),
        }
    }
}

/// A shelf row joined with its book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShelfItem {
    pub book: Book,
    pub unlocked_chapters: u32,
    /// Free chapters plus unlocked ones, capped at the book's length.
    pub readable_chapters: u32,
    pub last_chapter_read: u32,
    pub progress_percent: f64,
    pub updated_at: DateTime<Utc>,
}

impl ShelfItem {
    fn new(entry: &ShelfEntry, book: Book) -> Self {
        Self {
            unlocked_chapters: entry.unlocked_chapters,
            readable_chapters: entry.readable_chapters(&book),
            last_chapter_read: entry.last_chapter_read,
            progress_percent: entry.progress_percent(&book),
            updated_at: entry.updated_at,
            book,
        }
    }
}

/// Per-account reading state.
#[derive(Clone)]
pub struct Bookshelf {
    store: Arc<dyn LedgerStore>,
}

impl Bookshelf {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Every book on the account's shelf, ordered by book id.
    pub async fn list(&self, account: &AccountId) -> Result<Vec<ShelfItem>, ShelfError> {
        let rows = self.store.shelf_for(account).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let books: HashMap<BookId, Book> = self
            .store
            .list_books()
            .await?
            .into_iter()
            .map(|b| (b.id, b))
            .collect();

        Ok(rows
            .iter()
            .filter_map(|row| match books.get(&row.book_id) {
                Some(book) => Some(ShelfItem::new(row, book.clone())),
                None => {
                    tracing::warn!("Shelf row for missing book {} skipped", row.book_id);
                    None
                }
            })
            .collect())
    }

    /// Record the last chapter read, shelving the book if needed.
    ///
    /// Chapter `0` shelves the book without marking anything read.
    pub async fn record_progress(
        &self,
        account: &AccountId,
        book: BookId,
        chapter: u32,
    ) -> Result<ShelfItem, ShelfError> {
        let book = self
            .store
            .get_book(book)
            .await?
            .ok_or(ShelfError::BookNotFound { book })?;
        if chapter > book.available_chapters {
            return Err(ShelfError::ChapterOutOfRange {
                book: book.id,
                chapter,
                available: book.available_chapters,
            });
        }

        let current = self
            .store
            .get_shelf_entry(account, book.id)
            .await?
            .unwrap_or_else(|| ShelfEntry::new(*account, book.id, Utc::now()));
        let readable = current.readable_chapters(&book);
        if chapter > readable {
            return Err(ShelfError::ChapterLocked {
                book: book.id,
                chapter,
                readable,
            });
        }

        let row = self
            .store
            .record_progress(account, book.id, chapter, Utc::now())
            .await
            .map_err(|e| match e {
                StoreError::NotFound { entity: "book", .. } => {
                    ShelfError::BookNotFound { book: book.id }
                }
                e => e.into(),
            })?;

        tracing::debug!(
            "Account {} read to chapter {} of book {}",
            account,
            chapter,
            book.id
        );
        Ok(ShelfItem::new(&row, book))
    }
}

impl std::fmt::Debug for Bookshelf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bookshelf").finish_non_exhaustive()
    }
}
