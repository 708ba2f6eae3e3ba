//! Cursor pagination
//!
//! List endpoints return one page plus an optional cursor. [`paginate`] turns
//! a page fetcher into a lazy stream of items that ends when the cursor does.
//! Nothing is requested until the stream is polled, and calling the fetcher
//! again yields a fresh stream from the first page.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::future::Future;

use crate::error::AppError;

/// One page of a listing
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page; `None` on the last page
    pub cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            cursor: None,
        }
    }
}

enum Position {
    Start,
    After(String),
    Done,
}

/// Stream every item of a cursor-paginated listing
///
/// # Errors
/// The stream yields `Validation` if the service returns the cursor it was
/// just given, and any error from `fetch` as-is; it ends after an error.
pub fn paginate<'a, T, F, Fut>(fetch: F) -> BoxStream<'a, Result<T, AppError>>
where
    T: Send + 'a,
    F: FnMut(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page<T>, AppError>> + Send + 'a,
{
    stream::try_unfold(
        (fetch, Position::Start),
        |(mut fetch, position)| async move {
            let cursor = match position {
                Position::Start => None,
                Position::After(cursor) => Some(cursor),
                Position::Done => return Ok(None),
            };

            let page = fetch(cursor.clone()).await?;
            let next = match page.cursor {
                None => Position::Done,
                Some(next) if next.is_empty() => Position::Done,
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(AppError::Validation(format!(
                        "pagination cursor did not advance: {next}"
                    )));
                }
                Some(next) => Position::After(next),
            };

            Ok(Some((page.items, (fetch, next))))
        },
    )
    .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}

/// Drive a paginated stream to completion
pub async fn collect_all<T>(
    stream: BoxStream<'_, Result<T, AppError>>,
) -> Result<Vec<T>, AppError> {
    stream.try_collect().await
}
