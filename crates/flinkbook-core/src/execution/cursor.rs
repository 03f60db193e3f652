use crate::gateway::{ResultKind, ResultPage};

/// Cursor to fetch after `page` was read at `current`, or `None` when the
/// result stream is exhausted.
///
/// A page with rows always moves forward, even if the gateway offers the same
/// token again. An empty page only moves when a later token is offered.
pub(crate) fn advance(current: u64, page: &ResultPage) -> Option<u64> {
    if page.kind == ResultKind::EndOfStream {
        return None;
    }
    match page.next_cursor {
        None if page.kind == ResultKind::Payload => None,
        None => Some(current),
        Some(next) if next > current => Some(next),
        Some(_) if page.has_rows() => Some(current + 1),
        Some(_) => Some(current),
    }
}
