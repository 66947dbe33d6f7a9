use std::cmp::Ordering;

use crate::item::QueueItem;

/// Dispatch order: priority class, then earliest `next_retry_at`.
///
/// `created_at` and `id` break remaining ties so the order is total and a batch
/// drains the same way every time for identical state.
pub fn dispatch_order(a: &QueueItem, b: &QueueItem) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.next_retry_at.cmp(&b.next_retry_at))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_for_dispatch(items: &mut [QueueItem]) {
    items.sort_by(dispatch_order);
}
