use crate::common::RecordId;
use crate::storage::buffer::{BufferPoolManager, PageReadGuard, PageRef};
use crate::storage::page::BTreeLeafPage;

/// Forward range iterator over the leaf chain.
///
/// Holds at most one page at a time, pinned and read-latched; advancing past
/// a leaf releases it before the next leaf is fetched, so iterators never
/// hold two latches at once.
pub struct BTreeIterator {
    buffer_pool: BufferPoolManager,
    key_size: usize,
    current: Option<LeafPosition>,
    index: usize,
}

/// Field order matters: the latch releases before the unpin goes back to
/// the pool.
struct LeafPosition {
    guard: PageReadGuard,
    _page: PageRef,
}

impl BTreeIterator {
    pub(crate) fn new(
        buffer_pool: BufferPoolManager,
        key_size: usize,
        current: Option<(PageRef, PageReadGuard)>,
        index: usize,
    ) -> Self {
        Self {
            buffer_pool,
            key_size,
            current: current.map(|(page, guard)| LeafPosition { guard, _page: page }),
            index,
        }
    }
}

impl Iterator for BTreeIterator {
    type Item = (Vec<u8>, RecordId);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let step = {
                let position = self.current.as_ref()?;
                let leaf = BTreeLeafPage::from_data(&*position.guard, self.key_size);
                if self.index < leaf.size() {
                    Ok((leaf.key_at(self.index).to_vec(), leaf.value_at(self.index)))
                } else {
                    Err(leaf.next_page_id())
                }
            };

            match step {
                Ok(item) => {
                    self.index += 1;
                    return Some(item);
                }
                Err(next_page_id) => {
                    // release before following the link
                    self.current = None;
                    if !next_page_id.is_valid() {
                        return None;
                    }
                    match self.buffer_pool.fetch_page(next_page_id) {
                        Ok(page) => {
                            let guard = page.read();
                            self.current = Some(LeafPosition { guard, _page: page });
                            self.index = 0;
                        }
                        Err(err) => {
                            log::warn!("iterator stopped: {}", err);
                            return None;
                        }
                    }
                }
            }
        }
    }
}
