use std::collections::HashSet;

use super::{PageInfo, Record, RecordId};

/// Locally materialized, id-deduplicated list assembled from page loads.
///
/// Page 1 is head truth and replaces everything; later pages evict any existing
/// record they also contain and append. No id is ever held twice.
#[derive(Debug, Clone)]
pub struct PaginatedView<T> {
    records: Vec<T>,
    page_info: Option<PageInfo>,
}

impl<T> Default for PaginatedView<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            page_info: None,
        }
    }
}

impl<T: Record> PaginatedView<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_page(&mut self, page: u32, incoming: Vec<T>, info: PageInfo) {
        let incoming = dedup_keep_last(incoming);

        if page <= 1 {
            self.records = incoming;
        } else {
            let incoming_ids: HashSet<&RecordId> = incoming.iter().map(|r| r.id()).collect();
            self.records.retain(|r| !incoming_ids.contains(r.id()));
            self.records.extend(incoming);
        }

        self.page_info = Some(info);
    }

    /// Flip one record to read. Returns false when the id is not materialized.
    pub fn mark_read(&mut self, id: &RecordId) -> bool {
        match self.records.iter_mut().find(|r| r.id() == id) {
            Some(record) => {
                record.mark_read();
                true
            }
            None => false,
        }
    }

    /// Flip every materialized record to read; returns how many changed
    pub fn mark_all_read(&mut self) -> usize {
        let mut flipped = 0;
        for record in self.records.iter_mut().filter(|r| !r.is_read()) {
            record.mark_read();
            flipped += 1;
        }
        flipped
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn get(&self, id: &RecordId) -> Option<&T> {
        self.records.iter().find(|r| r.id() == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn page_info(&self) -> Option<PageInfo> {
        self.page_info
    }

    pub fn has_more(&self) -> bool {
        self.page_info.is_some_and(|info| info.has_more())
    }

    /// Next page to request, starting from 1 on an empty view
    pub fn next_page(&self) -> u32 {
        self.page_info.map_or(1, |info| info.current_page + 1)
    }

    /// Unread records among those materialized (not the server's counter)
    pub fn local_unread(&self) -> usize {
        self.records.iter().filter(|r| !r.is_read()).count()
    }
}

/// Within one page, a repeated id keeps its last occurrence (data and position)
fn dedup_keep_last<T: Record>(records: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    let mut kept: Vec<T> = records
        .into_iter()
        .rev()
        .filter(|r| seen.insert(r.id().clone()))
        .collect();
    kept.reverse();
    kept
}
