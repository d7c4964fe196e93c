use std::collections::HashSet;

use crate::system::table::HandleTableEntry;

/// Narrows a handle table by owning process and object type.
///
/// A dimension left as `None` places no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleFilter {
    pub process_ids: Option<HashSet<u32>>,
    pub type_codes: Option<HashSet<u16>>,
}

impl HandleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process_ids(mut self, pids: impl IntoIterator<Item = u32>) -> Self {
        self.process_ids = Some(pids.into_iter().collect());
        self
    }

    pub fn with_type_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.type_codes = Some(codes.into_iter().collect());
        self
    }

    pub fn accepts(&self, entry: &HandleTableEntry) -> bool {
        let pid_ok = self
            .process_ids
            .as_ref()
            .map_or(true, |pids| pids.contains(&entry.pid));
        let type_ok = self
            .type_codes
            .as_ref()
            .map_or(true, |codes| codes.contains(&entry.type_code));
        pid_ok && type_ok
    }
}

/// Entries accepted by `filter`, in table order.
pub fn filter(entries: &[HandleTableEntry], filter: &HandleFilter) -> Vec<HandleTableEntry> {
    entries.iter().filter(|e| filter.accepts(e)).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<HandleTableEntry> {
        let mut entries = Vec::new();
        for (i, (pid, type_code)) in [(10, 37), (10, 7), (20, 37), (20, 15), (30, 37), (30, 38)]
            .into_iter()
            .enumerate()
        {
            entries.push(HandleTableEntry {
                pid,
                handle: 4 * (i + 1),
                type_code,
                object: 0x1000 + i,
                granted_access: 0,
                attributes: 0,
            });
        }
        entries
    }

    #[test]
    fn no_dimensions_pass_everything_through() {
        let entries = table();
        assert_eq!(filter(&entries, &HandleFilter::new()), entries);
    }

    #[test]
    fn type_codes_select_exact_subset() {
        let entries = table();
        let wanted: HashSet<u16> = [37, 38].into_iter().collect();
        let kept = filter(&entries, &HandleFilter::new().with_type_codes(wanted.clone()));

        let expected: Vec<_> = entries
            .iter()
            .filter(|e| wanted.contains(&e.type_code))
            .copied()
            .collect();
        assert_eq!(kept, expected);
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn both_dimensions_must_hold() {
        let kept = filter(
            &table(),
            &HandleFilter::new().with_type_codes([37]).with_process_ids([20, 30]),
        );
        let pids: Vec<u32> = kept.iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![20, 30]);
        assert!(kept.iter().all(|e| e.type_code == 37));
    }

    #[test]
    fn empty_allow_list_rejects_everything() {
        let kept = filter(&table(), &HandleFilter::new().with_process_ids(Vec::<u32>::new()));
        assert!(kept.is_empty());
    }
}
