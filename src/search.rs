use crate::state::data::{Catalog, CatalogEntry};

/// Case-insensitive title search over the active entries of one snapshot.
///
/// Rebuilt from scratch after every pass; catalogs are small enough that an
/// incremental index is not worth its bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SearchIndex {
    revision: u64,
    items: Vec<IndexedTitle>,
}

#[derive(Debug, Clone)]
struct IndexedTitle {
    folded: String,
    entry: CatalogEntry,
}

fn fold(text: &str) -> String {
    text.trim().to_lowercase()
}

impl SearchIndex {
    pub fn rebuild(catalog: &Catalog) -> Self {
        let mut items: Vec<IndexedTitle> = catalog
            .active_entries()
            .map(|entry| IndexedTitle {
                folded: fold(&entry.display_title),
                entry: entry.clone(),
            })
            .collect();

        items.sort_by(|a, b| {
            a.folded
                .cmp(&b.folded)
                .then_with(|| a.entry.display_title.cmp(&b.entry.display_title))
                .then_with(|| a.entry.stable_id.cmp(&b.entry.stable_id))
        });

        SearchIndex {
            revision: catalog.revision(),
            items,
        }
    }

    /// Entries whose title contains `text`, ordered by title then stable id.
    /// An empty query matches everything.
    pub fn query<'a>(&'a self, text: &str) -> impl Iterator<Item = &'a CatalogEntry> + 'a {
        let needle = fold(text);
        self.items
            .iter()
            .filter(move |item| item.folded.contains(needle.as_str()))
            .map(|item| &item.entry)
    }

    /// Catalog revision this index was built from
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
