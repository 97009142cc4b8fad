//! Demo work-item catalog

use sortie_core::CatalogEntry;

const CATEGORIES: [&str; 5] = ["storage", "identity", "compute", "network", "secrets"];

/// `n` well-formed entries spread across the demo categories
#[must_use]
pub fn demo_catalog(n: usize) -> Vec<CatalogEntry> {
    (0..n)
        .map(|i| {
            let category = CATEGORIES[i % CATEGORIES.len()];
            CatalogEntry::new(
                format!("{category}-{i:03}"),
                category,
                format!("docs/{category}/{i:03}.md"),
            )
        })
        .collect()
}

/// Demo catalog with a few unusable entries mixed in
#[must_use]
pub fn noisy_catalog(n: usize) -> Vec<CatalogEntry> {
    let mut catalog = demo_catalog(n);
    catalog.push(CatalogEntry::new("Not A Key", "storage", "docs/bad.md"));
    catalog.push(CatalogEntry::new("no-category", "", "docs/none.md"));
    catalog.push(CatalogEntry::new("no-docs", "network", " "));
    if let Some(first) = catalog.first().cloned() {
        catalog.push(first);
    }
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortie_core::WorkItemSelection;

    #[test]
    fn demo_entries_are_well_formed() {
        let catalog = demo_catalog(50);
        assert_eq!(catalog.len(), 50);
        assert!(catalog.iter().all(|e| WorkItemSelection::try_from(e).is_ok()));
    }

    #[test]
    fn noisy_catalog_has_three_malformed_and_one_duplicate() {
        let catalog = noisy_catalog(10);
        let malformed = catalog
            .iter()
            .filter(|e| WorkItemSelection::try_from(*e).is_err())
            .count();
        assert_eq!(malformed, 3);
        assert_eq!(catalog.len(), 14);
    }
}
