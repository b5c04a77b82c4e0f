//! Feed composer
//!
//! Interleaves sponsored items into primary feed pages: one sponsored item
//! after every `interval` visible posts, cycling through the rotating pool.
//! The first pinned sponsored item is left out of rotation and shown once at
//! the top of the first page.

use crate::models::{ContentItem, FeedEntry, FeedItem, InfinitePages, SponsoredItem};

/// Output of composing one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composition {
    pub items: Vec<FeedItem>,
    /// Rotation index to continue from on the next page
    pub next_rotation: usize,
}

/// Compose one page without touching any state.
///
/// Items that are tombstoned or hidden are dropped before counting. Positions
/// are 0-based indices into the returned sequence.
pub fn compose_page<'a>(
    primary: impl IntoIterator<Item = &'a ContentItem>,
    pool: &[SponsoredItem],
    interval: usize,
    rotation: usize,
    first_page: bool,
) -> Composition {
    let pinned = pool.iter().position(|ad| ad.pinned);
    let rotating: Vec<&SponsoredItem> = pool
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != pinned)
        .map(|(_, ad)| ad)
        .collect();

    let mut entries = Vec::new();
    if first_page {
        if let Some(i) = pinned {
            entries.push(FeedEntry::Sponsored(pool[i].clone()));
        }
    }

    let mut rotation = rotation;
    let mut since_last = 0;
    for item in primary.into_iter().filter(|item| item.is_visible()) {
        entries.push(FeedEntry::Content(item.clone()));
        since_last += 1;

        if interval > 0 && since_last == interval && !rotating.is_empty() {
            entries.push(FeedEntry::Sponsored(
                rotating[rotation % rotating.len()].clone(),
            ));
            rotation += 1;
            since_last = 0;
        }
    }

    Composition {
        items: entries
            .into_iter()
            .enumerate()
            .map(|(position, entry)| FeedItem { entry, position })
            .collect(),
        next_rotation: rotation,
    }
}

/// Stateful composer that carries the rotation across pages
#[derive(Debug, Clone)]
pub struct FeedComposer {
    interval: usize,
    rotation: usize,
    pages_composed: usize,
}

impl FeedComposer {
    pub fn new(interval: usize) -> Self {
        Self {
            interval,
            rotation: 0,
            pages_composed: 0,
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    pub fn rotation(&self) -> usize {
        self.rotation
    }

    /// Start over from the first page
    pub fn reset(&mut self) {
        self.rotation = 0;
        self.pages_composed = 0;
    }

    /// Compose the next page and advance the rotation
    pub fn compose(&mut self, primary: &[ContentItem], pool: &[SponsoredItem]) -> Vec<FeedItem> {
        let composition = compose_page(
            primary,
            pool,
            self.interval,
            self.rotation,
            self.pages_composed == 0,
        );
        self.rotation = composition.next_rotation;
        self.pages_composed += 1;
        composition.items
    }

    /// Recompose a whole infinite feed from rotation 0. Every page keeps its
    /// own 0-based positions.
    pub fn compose_pages(&self, pages: &InfinitePages, pool: &[SponsoredItem]) -> Vec<Vec<FeedItem>> {
        let mut rotation = 0;
        pages
            .pages
            .iter()
            .enumerate()
            .map(|(i, page)| {
                let composition = compose_page(&page.items, pool, self.interval, rotation, i == 0);
                rotation = composition.next_rotation;
                composition.items
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Collection, PaginatedResult};

    fn posts(range: std::ops::Range<usize>) -> Vec<ContentItem> {
        range
            .map(|i| ContentItem::new(format!("p{}", i), Collection::Posts, "author"))
            .collect()
    }

    fn ads(n: usize) -> Vec<SponsoredItem> {
        (0..n)
            .map(|i| SponsoredItem::new(format!("ad{}", i), format!("Ad {}", i)))
            .collect()
    }

    fn sponsored_positions(items: &[FeedItem]) -> Vec<(usize, String)> {
        items
            .iter()
            .filter(|i| i.is_sponsored())
            .map(|i| (i.position, i.id().to_string()))
            .collect()
    }

    #[test]
    fn test_twelve_posts_two_ads() {
        let mut composer = FeedComposer::new(5);
        let page = composer.compose(&posts(0..12), &ads(2));

        assert_eq!(page.len(), 14);
        assert_eq!(
            sponsored_positions(&page),
            vec![(5, "ad0".to_string()), (11, "ad1".to_string())]
        );

        let next = composer.compose(&posts(12..17), &ads(2));
        assert_eq!(sponsored_positions(&next), vec![(5, "ad0".to_string())]);
    }

    #[test]
    fn test_empty_pool_passes_through() {
        let mut composer = FeedComposer::new(5);
        let page = composer.compose(&posts(0..12), &[]);
        assert_eq!(page.len(), 12);
        assert!(page.iter().all(|i| !i.is_sponsored()));
        assert_eq!(composer.rotation(), 0);
    }

    #[test]
    fn test_short_page_gets_no_ad() {
        let composition = compose_page(&posts(0..4), &ads(3), 5, 0, true);
        assert_eq!(composition.items.len(), 4);
        assert_eq!(composition.next_rotation, 0);
    }

    #[test]
    fn test_single_ad_repeats() {
        let composition = compose_page(&posts(0..15), &ads(1), 5, 0, true);
        let ids: Vec<String> = sponsored_positions(&composition.items)
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        assert_eq!(ids, vec!["ad0", "ad0", "ad0"]);
    }

    #[test]
    fn test_pinned_ad_leads_first_page_only() {
        let mut pool = ads(2);
        pool.insert(0, SponsoredItem::new("pin", "Pinned").pinned());
        let mut composer = FeedComposer::new(5);

        let first = composer.compose(&posts(0..5), &pool);
        assert_eq!(
            sponsored_positions(&first),
            vec![(0, "pin".to_string()), (6, "ad0".to_string())]
        );

        let second = composer.compose(&posts(5..10), &pool);
        assert_eq!(sponsored_positions(&second), vec![(5, "ad1".to_string())]);
    }

    #[test]
    fn test_invisible_items_are_not_counted() {
        let mut primary = posts(0..6);
        primary[2].tombstone();
        primary[3].is_hidden = true;

        let composition = compose_page(&primary, &ads(1), 5, 0, true);
        assert_eq!(composition.items.len(), 4);
        assert!(composition.items.iter().all(|i| !i.is_sponsored()));
    }

    #[test]
    fn test_compose_pages_is_deterministic() {
        let mut pages = InfinitePages::from_first(PaginatedResult::new(
            posts(0..10),
            Some(crate::models::Cursor::new("10")),
        ));
        pages.push(PaginatedResult::last(posts(10..20)));
        let composer = FeedComposer::new(5);

        let first = composer.compose_pages(&pages, &ads(3));
        let second = composer.compose_pages(&pages, &ads(3));
        assert_eq!(first, second);

        let ids: Vec<String> = first
            .iter()
            .flat_map(|page| sponsored_positions(page))
            .map(|(_, id)| id)
            .collect();
        assert_eq!(ids, vec!["ad0", "ad1", "ad2", "ad0"]);
    }
}
