//! Walks through an offline like and a composed feed against the in-memory
//! backend.
//!
//! Configuration comes from `FEED_CACHE_*` variables (or `.env`); log level
//! from `RUST_LOG`.

use anyhow::{Context, Result};
use feed_cache::memory::InMemoryBackend;
use feed_cache::telemetry::init_tracing;
use feed_cache::{
    CacheConfig, Collection, ContentItem, FeedClient, FeedEntry, InteractionKind, QueryKey,
    SponsoredItem,
};
use std::sync::Arc;
use tracing::info;

const USER: &str = "student-1";
const SCOPE: &str = "campus";

fn seed(backend: &InMemoryBackend) {
    for i in 0..12 {
        let likes = if i == 11 { 3 } else { i % 4 };
        backend.insert_item(
            ContentItem::new(format!("post-{:02}", i), Collection::Posts, "club-board")
                .with_body(format!("Campus notice #{}", i))
                .with_like_count(likes),
        );
    }
    backend.add_sponsored(SponsoredItem::new("ad-bookstore", "Campus bookstore sale").pinned());
    backend.add_sponsored(SponsoredItem::new("ad-cafe", "Two-for-one coffee"));
    backend.add_sponsored(SponsoredItem::new("ad-gym", "Gym open late"));
}

fn like_count(client: &FeedClient, post_id: &str) -> Option<u32> {
    client
        .store()
        .get_data(&QueryKey::post_detail(post_id))
        .and_then(|data| data.as_item().map(|item| item.like_count))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing("feed_cache=info");
    let config = CacheConfig::from_env().context("Failed to load cache configuration")?;
    info!(
        page_size = config.page_size,
        interval = config.sponsored_interval,
        "Starting feed demo"
    );

    let backend = Arc::new(InMemoryBackend::new());
    seed(&backend);
    let client = FeedClient::with_backend(config, backend.clone());

    // Composed feed
    let pages = client
        .composed_feed(SCOPE)
        .await
        .context("Failed to load campus feed")?;
    println!("== Composed feed ({} page(s)) ==", pages.len());
    for (page_no, page) in pages.iter().enumerate() {
        for item in page {
            match &item.entry {
                FeedEntry::Content(post) => println!(
                    "  [{}:{:>2}] {} ({} likes)",
                    page_no, item.position, post.body, post.like_count
                ),
                FeedEntry::Sponsored(ad) => {
                    println!("  [{}:{:>2}] ** {} **", page_no, item.position, ad.title)
                }
            }
        }
    }

    // Offline like
    let post_id = "post-11";
    let post = client.post(post_id).await.context("Failed to load post")?;
    let ids: Vec<String> = client
        .feed(SCOPE)
        .await?
        .items()
        .map(|item| item.id.clone())
        .collect();
    let liked = client
        .check_memberships(InteractionKind::Like, USER, &ids)
        .await
        .context("Failed to check likes")?;
    println!(
        "\n== Offline like on {} ==\n  before: {} likes, liked = {:?}",
        post_id,
        post.like_count,
        liked.contains(post_id)
    );

    backend.pause_mutations();
    backend.set_offline(true);
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.toggle_like(post_id, USER).await })
    };
    // Let the spawned mutation reach the paused remote call
    for _ in 0..100 {
        if like_count(&client, post_id) != Some(post.like_count) {
            break;
        }
        tokio::task::yield_now().await;
    }
    println!("  optimistic: {:?} likes", like_count(&client, post_id));

    backend.resume_mutations();
    let result = pending.await.context("Like task panicked")?;
    println!("  server said: {:?}", result.map_err(|e| e.to_string()));
    println!("  after rollback: {:?} likes", like_count(&client, post_id));
    backend.set_offline(false);

    let stats = serde_json::to_string_pretty(&client.stats()).context("Failed to encode stats")?;
    println!("\n== Cache stats ==\n{}", stats);

    Ok(())
}
