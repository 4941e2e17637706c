use std::time::Duration;

use cache_api::backend::collect_sorted;
use cache_api::decorators::LockedOptions;
use cache_api::key_template::CallArgs;
use cache_api::Backend;
use cache_api::Cache;
use cache_api::CacheError;
use cache_api::MatchExist;
use cache_api::TransactionMode;
use cache_api::TransactionOptions;

#[tokio::main]
async fn main() -> Result<(), CacheError> {
    // Create a cache over the in-memory backend
    let cache = Cache::memory();

    // Plain writes
    cache
        .set("user:1", b"alice".to_vec(), None, MatchExist::Any)
        .await?;
    cache
        .set("user:2", b"bob".to_vec(), Some(Duration::from_secs(60)), MatchExist::Any)
        .await?;

    // Concurrent misses of one key run the body once
    let load = cache
        .decorate::<String, CacheError>("load_profile", &["id"])
        .locked(LockedOptions::memoize(Duration::from_secs(60)))?
        .build();

    let profile = load
        .call(CallArgs::new().arg("id", 1), || async { Ok("profile of alice".to_string()) })
        .await?;
    println!("Loaded: {}", profile);

    // Writes in a transaction become visible on commit
    let tx = cache
        .transaction(TransactionOptions::new(TransactionMode::Locked))
        .await?;
    tx.delete("user:1").await?;
    tx.set("user:3", b"carol".to_vec(), None, MatchExist::Any)
        .await?;
    tx.incr("users:count", 2).await?;
    tx.commit().await?;

    // Pattern scan
    for (key, value) in collect_sorted(cache.get_match("user:*").await?).await? {
        println!("Key: {}, Value: {}", key, String::from_utf8_lossy(&value));
    }

    Ok(())
}
