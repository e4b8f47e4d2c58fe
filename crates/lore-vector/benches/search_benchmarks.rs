//! Benchmarks for hybrid fact search.
//!
//! The store is seeded with 1,000 facts spread over 20 characters. Set
//! `BENCH_FULL_SCALE=1` to seed 20,000 facts instead, enough to push the fact
//! index into IVF mode.
//!
//! ```bash
//! BENCH_FULL_SCALE=1 cargo bench -p lore-vector
//! ```
//!
//! The query vector is cached after the first iteration, so the numbers cover
//! candidate retrieval and ranking, not the provider.

use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use lore_core::config::{ProviderConfig, SearchConfig, StorageConfig};
use lore_core::deadline::Deadline;
use lore_core::text::normalize;
use lore_core::types::{Character, Fact, SearchFilters};
use lore_storage::{Database, KnowledgeStore};
use lore_vector::{
    Embedder, EmbeddingCache, HybridSearchEngine, MockProvider, ProviderClient, SearchRequest,
};

const DIM: usize = 64;
const CI_FACT_COUNT: usize = 1_000;
const FULL_SCALE_FACT_COUNT: usize = 20_000;
const CHARACTERS: usize = 20;

const TRAITS: &[&str] = &[
    "冷静", "果断", "勇敢", "忠诚", "狡猾", "剑术", "魔法", "青帮", "善良", "暴躁", "弓箭", "商人",
];

fn fact_count() -> usize {
    if std::env::var("BENCH_FULL_SCALE").is_ok() {
        FULL_SCALE_FACT_COUNT
    } else {
        CI_FACT_COUNT
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
}

/// Seed a store and return an engine over it plus one owner id for filtering.
fn build_engine(rt: &tokio::runtime::Runtime, count: usize) -> (HybridSearchEngine, uuid::Uuid) {
    rt.block_on(async {
        let mock = Arc::new(MockProvider::new(DIM));
        let db = Arc::new(Database::in_memory().expect("open db"));
        let store = KnowledgeStore::open(db, DIM, &StorageConfig::default())
            .await
            .expect("open store");

        let mut owners = Vec::with_capacity(CHARACTERS);
        for i in 0..CHARACTERS {
            let c = Character::new(&format!("角色{}", i), vec![], "", vec![]).expect("character");
            store.create_character(&c).await.expect("create character");
            owners.push(c.id);
        }

        for i in 0..count {
            let content = format!(
                "第{}条记录：此人{}而{}，常在城南出没",
                i,
                TRAITS[i % TRAITS.len()],
                TRAITS[(i / TRAITS.len()) % TRAITS.len()]
            );
            let mut fact = Fact::new(owners[i % CHARACTERS], "性格", &content, None, vec![])
                .expect("fact");
            fact.embedding = Some(mock.vector_for(&normalize(&content)));
            store.add_fact(&fact).await.expect("add fact");
        }
        store.rebuild_indexes().await.expect("rebuild");

        let client = ProviderClient::new(mock, &ProviderConfig::default(), DIM);
        let embedder = Embedder::new(Arc::new(client), Arc::new(EmbeddingCache::new(1_000, None)));
        let engine = HybridSearchEngine::new(store, embedder, SearchConfig::default());
        (engine, owners[0])
    })
}

fn bench_hybrid_search(c: &mut Criterion) {
    let count = fact_count();
    let rt = runtime();
    let (engine, owner) = build_engine(&rt, count);

    let mut group = c.benchmark_group("hybrid_search");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function(format!("unfiltered_top10_{}facts", count), |b| {
        let request = SearchRequest::new("冷静果断的人").with_limit(10);
        b.iter(|| {
            let response = rt
                .block_on(engine.search_facts(&request, Deadline::none()))
                .expect("search failed");
            assert!(!response.hits.is_empty(), "search should return results");
            response
        });
    });

    group.bench_function(format!("character_filtered_top10_{}facts", count), |b| {
        let request = SearchRequest::new("冷静果断的人")
            .with_limit(10)
            .with_filters(SearchFilters {
                character_ids: vec![owner],
                ..Default::default()
            });
        b.iter(|| {
            rt.block_on(engine.search_facts(&request, Deadline::none()))
                .expect("search failed")
        });
    });

    group.finish();
}

criterion_group!(benches, bench_hybrid_search);
criterion_main!(benches);
