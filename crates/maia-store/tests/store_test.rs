use std::thread::sleep;
use std::time::Duration;

use maia_store::{
    CreateMemoryInput, CreateNamespaceInput, ListOptions, MemoryType, NamespaceConfig,
    SearchOptions, Store, StoreError, StoreOptions, TimeRange, UpdateMemoryInput,
};

fn open() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(StoreOptions::new(dir.path().join("data"))).unwrap();
    (dir, store)
}

#[test]
fn memory_lifecycle() {
    let (_dir, store) = open();
    let created = store
        .create_memory(CreateMemoryInput::new("t", "hello").with_tags(["a"]))
        .unwrap();
    assert_eq!(created.memory_type, MemoryType::Semantic);
    assert_eq!(created.confidence, 1.0);
    assert_eq!(created.source, "user");

    let got = store.get_memory(&created.id).unwrap();
    assert_eq!(got.content, "hello");
    assert_eq!(got.access_count, 0);

    sleep(Duration::from_millis(5));
    store.touch_memory(&created.id).unwrap();
    let touched = store.get_memory(&created.id).unwrap();
    assert_eq!(touched.access_count, 1);
    assert!(touched.accessed_at > touched.created_at);
    assert_eq!(touched.updated_at, touched.created_at);

    store.touch_memory(&created.id).unwrap();
    assert_eq!(store.get_memory(&created.id).unwrap().access_count, 2);

    store.delete_memory(&created.id).unwrap();
    let err = store.get_memory(&created.id).unwrap_err();
    assert!(err.is_not_found());
    assert!(store.delete_memory(&created.id).unwrap_err().is_not_found());
    assert!(store.touch_memory(&created.id).unwrap_err().is_not_found());
}

#[test]
fn search_requires_every_tag() {
    let (_dir, store) = open();
    store
        .create_memory(CreateMemoryInput::new("t", "one").with_tags(["a"]))
        .unwrap();
    store
        .create_memory(CreateMemoryInput::new("t", "two").with_tags(["b"]))
        .unwrap();
    store
        .create_memory(CreateMemoryInput::new("t", "three").with_tags(["a", "b"]))
        .unwrap();

    let mut opts = SearchOptions::in_namespace("t");
    opts.tags = vec!["a".into()];
    let found = store.search_memories(&opts).unwrap();
    let mut contents: Vec<_> = found.iter().map(|r| r.memory.content.as_str()).collect();
    contents.sort();
    assert_eq!(contents, vec!["one", "three"]);
    assert!(found.iter().all(|r| r.score == 1.0));

    opts.tags = vec!["a".into(), "b".into()];
    let found = store.search_memories(&opts).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].memory.content, "three");
}

#[test]
fn search_filters_type_time_and_spans_namespaces() {
    let (_dir, store) = open();
    let first = store
        .create_memory(CreateMemoryInput::new("t", "fact"))
        .unwrap();
    store
        .create_memory(CreateMemoryInput::new("u", "chat").with_type(MemoryType::Episodic))
        .unwrap();
    store
        .create_memory(CreateMemoryInput::new("u", "howto").with_type(MemoryType::Procedural))
        .unwrap();

    let all = store.search_memories(&SearchOptions::default()).unwrap();
    assert_eq!(all.len(), 3);

    let opts = SearchOptions {
        types: vec![MemoryType::Episodic, MemoryType::Procedural],
        ..Default::default()
    };
    assert_eq!(store.search_memories(&opts).unwrap().len(), 2);

    let opts = SearchOptions {
        time_range: Some(TimeRange {
            start: None,
            end: Some(first.created_at),
        }),
        ..Default::default()
    };
    let found = store.search_memories(&opts).unwrap();
    assert!(found.iter().any(|r| r.memory.id == first.id));

    let opts = SearchOptions {
        limit: 1,
        offset: 1,
        ..Default::default()
    };
    assert_eq!(store.search_memories(&opts).unwrap().len(), 1);
}

#[test]
fn pages_follow_insertion_order() {
    let (_dir, store) = open();
    let mut ids = Vec::new();
    for i in 0..10 {
        let m = store
            .create_memory(CreateMemoryInput::new("t", format!("m{i}")))
            .unwrap();
        ids.push(m.id);
    }
    store
        .create_memory(CreateMemoryInput::new("other", "noise"))
        .unwrap();

    let first: Vec<_> = store
        .list_memories("t", ListOptions::new(5, 0))
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    let second: Vec<_> = store
        .list_memories("t", ListOptions::new(5, 5))
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(first, ids[..5]);
    assert_eq!(second, ids[5..]);
    assert!(first.iter().all(|id| !second.contains(id)));

    // Zero limit falls back to the default page size.
    assert_eq!(store.list_memories("t", ListOptions::new(0, 0)).unwrap().len(), 10);
    assert!(store.list_memories("t", ListOptions::new(5, 20)).unwrap().is_empty());
}

#[test]
fn deleted_memory_never_listed_again() {
    let (_dir, store) = open();
    let keep = store.create_memory(CreateMemoryInput::new("t", "keep")).unwrap();
    let gone = store.create_memory(CreateMemoryInput::new("t", "gone")).unwrap();
    store.delete_memory(&gone.id).unwrap();

    let listed = store.list_memories("t", ListOptions::default()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, keep.id);
    let searched = store
        .search_memories(&SearchOptions::in_namespace("t"))
        .unwrap();
    assert!(searched.iter().all(|r| r.memory.id != gone.id));
}

#[test]
fn nested_namespace_stays_out_of_parent_listing() {
    let (_dir, store) = open();
    let parent = store.create_memory(CreateMemoryInput::new("a", "top")).unwrap();
    store
        .create_memory(CreateMemoryInput::new("a:b", "nested"))
        .unwrap();

    let listed = store.list_memories("a", ListOptions::default()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, parent.id);

    let searched = store
        .search_memories(&SearchOptions::in_namespace("a"))
        .unwrap();
    assert_eq!(searched.len(), 1);
    assert_eq!(searched[0].memory.namespace, "a");

    let nested = store.list_memories("a:b", ListOptions::default()).unwrap();
    assert_eq!(nested.len(), 1);
    assert_eq!(nested[0].content, "nested");
}

#[test]
fn updates_are_monotonic_and_validated() {
    let (_dir, store) = open();
    let m = store.create_memory(CreateMemoryInput::new("t", "v1")).unwrap();

    sleep(Duration::from_millis(5));
    let u1 = store
        .update_memory(
            &m.id,
            UpdateMemoryInput {
                content: Some("v2".into()),
                ..Default::default()
            },
        )
        .unwrap();
    sleep(Duration::from_millis(5));
    let u2 = store
        .update_memory(
            &m.id,
            UpdateMemoryInput {
                tags: Some(vec!["x".into()]),
                ..Default::default()
            },
        )
        .unwrap();

    assert!(u1.updated_at > m.updated_at);
    assert!(u2.updated_at > u1.updated_at);
    assert_eq!(u2.content, "v2");
    assert_eq!(u2.tags, vec!["x".to_string()]);
    assert_eq!(u2.created_at, m.created_at);

    let err = store
        .update_memory(
            &m.id,
            UpdateMemoryInput {
                confidence: Some(-0.1),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidInput { .. }));
    assert!(matches!(
        store.update_memory(
            &m.id,
            UpdateMemoryInput {
                content: Some(String::new()),
                ..Default::default()
            },
        ),
        Err(StoreError::InvalidInput {
            field: "content",
            ..
        })
    ));
    assert_eq!(store.get_memory(&m.id).unwrap().content, "v2");
    assert!(
        store
            .update_memory("missing", UpdateMemoryInput::default())
            .unwrap_err()
            .is_not_found()
    );
}

#[test]
fn create_rejects_empty_fields() {
    let (_dir, store) = open();
    assert!(matches!(
        store.create_memory(CreateMemoryInput::new("t", "")),
        Err(StoreError::InvalidInput {
            field: "content",
            ..
        })
    ));
    assert!(matches!(
        store.create_memory(CreateMemoryInput::new("", "x")),
        Err(StoreError::InvalidInput {
            field: "namespace",
            ..
        })
    ));
}

#[test]
fn batch_create_is_all_or_nothing() {
    let (_dir, store) = open();
    let inputs = vec![
        CreateMemoryInput::new("t", "ok"),
        CreateMemoryInput::new("t", ""),
    ];
    assert!(store.batch_create_memories(inputs).is_err());
    assert_eq!(store.stats().unwrap().total_memories, 0);
    assert!(store.list_memories("t", ListOptions::default()).unwrap().is_empty());

    let created = store
        .batch_create_memories(vec![
            CreateMemoryInput::new("t", "a"),
            CreateMemoryInput::new("t", "b"),
        ])
        .unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].created_at, created[1].created_at);
    let listed: Vec<_> = store
        .list_memories("t", ListOptions::default())
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(listed, vec!["a", "b"]);
}

#[test]
fn namespace_names_are_unique_and_indexed() {
    let (_dir, store) = open();
    let ns = store
        .create_namespace(CreateNamespaceInput::new("team"))
        .unwrap();
    assert_eq!(store.get_namespace_by_name("team").unwrap().id, ns.id);
    assert_eq!(store.get_namespace(&ns.id).unwrap().name, "team");

    let err = store
        .create_namespace(CreateNamespaceInput::new("team"))
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::AlreadyExists {
            kind: "namespace",
            ..
        }
    ));

    sleep(Duration::from_millis(5));
    let updated = store
        .update_namespace(
            &ns.id,
            NamespaceConfig {
                token_budget: 8000,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.config.token_budget, 8000);
    assert!(updated.updated_at > ns.updated_at);

    store
        .create_namespace(CreateNamespaceInput::new("other"))
        .unwrap();
    assert_eq!(store.list_namespaces(ListOptions::default()).unwrap().len(), 2);
    assert_eq!(store.list_namespaces(ListOptions::new(1, 1)).unwrap().len(), 1);

    store.delete_namespace(&ns.id).unwrap();
    assert!(store.get_namespace_by_name("team").unwrap_err().is_not_found());
    // The name is free again once the namespace is gone.
    store
        .create_namespace(CreateNamespaceInput::new("team"))
        .unwrap();
}

#[test]
fn namespace_delete_leaves_memories() {
    let (_dir, store) = open();
    let ns = store.create_namespace(CreateNamespaceInput::new("t")).unwrap();
    store.create_memory(CreateMemoryInput::new("t", "stays")).unwrap();
    store.delete_namespace(&ns.id).unwrap();
    assert_eq!(store.list_memories("t", ListOptions::default()).unwrap().len(), 1);
}

#[test]
fn stats_count_records_and_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let opts = StoreOptions {
        data_dir: dir.path().to_path_buf(),
        sync_writes: true,
    };
    {
        let store = Store::open(opts.clone()).unwrap();
        store.create_memory(CreateMemoryInput::new("t", "a")).unwrap();
        store.create_memory(CreateMemoryInput::new("t", "b")).unwrap();
        store.create_namespace(CreateNamespaceInput::new("t")).unwrap();
        store.close();
    }
    let store = Store::open(opts).unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats.total_memories, 2);
    assert_eq!(stats.total_namespaces, 1);
    assert!(stats.storage_size_bytes > 0);
}
