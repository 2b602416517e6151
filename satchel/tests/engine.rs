//! End-to-end engine behavior: local operations, restart recovery,
//! encryption at rest, and pairwise convergence through sync payloads.

use satchel::{
    Config, ContentKey, Engine, EntryKind, Error, EventKind, ListFilter,
};

fn memory_engine() -> Engine {
    Engine::open(Config::in_memory()).unwrap()
}

/// One full exchange in each direction, as the transport would drive it.
fn sync_both_ways(a: &Engine, b: &Engine) {
    let payload = a.sync_payload().unwrap();
    b.apply_sync_payload(&payload).unwrap();
    let payload = b.sync_payload().unwrap();
    a.apply_sync_payload(&payload).unwrap();
}

#[test]
fn add_get_update_remove_round_trip() {
    let engine = memory_engine();
    let entry = engine
        .add(
            EntryKind::Note,
            b"first".to_vec(),
            vec!["inbox".into()],
        )
        .unwrap();
    assert_eq!(engine.get(entry.id).unwrap(), entry);

    engine
        .update(entry.id, Some(b"second".to_vec()), None)
        .unwrap();
    let fetched = engine.get(entry.id).unwrap();
    assert_eq!(fetched.payload, b"second");
    assert_eq!(fetched.tags, vec!["inbox".to_string()]);
    assert!(fetched.updated_time > entry.updated_time);

    engine.remove(entry.id).unwrap();
    assert!(matches!(
        engine.get(entry.id),
        Err(Error::Tombstoned(id)) if id == entry.id
    ));
    assert!(matches!(
        engine.update(entry.id, Some(b"too late".to_vec()), None),
        Err(Error::Tombstoned(_))
    ));
}

#[test]
fn list_filters_and_replica_tags() {
    let engine = memory_engine();
    let note = engine
        .add(EntryKind::Note, b"n".to_vec(), vec!["work".into()])
        .unwrap();
    engine
        .add(EntryKind::Log, b"l".to_vec(), vec!["work".into()])
        .unwrap();
    let gone = engine.add(EntryKind::Note, b"x".to_vec(), vec![]).unwrap();
    engine.remove(gone.id).unwrap();

    assert_eq!(engine.list(&ListFilter::default()).unwrap().len(), 2);
    assert_eq!(engine.list(&ListFilter::everything()).unwrap().len(), 3);

    let notes = engine
        .list(&ListFilter {
            kind: Some(EntryKind::Note),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].id, note.id);

    let tagged = engine
        .list(&ListFilter {
            tag: Some("work".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(tagged.len(), 2);
}

#[test]
fn events_track_the_entry_lifecycle() {
    let engine = memory_engine();
    let sub = engine.subscribe();

    let entry = engine.add(EntryKind::Log, b"e".to_vec(), vec![]).unwrap();
    engine.update(entry.id, Some(b"e2".to_vec()), None).unwrap();
    engine.remove(entry.id).unwrap();

    let kinds: Vec<EventKind> = std::iter::from_fn(|| sub.try_recv())
        .map(|event| {
            assert_eq!(event.entry_id, entry.id);
            assert_eq!(event.entry_kind, Some(EntryKind::Log));
            event.kind
        })
        .collect();
    assert_eq!(
        kinds,
        vec![EventKind::Created, EventKind::Updated, EventKind::Removed]
    );
}

#[test]
fn single_create_converges() {
    let a = memory_engine();
    let b = memory_engine();
    let entry = a
        .add(
            EntryKind::Note,
            b"hi".to_vec(),
            vec!["a".into()],
        )
        .unwrap();

    let payload = a.sync_payload().unwrap();
    let sub = b.subscribe();
    b.apply_sync_payload(&payload).unwrap();

    let fetched = b.get(entry.id).unwrap();
    assert_eq!(fetched.payload, b"hi");
    assert_eq!(fetched.tags, vec!["a".to_string()]);

    let event = sub.try_recv().expect("a synced event");
    assert_eq!(event.kind, EventKind::Synced);
    assert_eq!(event.entry_id, entry.id);

    // Re-applying the identical state changes nothing and stays silent.
    b.apply_sync_payload(&payload).unwrap();
    assert!(sub.try_recv().is_none());
}

#[test]
fn concurrent_payload_edits_resolve_to_the_later_writer() {
    let a = memory_engine();
    let b = memory_engine();
    let entry = a.add(EntryKind::Note, b"base".to_vec(), vec![]).unwrap();
    sync_both_ways(&a, &b);

    // A edits immediately; B first burns through ten unrelated inserts, so
    // its edit carries the higher logical time.
    a.update(entry.id, Some(b"from-a".to_vec()), None).unwrap();
    for i in 0..10 {
        b.add(EntryKind::Log, format!("filler {i}").into_bytes(), vec![])
            .unwrap();
    }
    b.update(entry.id, Some(b"from-b".to_vec()), None).unwrap();

    sync_both_ways(&a, &b);
    assert_eq!(a.get(entry.id).unwrap().payload, b"from-b");
    assert_eq!(b.get(entry.id).unwrap().payload, b"from-b");
}

#[test]
fn tombstone_dominates_concurrent_update() {
    let a = memory_engine();
    let b = memory_engine();
    let entry = a.add(EntryKind::Note, b"base".to_vec(), vec![]).unwrap();
    sync_both_ways(&a, &b);

    a.update(entry.id, Some(b"survives?".to_vec()), None).unwrap();
    for i in 0..10 {
        b.add(EntryKind::Log, format!("filler {i}").into_bytes(), vec![])
            .unwrap();
    }
    b.remove(entry.id).unwrap();

    sync_both_ways(&a, &b);
    assert!(matches!(a.get(entry.id), Err(Error::Tombstoned(_))));
    assert!(matches!(b.get(entry.id), Err(Error::Tombstoned(_))));
    // The projection agrees with the replica.
    assert!(a
        .list(&ListFilter::default())
        .unwrap()
        .iter()
        .all(|e| e.id != entry.id));
}

#[test]
fn concurrent_tag_edits_union() {
    let a = memory_engine();
    let b = memory_engine();
    let entry = a
        .add(
            EntryKind::Note,
            b"tagged".to_vec(),
            vec!["initial".into()],
        )
        .unwrap();
    sync_both_ways(&a, &b);

    a.update(
        entry.id,
        None,
        Some(vec!["initial".into(), "A".into()]),
    )
    .unwrap();
    b.update(
        entry.id,
        None,
        Some(vec!["initial".into(), "B".into()]),
    )
    .unwrap();

    sync_both_ways(&a, &b);
    let expected = vec!["A".to_string(), "B".to_string(), "initial".to_string()];
    assert_eq!(a.get(entry.id).unwrap().tags, expected);
    assert_eq!(b.get(entry.id).unwrap().tags, expected);
}

#[test]
fn restart_recovers_clock_entries_and_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let config = || Config::persistent(dir.path());

    let (kept, removed, max_before) = {
        let engine = Engine::open(config()).unwrap();
        let kept = engine
            .add(
                EntryKind::Note,
                b"kept".to_vec(),
                vec!["sticky".into()],
            )
            .unwrap();
        let removed = engine.add(EntryKind::Log, b"gone".to_vec(), vec![]).unwrap();
        engine.remove(removed.id).unwrap();
        let max = engine.get(kept.id).unwrap().updated_time.max(3);
        engine.close().unwrap();
        (kept, removed, max)
    };

    let engine = Engine::open(config()).unwrap();
    let fetched = engine.get(kept.id).unwrap();
    assert_eq!(fetched.payload, b"kept");
    assert_eq!(fetched.tags, vec!["sticky".to_string()]);
    assert!(matches!(
        engine.get(removed.id),
        Err(Error::Tombstoned(_))
    ));

    // The recovered clock keeps logical time monotone across the restart.
    let fresh = engine.add(EntryKind::Note, b"after".to_vec(), vec![]).unwrap();
    assert!(fresh.updated_time > max_before);
}

#[test]
fn encrypted_payloads_round_trip_and_stay_sealed_at_rest() {
    let dir = tempfile::tempdir().unwrap();
    let key = ContentKey::generate();

    let entry = {
        let engine =
            Engine::open(Config::persistent(dir.path()).with_content_key(key.clone())).unwrap();
        let entry = engine
            .add(EntryKind::Note, b"plain secret".to_vec(), vec![])
            .unwrap();
        assert_eq!(entry.payload, b"plain secret");
        assert_eq!(engine.get(entry.id).unwrap().payload, b"plain secret");
        engine.close().unwrap();
        entry
    };

    // Reopened without the key, the engine serves the raw ciphertext.
    {
        let engine = Engine::open(Config::persistent(dir.path())).unwrap();
        let sealed = engine.get(entry.id).unwrap().payload;
        assert_ne!(sealed, b"plain secret");
        assert!(sealed.len() > b"plain secret".len());
        engine.close().unwrap();
    }

    // With the wrong key, decryption fails loudly.
    {
        let engine = Engine::open(
            Config::persistent(dir.path()).with_content_key(ContentKey::generate()),
        )
        .unwrap();
        assert!(matches!(engine.get(entry.id), Err(Error::Crypto(_))));
        engine.close().unwrap();
    }

    // With the right key, everything is back.
    let engine = Engine::open(Config::persistent(dir.path()).with_content_key(key)).unwrap();
    assert_eq!(engine.get(entry.id).unwrap().payload, b"plain secret");
}

#[test]
fn encrypted_replicas_sync_ciphertext() {
    let key = ContentKey::generate();
    let a = Engine::open(Config {
        content_key: Some(key.clone()),
        ..Config::in_memory()
    })
    .unwrap();
    let b = Engine::open(Config {
        content_key: Some(key),
        ..Config::in_memory()
    })
    .unwrap();

    let entry = a
        .add(EntryKind::Note, b"shared secret".to_vec(), vec![])
        .unwrap();
    sync_both_ways(&a, &b);
    assert_eq!(b.get(entry.id).unwrap().payload, b"shared secret");
}

#[test]
fn blobs_live_under_the_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(Config::persistent(dir.path())).unwrap();
    let cid = engine.add_blob(b"attachment bytes").unwrap();
    assert_eq!(engine.get_blob(&cid).unwrap(), b"attachment bytes");
    assert!(dir.path().join("blobs").is_dir());

    let memory_only = memory_engine();
    assert!(matches!(
        memory_only.add_blob(b"nowhere to go"),
        Err(Error::BlobsUnavailable)
    ));
}

#[test]
fn malformed_sync_payload_is_rejected() {
    let engine = memory_engine();
    assert!(matches!(
        engine.apply_sync_payload(&[0xff, 0x00, 0xab]),
        Err(Error::Payload(_))
    ));
    // The replica is untouched by the failed apply.
    assert_eq!(engine.list(&ListFilter::default()).unwrap().len(), 0);
}
