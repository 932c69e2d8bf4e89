use super::*;

fn store() -> SqliteStateStore {
    SqliteStateStore::open_in_memory().expect("open store")
}

fn account(store: &SqliteStateStore, id: &str) -> AccountId {
    let account_id = AccountId::new(id).expect("account id");
    store.upsert_account(&account_id).expect("upsert");
    account_id
}

#[test]
fn open_creates_parent_directories() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("nested").join("seer.db");
    let store = SqliteStateStore::open(&path).expect("open");
    account(&store, "acct-1");
    assert!(path.exists());
}

#[test]
fn upsert_account_is_idempotent() {
    let store = store();
    let id = account(&store, "acct-1");
    let first = store.account_profile(&id).expect("profile").expect("some");
    let second = store.upsert_account(&id).expect("upsert again");
    assert_eq!(first.created_at, second.created_at);
    assert_eq!(second.companion, None);
}

#[test]
fn durable_log_appends_in_order_and_counts_user_turns() {
    let store = store();
    let id = account(&store, "acct-1");
    let log = store.durable_log(id, Persona::Sable, 100);

    assert_eq!(log.append(TurnRole::User, "q1").expect("append"), 1);
    assert_eq!(log.append(TurnRole::Agent, "a1").expect("append"), 2);
    assert_eq!(log.append(TurnRole::User, "q2").expect("append"), 3);

    let turns = log.turns().expect("turns");
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[0].text, "q1");
    assert_eq!(turns[2].ordinal, 3);
    assert_eq!(log.recount().expect("recount"), 2);
}

#[test]
fn logs_are_scoped_per_persona() {
    let store = store();
    let id = account(&store, "acct-1");
    let sable = store.durable_log(id.clone(), Persona::Sable, 100);
    let vesper = store.durable_log(id, Persona::Vesper, 100);

    sable.append(TurnRole::User, "q1").expect("append");
    assert_eq!(vesper.recount().expect("recount"), 0);
    assert!(vesper.turns().expect("turns").is_empty());
}

#[test]
fn retention_cap_prunes_oldest_without_renumbering() {
    let store = store();
    let id = account(&store, "acct-1");
    let log = store.durable_log(id, Persona::Sable, 4);

    for i in 1..=6u64 {
        log.append(TurnRole::User, &format!("q{i}")).expect("append");
    }
    let turns = log.turns().expect("turns");
    assert_eq!(turns.len(), 4);
    // Oldest rows dropped; surviving ordinals untouched.
    assert_eq!(turns[0].ordinal, 3);
    assert_eq!(turns[0].text, "q3");
    assert_eq!(turns[3].ordinal, 6);
}

#[test]
fn tail_digests_return_oldest_first() {
    let store = store();
    let id = account(&store, "acct-1");
    let log = store.durable_log(id.clone(), Persona::Sable, 100);
    log.append(TurnRole::User, "q1").expect("append");
    log.append(TurnRole::Agent, "a1").expect("append");
    log.append(TurnRole::User, "q2").expect("append");

    let digests = store
        .tail_digests(&id, Persona::Sable, 2)
        .expect("digests");
    let turns = log.turns().expect("turns");
    assert_eq!(digests.len(), 2);
    assert_eq!(digests[0], turns[1].content_digest());
    assert_eq!(digests[1], turns[2].content_digest());
}

#[test]
fn first_user_question_skips_agent_turns() {
    let store = store();
    let id = account(&store, "acct-1");
    let log = store.durable_log(id.clone(), Persona::Sable, 100);
    log.append(TurnRole::Agent, "welcome").expect("append");
    log.append(TurnRole::User, "what awaits me?").expect("append");
    log.append(TurnRole::User, "and then?").expect("append");

    assert_eq!(
        store
            .first_user_question(&id, Persona::Sable)
            .expect("question"),
        Some("what awaits me?".to_string())
    );
}

#[test]
fn ritual_state_defaults_to_not_started() {
    let store = store();
    let id = account(&store, "acct-1");
    assert_eq!(
        store.ritual_state(&id, Persona::Sable).expect("state"),
        RitualState::NotStarted
    );
}

#[test]
fn durable_companion_overrides_the_state_row() {
    let store = store();
    let id = account(&store, "acct-1");
    store
        .set_ritual_state(&id, Persona::Sable, RitualState::Proposed)
        .expect("set state");
    store
        .assign_companion_if_empty(&id, "Morning Dew of New Hope")
        .expect("assign");

    // The assignment field is the single source of truth for completion.
    assert_eq!(
        store.ritual_state(&id, Persona::Sable).expect("state"),
        RitualState::Completed
    );
}

#[test]
fn companion_assignment_first_write_wins() {
    let store = store();
    let id = account(&store, "acct-1");
    let first = store
        .assign_companion_if_empty(&id, "Morning Dew of New Hope")
        .expect("assign");
    let second = store
        .assign_companion_if_empty(&id, "Wisteria in Pale Bloom")
        .expect("assign again");
    assert_eq!(first, "Morning Dew of New Hope");
    assert_eq!(second, "Morning Dew of New Hope");
}

#[test]
fn context_floor_round_trips() {
    let store = store();
    let id = account(&store, "acct-1");
    assert_eq!(store.context_floor(&id, Persona::Sable).expect("floor"), None);
    store
        .set_context_floor(&id, Persona::Sable, 7)
        .expect("set floor");
    assert_eq!(
        store.context_floor(&id, Persona::Sable).expect("floor"),
        Some(7)
    );
    // Ritual state set afterwards must not clobber the floor.
    store
        .set_ritual_state(&id, Persona::Sable, RitualState::Proposed)
        .expect("set state");
    assert_eq!(
        store.context_floor(&id, Persona::Sable).expect("floor"),
        Some(7)
    );
}

#[test]
fn migration_record_lifecycle_is_idempotent() {
    let store = store();
    let guest = GuestId::new("guest-1").expect("guest id");
    let id = account(&store, "acct-1");

    let record = store
        .insert_migration_pending(&guest, &id)
        .expect("insert pending");
    assert_eq!(record.status, MigrationStatus::Pending);

    // Retry finds the same pending record.
    let retry = store
        .insert_migration_pending(&guest, &id)
        .expect("insert retry");
    assert_eq!(retry.status, MigrationStatus::Pending);
    assert_eq!(retry.created_at, record.created_at);

    store.mark_migration_done(&guest, &id).expect("mark done");
    let done = store
        .migration_record(&guest, &id)
        .expect("record")
        .expect("some");
    assert_eq!(done.status, MigrationStatus::Done);

    // Re-inserting after done is a no-op, not a resurrection.
    let after = store
        .insert_migration_pending(&guest, &id)
        .expect("insert after done");
    assert_eq!(after.status, MigrationStatus::Done);
}

#[test]
fn second_pending_migration_for_a_guest_conflicts() {
    let store = store();
    let guest = GuestId::new("guest-1").expect("guest id");
    let first = account(&store, "acct-1");
    let second = account(&store, "acct-2");

    store
        .insert_migration_pending(&guest, &first)
        .expect("insert pending");
    let err = store
        .insert_migration_pending(&guest, &second)
        .expect_err("conflict");
    assert_eq!(err.code(), "CONFLICT");
}

#[test]
fn set_nickname_requires_an_existing_account() {
    let store = store();
    let missing = AccountId::new("ghost").expect("id");
    assert!(store.set_nickname(&missing, "someone").is_err());

    let id = account(&store, "acct-1");
    store.set_nickname(&id, "Asha").expect("set nickname");
    let profile = store.account_profile(&id).expect("profile").expect("some");
    assert_eq!(profile.nickname.as_deref(), Some("Asha"));
}
