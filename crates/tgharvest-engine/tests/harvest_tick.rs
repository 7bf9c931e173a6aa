// End-to-end tick behavior against the loopback upstream: routing, joining,
// incremental parsing, dedupe, quarantine and the tick lock/meta plumbing.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use tgharvest_core::config::HarvesterConfig;
use tgharvest_engine::ephemeral::{EphemeralStore, MemoryEphemeral};
use tgharvest_engine::lock::{LOCK_KEY, META_KEY};
use tgharvest_engine::notify::Notify;
use tgharvest_engine::{maintenance, Harvester, TickOutcome};
use tgharvest_store::{
    AccountStatus, ChannelAccessStatus, ChannelType, MembershipStatus, NewAccount, NewChannel,
    Store,
};
use tgharvest_upstream::loopback::{InviteMode, LoopbackFactory, LoopbackWorld};
use tgharvest_upstream::{ClientPool, UpstreamError};

#[derive(Default)]
struct RecordingNotifier {
    operator: Mutex<Vec<String>>,
    staff: Mutex<Vec<String>>,
}

#[async_trait]
impl Notify for RecordingNotifier {
    async fn notify_operator(&self, text: &str) {
        self.operator.lock().unwrap().push(text.to_string());
    }
    async fn notify_staff(&self, text: &str) {
        self.staff.lock().unwrap().push(text.to_string());
    }
}

struct Fixture {
    world: LoopbackWorld,
    store: Arc<Store>,
    pool: Arc<ClientPool>,
    ephemeral: Arc<MemoryEphemeral>,
    notifier: Arc<RecordingNotifier>,
    harvester: Harvester,
}

fn fixture() -> Fixture {
    let mut config = HarvesterConfig::default();
    config.upstream.api_id = Some(1);
    config.upstream.api_hash = Some("test-hash".to_string());

    let world = LoopbackWorld::new();
    let store = Arc::new(Store::open_in_memory().unwrap());
    let ephemeral = Arc::new(MemoryEphemeral::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let pool = Arc::new(ClientPool::new(
        Arc::new(LoopbackFactory::new(world.clone())),
        config.upstream.clone(),
    ));

    let ephemeral_dyn: Arc<dyn EphemeralStore> = ephemeral.clone();
    let notifier_dyn: Arc<dyn Notify> = notifier.clone();
    let harvester = Harvester::new(
        store.clone(),
        pool.clone(),
        ephemeral_dyn,
        notifier_dyn,
        config,
    );

    Fixture {
        world,
        store,
        pool,
        ephemeral,
        notifier,
        harvester,
    }
}

fn seed_account(store: &Store, label: &str) -> i64 {
    store
        .create_account(
            &NewAccount {
                label: label.to_string(),
                phone_number: format!("+1555{label}"),
                session_string: format!("sess-{label}"),
                ..NewAccount::default()
            },
            Utc::now(),
        )
        .unwrap()
        .id
}

fn seed_channel(store: &Store, kind: ChannelType, identifier: &str, backfill_days: u32) -> i64 {
    store
        .create_channel(
            &NewChannel {
                kind,
                identifier: identifier.to_string(),
                title: String::new(),
                backfill_days,
            },
            Utc::now(),
        )
        .unwrap()
        .id
}

// --- Scenario A: happy path, public channel -------------------------------

#[tokio::test]
async fn happy_path_public_channel() {
    let f = fixture();
    let a1 = seed_account(&f.store, "a1");
    let c1 = seed_channel(&f.store, ChannelType::Public, "demo", 0);
    f.world.add_public_channel(100, "demo", "Demo Channel");
    for id in [100, 101, 102] {
        f.world.push_message(100, id, &format!("post {id}"), Utc::now());
    }

    let outcome = f.harvester.run_once(false).await.unwrap();
    assert_eq!(outcome, TickOutcome::Completed);

    let ch = f.store.get_channel(c1).unwrap().unwrap();
    assert_eq!(ch.cursor_message_id, 102);
    assert_eq!(ch.access_status, ChannelAccessStatus::Joined);
    assert_eq!(ch.title, "Demo Channel");
    assert_eq!(ch.peer_id, Some(100));
    assert_eq!(f.store.count_posts(c1).unwrap(), 3);

    let membership = f.store.get_membership(a1, c1).unwrap().unwrap();
    assert_eq!(membership.status, MembershipStatus::Joined);
    assert_eq!(membership.note, "parsed_ok");

    let account = f.store.get_account(a1).unwrap().unwrap();
    assert_eq!(account.status, AccountStatus::Active);
    assert!(account.last_used_at.is_some());

    let posts = f.store.list_recent_posts(c1, 10).unwrap();
    assert_eq!(posts.len(), 3);
    assert_eq!(posts[0].original_url, "https://t.me/demo/102");

    // Public hot path never enumerates dialogs.
    assert_eq!(f.world.dialog_calls_total(), 0);
}

// --- Scenario B: dedupe across ticks --------------------------------------

#[tokio::test]
async fn second_tick_inserts_only_new_messages() {
    let f = fixture();
    seed_account(&f.store, "a1");
    let c1 = seed_channel(&f.store, ChannelType::Public, "demo", 0);
    f.world.add_public_channel(100, "demo", "Demo");
    for id in [100, 101, 102] {
        f.world.push_message(100, id, &format!("post {id}"), Utc::now());
    }
    f.harvester.run_once(false).await.unwrap();

    for id in [103, 104] {
        f.world.push_message(100, id, &format!("post {id}"), Utc::now());
    }
    f.harvester.run_once(false).await.unwrap();

    let ch = f.store.get_channel(c1).unwrap().unwrap();
    assert_eq!(ch.cursor_message_id, 104);
    assert_eq!(f.store.count_posts(c1).unwrap(), 5);

    let meta = f.ephemeral.get_hash(META_KEY).await.unwrap();
    assert_eq!(meta.get("tick_id").map(String::as_str), Some("2"));
    assert_eq!(meta.get("posts_inserted").map(String::as_str), Some("2"));
}

// --- Scenario C: invite request pending + guardrail ------------------------

#[tokio::test]
async fn pending_invite_is_never_resent() {
    let f = fixture();
    let a1 = seed_account(&f.store, "a1");
    let c2 = seed_channel(&f.store, ChannelType::Private, "https://t.me/+SecretHash", 0);
    f.world
        .add_private_channel(200, "SecretHash", "Secret", InviteMode::RequestApproval);

    f.harvester.run_once(false).await.unwrap();

    let membership = f.store.get_membership(a1, c2).unwrap().unwrap();
    assert_eq!(membership.status, MembershipStatus::PendingApproval);
    let ch = f.store.get_channel(c2).unwrap().unwrap();
    assert_eq!(ch.access_status, ChannelAccessStatus::PendingApproval);
    assert_eq!(f.store.count_posts(c2).unwrap(), 0);
    assert_eq!(f.world.invite_request_total(200), 1);

    // Second tick with a second ready account: the guardrail must keep it
    // from importing the invite again.
    let a2 = seed_account(&f.store, "a2");
    f.harvester.run_once(false).await.unwrap();

    assert_eq!(f.world.invite_request_total(200), 1);
    assert!(f.store.get_membership(a2, c2).unwrap().is_none());
    let pending: Vec<_> = f
        .store
        .list_channel_memberships(c2)
        .unwrap()
        .into_iter()
        .filter(|m| m.status.is_pending())
        .collect();
    assert_eq!(pending.len(), 1);
}

// --- Scenario D: quarantine + failover ------------------------------------

#[tokio::test]
async fn frozen_account_is_quarantined_and_the_next_account_finishes() {
    let f = fixture();
    let a1 = seed_account(&f.store, "a1");
    let a2 = seed_account(&f.store, "a2");
    let c1 = seed_channel(&f.store, ChannelType::Public, "demo", 0);
    f.world.add_public_channel(100, "demo", "Demo");
    for id in [100, 101, 102] {
        f.world.push_message(100, id, &format!("post {id}"), Utc::now());
    }
    f.world.set_history_fault(
        a1,
        Some(UpstreamError::Frozen("FROZEN_METHOD_INVALID".to_string())),
    );

    f.harvester.run_once(false).await.unwrap();

    let frozen = f.store.get_account(a1).unwrap().unwrap();
    assert_eq!(frozen.status, AccountStatus::Banned);
    assert!(!frozen.is_active);
    assert_eq!(f.notifier.operator.lock().unwrap().len(), 1);
    assert_eq!(f.notifier.staff.lock().unwrap().len(), 1);

    // The attempt loop moved on to a2 and completed the channel.
    assert_eq!(f.store.count_posts(c1).unwrap(), 3);
    let survivor = f.store.get_account(a2).unwrap().unwrap();
    assert!(survivor.last_used_at.is_some());
}

// --- Scenario E: FloodWait cooldown ---------------------------------------

#[tokio::test]
async fn flood_wait_puts_the_account_on_cooldown() {
    let f = fixture();
    let a1 = seed_account(&f.store, "a1");
    let a2 = seed_account(&f.store, "a2");
    let c1 = seed_channel(&f.store, ChannelType::Public, "demo", 0);
    f.world.add_public_channel(100, "demo", "Demo");
    f.world.push_message(100, 100, "post", Utc::now());
    f.world
        .set_history_fault(a1, Some(UpstreamError::FloodWait { seconds: 120 }));

    let before = Utc::now();
    f.harvester.run_once(false).await.unwrap();

    let cooled = f.store.get_account(a1).unwrap().unwrap();
    assert_eq!(cooled.status, AccountStatus::Cooldown);
    let until = cooled.cooldown_until.unwrap();
    assert!(until >= before + Duration::seconds(119));
    assert!(until <= Utc::now() + Duration::seconds(121));

    // a2 finished the channel, and the selector now skips a1.
    assert_eq!(f.store.count_posts(c1).unwrap(), 1);
    let ch = f.store.get_channel(c1).unwrap().unwrap();
    let pick = f
        .store
        .pick_account_for_channel(&ch, &[], Utc::now())
        .unwrap();
    assert_eq!(pick.account.unwrap().id, a2);
}

// --- Scenario F: tick meta -------------------------------------------------

#[tokio::test]
async fn tick_meta_hash_is_written() {
    let f = fixture();
    seed_account(&f.store, "a1");
    seed_channel(&f.store, ChannelType::Public, "demo", 0);
    f.world.add_public_channel(100, "demo", "Demo");
    f.world.push_message(100, 100, "post", Utc::now());

    f.harvester.run_once(false).await.unwrap();

    let meta = f.ephemeral.get_hash(META_KEY).await.unwrap();
    assert_eq!(meta.get("tick_id").map(String::as_str), Some("1"));
    assert_eq!(meta.get("accounts_checked").map(String::as_str), Some("1"));
    assert_eq!(meta.get("channels_checked").map(String::as_str), Some("1"));
    assert_eq!(meta.get("posts_inserted").map(String::as_str), Some("1"));
    let duration: f64 = meta.get("duration_s").unwrap().parse().unwrap();
    assert!(duration >= 0.0);
    assert!(meta.contains_key("started_at"));
    assert!(meta.contains_key("finished_at"));
}

// --- Lock behavior ---------------------------------------------------------

#[tokio::test]
async fn tick_is_skipped_while_a_foreign_lock_is_held() {
    let f = fixture();
    seed_account(&f.store, "a1");

    f.ephemeral
        .set_nx_ex(LOCK_KEY, "foreign-token", 600)
        .await
        .unwrap();

    let outcome = f.harvester.run_once(false).await.unwrap();
    assert_eq!(outcome, TickOutcome::SkippedLockHeld);

    // Force bypasses acquisition but must never release someone else's lock.
    let outcome = f.harvester.run_once(true).await.unwrap();
    assert_eq!(outcome, TickOutcome::Completed);
    assert_eq!(
        f.ephemeral.get(LOCK_KEY).await.unwrap().as_deref(),
        Some("foreign-token")
    );
}

// --- Cursor resync ---------------------------------------------------------

#[tokio::test]
async fn cursor_without_posts_restarts_as_first_parse() {
    let f = fixture();
    seed_account(&f.store, "a1");
    let c1 = seed_channel(&f.store, ChannelType::Public, "demo", 0);
    f.world.add_public_channel(100, "demo", "Demo");
    for id in [100, 101, 102] {
        f.world.push_message(100, id, &format!("post {id}"), Utc::now());
    }

    // A previous deploy advanced the cursor without keeping the rows.
    f.store
        .update_channel_after_parse(c1, 50, Utc::now(), None, None, None)
        .unwrap();

    f.harvester.run_once(false).await.unwrap();

    let ch = f.store.get_channel(c1).unwrap().unwrap();
    assert_eq!(ch.cursor_message_id, 102);
    assert_eq!(f.store.count_posts(c1).unwrap(), 3);
}

// --- Backfill bound --------------------------------------------------------

#[tokio::test]
async fn backfill_respects_the_window() {
    let f = fixture();
    seed_account(&f.store, "a1");
    let c1 = seed_channel(&f.store, ChannelType::Public, "demo", 2);
    f.world.add_public_channel(100, "demo", "Demo");
    let now = Utc::now();
    f.world
        .push_message(100, 10, "too old", now - Duration::days(5));
    f.world
        .push_message(100, 11, "also old", now - Duration::days(3));
    f.world
        .push_message(100, 12, "recent", now - Duration::days(1));
    f.world.push_message(100, 13, "fresh", now);

    f.harvester.run_once(false).await.unwrap();

    assert_eq!(f.store.count_posts(c1).unwrap(), 2);
    let ch = f.store.get_channel(c1).unwrap().unwrap();
    assert_eq!(ch.cursor_message_id, 13);
}

// --- Empty messages --------------------------------------------------------

#[tokio::test]
async fn whitespace_only_messages_are_never_stored() {
    let f = fixture();
    seed_account(&f.store, "a1");
    let c1 = seed_channel(&f.store, ChannelType::Public, "demo", 0);
    f.world.add_public_channel(100, "demo", "Demo");
    f.world.push_message(100, 100, "   \n\t ", Utc::now());
    f.world.push_message(100, 101, "real text", Utc::now());

    f.harvester.run_once(false).await.unwrap();

    assert_eq!(f.store.count_posts(c1).unwrap(), 1);
    let ch = f.store.get_channel(c1).unwrap().unwrap();
    assert_eq!(ch.cursor_message_id, 101);
}

// --- Unauthorized session --------------------------------------------------

#[tokio::test]
async fn unauthorized_session_is_flagged_and_skipped() {
    let f = fixture();
    let a1 = seed_account(&f.store, "a1");
    let c1 = seed_channel(&f.store, ChannelType::Public, "demo", 0);
    f.world.add_public_channel(100, "demo", "Demo");
    f.world.push_message(100, 100, "post", Utc::now());
    f.world.set_authorized(a1, false);

    f.harvester.run_once(false).await.unwrap();

    let account = f.store.get_account(a1).unwrap().unwrap();
    assert_eq!(account.status, AccountStatus::AuthRequired);
    assert_eq!(f.store.count_posts(c1).unwrap(), 0);
    let ch = f.store.get_channel(c1).unwrap().unwrap();
    assert!(ch.last_error.contains("no eligible account"));
}

// --- Channel-forbidden family ---------------------------------------------

#[tokio::test]
async fn forbidden_channel_is_flagged_and_skipped_next_tick() {
    let f = fixture();
    let a1 = seed_account(&f.store, "a1");
    let c1 = seed_channel(&f.store, ChannelType::Public, "demo", 0);
    f.world.add_public_channel(100, "demo", "Demo");
    f.world.push_message(100, 100, "post", Utc::now());
    f.world.set_history_fault(
        a1,
        Some(UpstreamError::ChannelForbidden("CHANNEL_PRIVATE".to_string())),
    );

    f.harvester.run_once(false).await.unwrap();

    let ch = f.store.get_channel(c1).unwrap().unwrap();
    assert_eq!(ch.access_status, ChannelAccessStatus::Forbidden);
    let membership = f.store.get_membership(a1, c1).unwrap().unwrap();
    assert_eq!(membership.status, MembershipStatus::Forbidden);

    // Next tick treats the channel as non-actionable.
    f.harvester.run_once(false).await.unwrap();
    let meta = f.ephemeral.get_hash(META_KEY).await.unwrap();
    assert_eq!(meta.get("channels_total").map(String::as_str), Some("0"));
}

// --- Maintenance: approval advances pending memberships --------------------

#[tokio::test]
async fn approved_join_request_upgrades_membership_and_unblocks_parsing() {
    let f = fixture();
    let a1 = seed_account(&f.store, "a1");
    let c2 = seed_channel(&f.store, ChannelType::Private, "t.me/+SecretHash", 0);
    f.world
        .add_private_channel(200, "SecretHash", "Secret", InviteMode::RequestApproval);
    f.world.push_message(200, 50, "secret post", Utc::now());

    f.harvester.run_once(false).await.unwrap();
    assert_eq!(
        f.store.get_membership(a1, c2).unwrap().unwrap().status,
        MembershipStatus::PendingApproval
    );

    // An admin approves; backdate the membership so the 6h recheck window
    // has elapsed.
    f.world.approve_requests(200);
    f.store
        .upsert_membership(
            a1,
            c2,
            MembershipStatus::PendingApproval,
            "join request sent (pending approval)",
            Utc::now() - Duration::hours(7),
        )
        .unwrap();

    let summary = maintenance::ensure_membership_once(&f.store, &f.pool, 50)
        .await
        .unwrap();
    assert_eq!(summary.memberships_updated, 1);
    let membership = f.store.get_membership(a1, c2).unwrap().unwrap();
    assert_eq!(membership.status, MembershipStatus::Joined);
    assert!(membership.note.contains("approved"));

    // With membership in place the next tick parses via dialogs.
    f.harvester.run_once(false).await.unwrap();
    assert_eq!(f.store.count_posts(c2).unwrap(), 1);
    let ch = f.store.get_channel(c2).unwrap().unwrap();
    assert_eq!(ch.access_status, ChannelAccessStatus::Joined);
    assert_eq!(ch.peer_id, Some(200));
    assert_eq!(f.world.invite_request_total(200), 1);
}

// --- Maintenance: joined membership that vanished from dialogs --------------

#[tokio::test]
async fn missing_dialog_entity_flags_joined_membership() {
    let f = fixture();
    let a1 = seed_account(&f.store, "a1");
    let c2 = seed_channel(&f.store, ChannelType::Private, "+SecretHash", 0);
    f.world
        .add_private_channel(200, "SecretHash", "Secret", InviteMode::Accept);

    // Joined long ago, never since verified; the account is no longer a
    // member upstream.
    f.store
        .upsert_membership(
            a1,
            c2,
            MembershipStatus::Joined,
            "parsed_ok",
            Utc::now() - Duration::days(2),
        )
        .unwrap();

    let summary = maintenance::ensure_membership_once(&f.store, &f.pool, 50)
        .await
        .unwrap();
    assert_eq!(summary.memberships_updated, 1);
    let membership = f.store.get_membership(a1, c2).unwrap().unwrap();
    assert_eq!(membership.status, MembershipStatus::Error);
    assert!(membership.note.contains("missing from dialogs"));
}
