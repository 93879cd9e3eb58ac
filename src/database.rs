// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The `DatabaseObject` external contract and the `ReplicatedDatabase` state
//! machine built on top of it (spec.md §3, §4.3, §4.4).

use crate::error::{Error, Result};
use crate::peer_id::PeerId;
use crate::wire::{UpdateKind, UpdateRecord};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Context under which a `DatabaseObject` callback runs, replacing the
/// nest-count re-entrancy guards of the original with an explicit parameter
/// (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyContext {
    Senior,
    Junior,
}

/// Capability set an application implements once per database index
/// (spec.md §4.3). Callbacks run on the main thread and must not block on
/// I/O.
pub trait DatabaseObject: Send {
    /// Restore to the well-known empty/initial state. Must be deterministic.
    fn reset_to_default(&mut self);

    /// Replace entire state from a byte-string previously produced by
    /// [`DatabaseObject::save_to_archive`]. Fails only on malformed input.
    fn set_from_archive(&mut self, bytes: &[u8]) -> Result<()>;

    /// Serialize entire current state; round-trips with `set_from_archive`.
    fn save_to_archive(&self) -> Vec<u8>;

    /// O(1) accessor for the running checksum maintained incrementally.
    fn running_checksum(&self) -> u32;

    /// From-scratch recomputation, used only for sanity-checking a mismatch.
    fn recalculate_checksum(&self) -> u32;

    /// Called on the senior; mutates state and returns the payload juniors
    /// must receive to reach the same state. `None` means "refuse".
    fn apply_senior(&mut self, context: ApplyContext, request_payload: &[u8]) -> Option<Vec<u8>>;

    /// Called on every junior to apply the senior's computed reply.
    fn apply_junior(&mut self, context: ApplyContext, reply_payload: &[u8]);

    /// Human-readable dump for diagnostics.
    fn describe(&self) -> String;
}

/// Outstanding repair request key (spec.md §3): `update_id == FULL_RESEND`
/// means "full-database resend".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackOrderKey {
    pub target_peer: PeerId,
    pub database_index: u16,
    pub update_id: u64,
}

/// What a pulse of [`ReplicatedDatabase`] wants its owner to do on its
/// behalf — send wire traffic or issue a repair request. Kept as plain data
/// so the replication state machine itself never touches a socket.
#[derive(Debug, Clone)]
pub enum DatabaseAction {
    /// Multicast this record (senior emitting a freshly-applied or
    /// not-yet-sent log entry).
    MulticastUpdate(Arc<UpdateRecord>),
    /// Unicast a back-order request to `target`.
    RequestBackOrder { target: PeerId, database_index: u16, update_id: u64 },
    /// Unicast a back-order reply to `target` (senior servicing a junior's
    /// repair request). `None` means "no such record" (already trimmed).
    ReplyBackOrder { target: PeerId, database_index: u16, update_id: u64, record: Option<Arc<UpdateRecord>> },
}

/// Per-database replicated state (spec.md §3's `DatabaseState`).
pub struct DatabaseState {
    database_index: u16,
    local_id: u64,
    senior_id: u64,
    senior_oldest_id: u64,
    senior_received: bool,
    log: BTreeMap<u64, Arc<UpdateRecord>>,
    log_bytes: u64,
    max_log_bytes: u64,
    first_unsent_id: u64,
    back_orders: HashSet<BackOrderKey>,
    rescan_pending: bool,
    full_resend_in_flight: bool,
}

impl DatabaseState {
    pub fn new(database_index: u16, max_log_bytes: u64) -> Self {
        DatabaseState {
            database_index,
            local_id: 0,
            senior_id: 0,
            senior_oldest_id: u64::MAX,
            senior_received: false,
            log: BTreeMap::new(),
            log_bytes: 0,
            max_log_bytes,
            first_unsent_id: 1,
            back_orders: HashSet::new(),
            rescan_pending: false,
            full_resend_in_flight: false,
        }
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    /// `target_id = max(senior_id, max_log_key)`.
    fn target_id(&self) -> u64 {
        let max_log_key = self.log.keys().next_back().copied().unwrap_or(0);
        self.senior_id.max(max_log_key)
    }

    pub fn is_caught_up(&self) -> bool {
        self.local_id == self.target_id()
    }

    pub fn log_contains(&self, id: u64) -> bool {
        self.log.contains_key(&id)
    }

    pub fn payload_of(&self, id: u64) -> Option<Vec<u8>> {
        self.log.get(&id).map(|r| r.payload.clone())
    }

    fn insert_log(&mut self, record: Arc<UpdateRecord>) {
        self.log_bytes += record.payload.len() as u64;
        self.log.insert(record.update_id, record);
    }

    fn remove_log(&mut self, id: u64) -> Option<Arc<UpdateRecord>> {
        let removed = self.log.remove(&id);
        if let Some(r) = &removed {
            self.log_bytes = self.log_bytes.saturating_sub(r.payload.len() as u64);
        }
        removed
    }
}

/// One instance per database index, owned by the peer (spec.md §4.4).
pub struct ReplicatedDatabase {
    state: DatabaseState,
    object: Box<dyn DatabaseObject>,
    self_id: PeerId,
    is_senior: bool,
    current_senior: Option<PeerId>,
    next_update_id_hint: u64,
}

impl ReplicatedDatabase {
    pub fn new(database_index: u16, max_log_bytes: u64, self_id: PeerId, object: Box<dyn DatabaseObject>) -> Self {
        ReplicatedDatabase {
            state: DatabaseState::new(database_index, max_log_bytes),
            object,
            self_id,
            is_senior: false,
            current_senior: None,
            next_update_id_hint: 1,
        }
    }

    pub fn database_index(&self) -> u16 {
        self.state.database_index
    }

    pub fn current_state_id(&self) -> u64 {
        self.state.local_id
    }

    pub fn log_contains(&self, id: u64) -> bool {
        self.state.log_contains(id)
    }

    pub fn payload_of(&self, id: u64) -> Option<Vec<u8>> {
        self.state.payload_of(id)
    }

    pub fn checksum(&self) -> u32 {
        self.object.running_checksum()
    }

    pub fn object(&self) -> &dyn DatabaseObject {
        self.object.as_ref()
    }

    /// Called by the peer assembly whenever `MembershipView` reports a new
    /// senior (or none).
    pub fn set_senior(&mut self, senior: Option<PeerId>) {
        self.is_senior = senior == Some(self.self_id);
        self.current_senior = senior;
    }

    fn require_senior(&self) -> Result<()> {
        if self.is_senior {
            Ok(())
        } else {
            Err(Error::UnknownSenior)
        }
    }

    /// Applies locally if senior; returns the request ready to forward to
    /// the senior otherwise (spec.md §4.4). The caller is responsible for
    /// actually sending a junior request over the wire — this library keeps
    /// the replication state machine free of socket access.
    pub fn request_reset(&mut self) -> Result<Option<UpdateRecord>> {
        self.request(UpdateKind::Reset, &[])
    }

    pub fn request_replace(&mut self, new_state_bytes: &[u8]) -> Result<Option<UpdateRecord>> {
        self.request(UpdateKind::Replace, new_state_bytes)
    }

    pub fn request_update(&mut self, delta_bytes: &[u8]) -> Result<Option<UpdateRecord>> {
        self.request(UpdateKind::Update, delta_bytes)
    }

    fn request(&mut self, kind: UpdateKind, payload: &[u8]) -> Result<Option<UpdateRecord>> {
        if self.current_senior.is_none() {
            return Err(Error::UnknownSenior);
        }
        if !self.is_senior {
            // Junior: caller forwards this record as a request to the senior.
            return Ok(Some(UpdateRecord {
                kind,
                database_index: self.state.database_index,
                senior_elapsed_millis: 0,
                senior_start_network_time: 0,
                source: self.self_id,
                update_id: 0,
                pre_update_checksum: 0,
                post_update_checksum: 0,
                self_checksum: 0,
                payload: payload.to_vec(),
            }));
        }
        self.apply_senior_request(kind, self.self_id, payload)?;
        Ok(None)
    }

    /// Senior-path algorithm (spec.md §4.4 steps 1-5). `requester` lets a
    /// request forwarded from a junior be applied under its originating
    /// identity even though it's processed on the senior.
    pub fn apply_senior_request(&mut self, kind: UpdateKind, requester: PeerId, payload: &[u8]) -> Result<Arc<UpdateRecord>> {
        self.require_senior()?;

        let update_id = self.next_update_id_hint.max(self.state.local_id + 1);
        let pre_checksum = self.object.running_checksum();

        let reply_payload = match kind {
            UpdateKind::Reset => {
                self.object.reset_to_default();
                Vec::new()
            }
            UpdateKind::Noop => Vec::new(),
            UpdateKind::Replace => {
                self.object.set_from_archive(payload)?;
                payload.to_vec()
            }
            UpdateKind::Update => match self.object.apply_senior(ApplyContext::Senior, payload) {
                Some(reply) => reply,
                None => return Err(Error::DatabaseRefused),
            },
        };

        let post_checksum = self.object.running_checksum();
        let record = Arc::new(UpdateRecord {
            kind,
            database_index: self.state.database_index,
            senior_elapsed_millis: 0,
            senior_start_network_time: 0,
            source: requester,
            update_id,
            pre_update_checksum: pre_checksum,
            post_update_checksum: post_checksum,
            self_checksum: 0,
            payload: reply_payload,
        });

        self.state.insert_log(record.clone());
        self.state.local_id = update_id;
        self.state.senior_id = update_id;
        self.next_update_id_hint = update_id + 1;
        self.state.rescan_pending = true;
        Ok(record)
    }

    /// Junior-path algorithm (spec.md §4.4): drains `rescan_pending`,
    /// applying contiguous log entries, and returns the actions the owner
    /// must perform (back-order requests, full-resend requests).
    pub fn rescan(&mut self) -> Vec<DatabaseAction> {
        if !self.state.rescan_pending {
            return Vec::new();
        }
        self.state.rescan_pending = false;
        let mut actions = Vec::new();

        if self.is_senior {
            return self.drain_senior_emission(&mut actions);
        }

        let target = self.state.target_id();
        while self.state.local_id < target {
            let next = self.state.local_id + 1;
            if let Some(record) = self.state.log.get(&next).cloned() {
                if self.apply_junior_record(&record).is_err() {
                    self.request_full_resend(&mut actions);
                    break;
                }
            } else if next < self.state.senior_oldest_id {
                self.request_full_resend(&mut actions);
                break;
            } else {
                let key = BackOrderKey { target_peer: self.current_senior.unwrap_or(PeerId::INVALID), database_index: self.state.database_index, update_id: next };
                if self.state.back_orders.insert(key) {
                    actions.push(DatabaseAction::RequestBackOrder {
                        target: key.target_peer,
                        database_index: self.state.database_index,
                        update_id: next,
                    });
                }
                break;
            }
        }

        self.trim_log();
        actions
    }

    fn apply_junior_record(&mut self, record: &UpdateRecord) -> Result<()> {
        let actual_pre = self.object.running_checksum();
        if actual_pre != record.pre_update_checksum {
            return Err(Error::ChecksumMismatch { expected: record.pre_update_checksum, actual: actual_pre });
        }
        match record.kind {
            UpdateKind::Reset => self.object.reset_to_default(),
            UpdateKind::Replace => self.object.set_from_archive(&record.payload)?,
            UpdateKind::Update => self.object.apply_junior(ApplyContext::Junior, &record.payload),
            UpdateKind::Noop => {}
        }
        let actual_post = self.object.running_checksum();
        if actual_post != record.post_update_checksum {
            return Err(Error::ChecksumMismatch { expected: record.post_update_checksum, actual: actual_post });
        }
        self.state.local_id = record.update_id;
        Ok(())
    }

    fn request_full_resend(&mut self, actions: &mut Vec<DatabaseAction>) {
        if self.state.full_resend_in_flight {
            return;
        }
        self.state.full_resend_in_flight = true;
        let target = self.current_senior.unwrap_or(PeerId::INVALID);
        let key = BackOrderKey { target_peer: target, database_index: self.state.database_index, update_id: u64::MAX };
        self.state.back_orders.insert(key);
        actions.push(DatabaseAction::RequestBackOrder {
            target,
            database_index: self.state.database_index,
            update_id: u64::MAX,
        });
    }

    fn drain_senior_emission(&mut self, actions: &mut Vec<DatabaseAction>) -> Vec<DatabaseAction> {
        let max_key = self.state.log.keys().next_back().copied().unwrap_or(0);
        while self.state.first_unsent_id <= max_key {
            if let Some(record) = self.state.log.get(&self.state.first_unsent_id).cloned() {
                actions.push(DatabaseAction::MulticastUpdate(record));
            }
            self.state.first_unsent_id += 1;
        }
        self.trim_log();
        std::mem::take(actions)
    }

    /// Called by the owner when a new beacon arrives from the current
    /// senior (spec.md §4.4 "Beacon handling").
    pub fn on_beacon(&mut self, sender: PeerId, current_id: u64, oldest_id: u64) {
        if self.current_senior != Some(sender) {
            return;
        }
        if !self.state.senior_received || self.state.senior_id != current_id || self.state.senior_oldest_id != oldest_id {
            self.state.senior_received = true;
            self.state.senior_id = current_id;
            self.state.senior_oldest_id = oldest_id;
            self.state.rescan_pending = true;
        }
    }

    /// Called by the owner when an `UpdateRecord` arrives on the multicast
    /// data channel (spec.md §2 data flow: senior multicasts, junior
    /// replays). Juniors stage the record in the log and mark a rescan;
    /// the senior ignores its own multicast (self-echo) since the record
    /// is already applied and logged. A record at or below `local_id` is a
    /// stale redelivery and is dropped.
    pub fn on_multicast_update(&mut self, record: UpdateRecord) {
        if self.is_senior || record.update_id <= self.state.local_id || self.state.log.contains_key(&record.update_id) {
            return;
        }
        let key = BackOrderKey { target_peer: self.current_senior.unwrap_or(PeerId::INVALID), database_index: self.state.database_index, update_id: record.update_id };
        self.state.back_orders.remove(&key);
        self.state.insert_log(Arc::new(record));
        self.state.rescan_pending = true;
    }

    /// Our own `(current_id, oldest_id, checksum)` tuple to publish in the
    /// next beacon (senior only).
    pub fn beacon_info(&self) -> (u64, u64, u32) {
        let oldest = self.state.log.keys().next().copied().unwrap_or(self.state.local_id);
        (self.state.local_id, oldest, self.object.running_checksum())
    }

    /// Called by the owner when an `UpdateRecord` arrives as a back-order
    /// reply (spec.md §4.4 "Back-order reply handling"). `None` means the
    /// target peer went offline or had no such record.
    pub fn on_back_order_reply(&mut self, from: PeerId, update_id: u64, record: Option<UpdateRecord>) {
        let key = BackOrderKey { target_peer: from, database_index: self.state.database_index, update_id };
        if !self.state.back_orders.remove(&key) {
            return;
        }
        if update_id == u64::MAX {
            self.state.full_resend_in_flight = false;
            if let Some(record) = record {
                if self.object.set_from_archive(&record.payload).is_ok() {
                    self.state.local_id = record.update_id;
                    self.state.log.clear();
                    self.state.log_bytes = 0;
                    self.state.insert_log(Arc::new(record));
                }
            }
            self.state.rescan_pending = true;
            return;
        }
        if let Some(record) = record {
            self.state.insert_log(Arc::new(record));
            self.state.rescan_pending = true;
        }
    }

    /// Senior services an incoming back-order request from a junior,
    /// returning the action to reply with.
    pub fn service_back_order(&self, requester: PeerId, update_id: u64) -> DatabaseAction {
        if update_id == u64::MAX {
            let archive = self.object.save_to_archive();
            let record = Arc::new(UpdateRecord {
                kind: UpdateKind::Replace,
                database_index: self.state.database_index,
                senior_elapsed_millis: 0,
                senior_start_network_time: 0,
                source: self.self_id,
                update_id: self.state.local_id,
                pre_update_checksum: 0,
                post_update_checksum: self.object.running_checksum(),
                self_checksum: 0,
                payload: archive,
            });
            return DatabaseAction::ReplyBackOrder { target: requester, database_index: self.state.database_index, update_id, record: Some(record) };
        }
        let record = self.state.log.get(&update_id).cloned();
        DatabaseAction::ReplyBackOrder { target: requester, database_index: self.state.database_index, update_id, record }
    }

    /// Abandon back-orders outstanding against a peer that went offline
    /// (spec.md §4.5 unicast lifecycle, §7 `TransportClosed`).
    pub fn abandon_back_orders_for(&mut self, peer: PeerId) {
        let stale: Vec<BackOrderKey> = self.state.back_orders.iter().filter(|k| k.target_peer == peer).copied().collect();
        for key in stale {
            self.state.back_orders.remove(&key);
            if key.update_id == u64::MAX {
                self.state.full_resend_in_flight = false;
            }
        }
        if !self.state.back_orders.is_empty() || self.state.local_id < self.state.target_id() {
            self.state.rescan_pending = true;
        }
    }

    /// Trim policy (spec.md §3): OR-of-trim-allowed between the byte budget
    /// and the "never drop the single most recent record" / "never drop a
    /// record still needed by a junior target" floors.
    fn trim_log(&mut self) {
        while self.state.log_bytes > self.state.max_log_bytes {
            let Some((&oldest, _)) = self.state.log.iter().next() else { break };
            if self.is_senior {
                if self.state.log.len() <= 1 {
                    break;
                }
            } else if oldest <= self.state.local_id {
                // safe to drop, already applied
            } else if !self.state.full_resend_in_flight {
                break;
            }
            self.state.remove_log(oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CounterObject {
        value: u32,
    }

    impl DatabaseObject for CounterObject {
        fn reset_to_default(&mut self) {
            self.value = 0;
        }
        fn set_from_archive(&mut self, bytes: &[u8]) -> Result<()> {
            if bytes.len() != 4 {
                return Err(Error::MalformedPacket("bad archive len".into()));
            }
            self.value = u32::from_le_bytes(bytes.try_into().unwrap());
            Ok(())
        }
        fn save_to_archive(&self) -> Vec<u8> {
            self.value.to_le_bytes().to_vec()
        }
        fn running_checksum(&self) -> u32 {
            self.value
        }
        fn recalculate_checksum(&self) -> u32 {
            self.value
        }
        fn apply_senior(&mut self, _ctx: ApplyContext, request_payload: &[u8]) -> Option<Vec<u8>> {
            if request_payload == b"inc" {
                self.value += 1;
                Some(b"inc".to_vec())
            } else {
                None
            }
        }
        fn apply_junior(&mut self, _ctx: ApplyContext, reply_payload: &[u8]) {
            if reply_payload == b"inc" {
                self.value += 1;
            }
        }
        fn describe(&self) -> String {
            format!("counter={}", self.value)
        }
    }

    fn senior_db(id: PeerId) -> ReplicatedDatabase {
        let mut db = ReplicatedDatabase::new(0, 1024, id, Box::new(CounterObject { value: 0 }));
        db.set_senior(Some(id));
        db
    }

    #[test]
    fn single_peer_self_apply() {
        let me = PeerId::new(1, 1);
        let mut db = senior_db(me);
        db.request_update(b"inc").unwrap();
        assert_eq!(db.current_state_id(), 1);
        assert_eq!(db.checksum(), 1);
        assert_eq!(db.checksum(), db.object().recalculate_checksum());
    }

    #[test]
    fn replace_on_senior_sets_from_archive_and_echoes_payload() {
        let me = PeerId::new(1, 1);
        let mut db = senior_db(me);
        // A Replace request carries a full-state archive, not an Update
        // delta; CounterObject::apply_senior only understands b"inc" and
        // would refuse anything else, so a passing Replace proves the
        // senior path routes through set_from_archive instead.
        let archive = 7u32.to_le_bytes();
        let record = db.apply_senior_request(UpdateKind::Replace, me, &archive).unwrap();
        assert_eq!(db.object().recalculate_checksum(), 7);
        assert_eq!(record.payload, archive.to_vec());
    }

    #[test]
    fn replace_record_replicates_to_junior_via_set_from_archive() {
        let senior_id = PeerId::new(1, 1);
        let junior_id = PeerId::new(2, 2);
        let mut senior = senior_db(senior_id);
        let mut junior = ReplicatedDatabase::new(0, 1024, junior_id, Box::new(CounterObject { value: 0 }));
        junior.set_senior(Some(senior_id));

        let archive = 42u32.to_le_bytes();
        let record = senior.apply_senior_request(UpdateKind::Replace, senior_id, &archive).unwrap();
        junior.state.insert_log(record.clone());
        junior.on_beacon(senior_id, senior.current_state_id(), 1);
        let actions = junior.rescan();
        assert!(actions.is_empty());
        assert_eq!(junior.object().recalculate_checksum(), 42);
        assert_eq!(junior.checksum(), senior.checksum());
    }

    #[test]
    fn senior_request_refused_removes_speculative_record() {
        let me = PeerId::new(1, 1);
        let mut db = senior_db(me);
        let err = db.apply_senior_request(UpdateKind::Update, me, b"nope").unwrap_err();
        assert!(matches!(err, Error::DatabaseRefused));
        assert_eq!(db.current_state_id(), 0);
    }

    #[test]
    fn junior_applies_in_order_records() {
        let senior_id = PeerId::new(1, 1);
        let junior_id = PeerId::new(2, 2);
        let mut senior = senior_db(senior_id);
        let mut junior = ReplicatedDatabase::new(0, 1024, junior_id, Box::new(CounterObject { value: 0 }));
        junior.set_senior(Some(senior_id));

        let mut records = Vec::new();
        for _ in 0..5 {
            records.push(senior.apply_senior_request(UpdateKind::Update, senior_id, b"inc").unwrap());
        }

        for record in &records {
            junior.state.insert_log(record.clone());
        }
        junior.on_beacon(senior_id, senior.current_state_id(), 1);
        let actions = junior.rescan();
        assert!(actions.is_empty());
        assert_eq!(junior.current_state_id(), 5);
        assert_eq!(junior.checksum(), senior.checksum());
    }

    #[test]
    fn junior_requests_back_order_for_gap() {
        let senior_id = PeerId::new(1, 1);
        let junior_id = PeerId::new(2, 2);
        let mut senior = senior_db(senior_id);
        let mut junior = ReplicatedDatabase::new(0, 1024, junior_id, Box::new(CounterObject { value: 0 }));
        junior.set_senior(Some(senior_id));

        let mut records = Vec::new();
        for _ in 0..3 {
            records.push(senior.apply_senior_request(UpdateKind::Update, senior_id, b"inc").unwrap());
        }
        // Drop record #2, deliver #1 and #3 only.
        junior.state.insert_log(records[0].clone());
        junior.state.insert_log(records[2].clone());
        junior.on_beacon(senior_id, senior.current_state_id(), 1);
        let actions = junior.rescan();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            DatabaseAction::RequestBackOrder { update_id, .. } => assert_eq!(*update_id, 2),
            other => panic!("expected back-order request, got {other:?}"),
        }
        assert_eq!(junior.current_state_id(), 1);

        // Reply arrives.
        let missing = (*records[1]).clone();
        junior.on_back_order_reply(senior_id, 2, Some(missing));
        let actions = junior.rescan();
        assert!(actions.is_empty());
        assert_eq!(junior.current_state_id(), 3);
        assert_eq!(junior.checksum(), senior.checksum());
    }

    #[test]
    fn checksum_mismatch_triggers_full_resend() {
        let senior_id = PeerId::new(1, 1);
        let junior_id = PeerId::new(2, 2);
        let mut senior = senior_db(senior_id);
        let mut junior = ReplicatedDatabase::new(0, 1024, junior_id, Box::new(CounterObject { value: 0 }));
        junior.set_senior(Some(senior_id));

        let record = senior.apply_senior_request(UpdateKind::Update, senior_id, b"inc").unwrap();
        let mut corrupted = (*record).clone();
        corrupted.post_update_checksum ^= 0xFF;
        junior.state.insert_log(Arc::new(corrupted));
        junior.on_beacon(senior_id, senior.current_state_id(), 1);
        let actions = junior.rescan();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            DatabaseAction::RequestBackOrder { update_id, .. } => assert_eq!(*update_id, u64::MAX),
            other => panic!("expected full resend, got {other:?}"),
        }
        assert_eq!(junior.current_state_id(), 0);

        let archive = senior.object().save_to_archive();
        junior.on_back_order_reply(
            senior_id,
            u64::MAX,
            Some(UpdateRecord {
                kind: UpdateKind::Replace,
                database_index: 0,
                senior_elapsed_millis: 0,
                senior_start_network_time: 0,
                source: senior_id,
                update_id: senior.current_state_id(),
                pre_update_checksum: 0,
                post_update_checksum: senior.checksum(),
                self_checksum: 0,
                payload: archive,
            }),
        );
        assert_eq!(junior.current_state_id(), senior.current_state_id());
        assert_eq!(junior.checksum(), senior.checksum());
    }

    #[test]
    fn request_without_senior_is_error() {
        let mut db = ReplicatedDatabase::new(0, 1024, PeerId::new(1, 1), Box::new(CounterObject { value: 0 }));
        let err = db.request_update(b"inc").unwrap_err();
        assert!(matches!(err, Error::UnknownSenior));
    }

    #[test]
    fn trimming_never_changes_local_id_or_checksum() {
        let me = PeerId::new(1, 1);
        let mut db = senior_db(me);
        db.state.max_log_bytes = 0; // trim as aggressively as policy allows
        for _ in 0..10 {
            db.request_update(b"inc").unwrap();
            // Trimming is deferred to the next rescan (spec.md §4.4: the
            // senior's pulse drains unsent records to the multicast channel
            // before trim_log may drop them), mirroring the real pulse loop.
            db.rescan();
        }
        assert_eq!(db.current_state_id(), 10);
        assert_eq!(db.checksum(), 10);
        assert!(db.state.log.len() <= 1);
    }
}
