// test_client.rs
use std::collections::BTreeMap;

use home_raft_log::{HomeRaftLogStore, LogDevice, LogEntry, LogStoreId, Lsn, RaftLogStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

pub const MAX_PAYLOAD_SIZE: usize = 512;

const ALPHANUM: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Random payloads that start with the hex-encoded term they were made for.
pub struct PayloadGenerator {
    rng: StdRng,
}

impl PayloadGenerator {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn payload(&mut self, term: u64) -> Vec<u8> {
        let len = self.rng.random_range(2..=MAX_PAYLOAD_SIZE);
        let mut payload = format!("{:08x}", term).into_bytes();
        payload.extend((0..len).map(|_| ALPHANUM[self.rng.random_range(0..ALPHANUM.len())]));
        payload
    }

    pub fn entry(&mut self, term: u64) -> LogEntry {
        LogEntry::new(term, self.payload(term))
    }
}

pub struct PackResult {
    pub blob: Vec<u8>,
    pub expected: Vec<LogEntry>,
}

/// Drives one raft log store and checks it against an in-memory shadow log.
pub struct LogStoreClient {
    pub store: HomeRaftLogStore,
    shadow: BTreeMap<Lsn, LogEntry>,
    generator: PayloadGenerator,
    cur_term: u64,
    next_lsn: Lsn,
    start_lsn: Lsn,
}

impl LogStoreClient {
    pub async fn create(device: &LogDevice, seed: u64) -> Self {
        let store = HomeRaftLogStore::create(device).await.unwrap();
        info!("Created test log store {}", store.store_id());
        Self {
            store,
            shadow: BTreeMap::new(),
            generator: PayloadGenerator::seeded(seed),
            cur_term: 1,
            next_lsn: 1,
            start_lsn: 1,
        }
    }

    pub fn store_id(&self) -> LogStoreId {
        self.store.store_id()
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    pub fn total_records(&self) -> u64 {
        self.next_lsn - self.start_lsn
    }

    /// Swap in the store reopened from a restarted device.
    pub async fn reopen(&mut self, device: &LogDevice) {
        self.store = HomeRaftLogStore::open(device, self.store_id()).await.unwrap();
    }

    pub async fn append_read_test(&mut self, num_entries: u64) {
        assert_eq!(self.store.next_slot(), self.next_lsn);
        assert_eq!(self.store.start_index(), self.start_lsn);

        for _ in 0..num_entries {
            let lsn = self.next_lsn;
            let entry = self.generator.entry(self.cur_term);
            assert_eq!(self.store.append(&entry).unwrap(), lsn);
            assert_eq!(self.store.next_slot(), lsn + 1);
            assert_eq!(self.store.last_entry().await.unwrap(), entry);

            self.shadow.insert(lsn, entry);
            self.next_lsn += 1;
        }
        self.store.flush().await.unwrap();

        assert_eq!(
            self.store.start_index(),
            self.start_lsn,
            "start index must not move on append"
        );
        assert_eq!(self.store.last_durable_index(), self.next_lsn - 1);
    }

    /// Roll back half of the current log with a new term.
    pub async fn rollback_test(&mut self) {
        let lsn = self.start_lsn + (self.next_lsn - self.start_lsn) / 2;
        self.cur_term += 1;
        let entry = self.generator.entry(self.cur_term);
        self.store.write_at(lsn, &entry).await.unwrap();

        self.shadow.retain(|shadow_lsn, _| *shadow_lsn < lsn);
        self.shadow.insert(lsn, entry);
        self.next_lsn = lsn + 1;

        assert_eq!(
            self.store.next_slot(),
            self.next_lsn,
            "next slot after rollback"
        );
        self.validate_all_logs().await;
    }

    pub async fn compact_test(&mut self, num_records: u64) {
        let compact_upto = self.start_lsn + num_records - 1;

        // Compacting past the next slot moves it along and leaves a hole.
        if compact_upto >= self.next_lsn {
            self.next_lsn = compact_upto + 1;
        }
        self.start_lsn = compact_upto + 1;
        self.store.compact(compact_upto).await.unwrap();
        self.shadow = self.shadow.split_off(&self.start_lsn);

        assert_eq!(
            self.store.start_index(),
            self.start_lsn,
            "start index after compaction"
        );
        self.validate_all_logs().await;
    }

    pub async fn pack_test(&self, from: Lsn, count: u64) -> PackResult {
        let blob = self.store.pack(from, count).await.unwrap();
        let expected = self
            .shadow
            .range(from..from + count)
            .map(|(_, entry)| entry.clone())
            .collect();
        PackResult { blob, expected }
    }

    pub async fn pack_all(&self) -> PackResult {
        self.pack_test(self.start_lsn, self.next_lsn - self.start_lsn)
            .await
    }

    pub async fn unpack_test(&mut self, pack: &PackResult) {
        self.store
            .apply_pack(self.next_lsn, &pack.blob)
            .await
            .unwrap();
        for entry in &pack.expected {
            self.shadow.insert(self.next_lsn, entry.clone());
            self.next_lsn += 1;
        }
        self.validate_all_logs().await;
    }

    pub async fn validate_all_logs(&self) {
        assert_eq!(self.store.next_slot(), self.next_lsn);
        assert_eq!(self.store.start_index(), self.start_lsn);

        if self.next_lsn > self.start_lsn {
            let last = self.store.last_entry().await.unwrap();
            self.validate_log(&last, self.next_lsn - 1);
        }

        for lsn in self.start_lsn..self.next_lsn {
            let entry = self.store.entry_at(lsn).await.unwrap();
            self.validate_log(&entry, lsn);
        }

        let entries = self
            .store
            .log_entries(self.start_lsn, self.next_lsn)
            .await
            .unwrap();
        assert_eq!(entries.len() as u64, self.next_lsn - self.start_lsn);
        for (lsn, entry) in (self.start_lsn..).zip(entries.iter()) {
            self.validate_log(entry, lsn);
        }
    }

    fn validate_log(&self, entry: &LogEntry, lsn: Lsn) {
        let expected = &self.shadow[&lsn];
        let term_prefix = std::str::from_utf8(&entry.payload[..8]).unwrap();
        assert_eq!(
            u64::from_str_radix(term_prefix, 16).unwrap(),
            entry.term,
            "term prefix mismatch at lsn={}",
            lsn
        );
        assert_eq!(entry.term, expected.term, "term mismatch at lsn={}", lsn);
        assert_eq!(
            entry.payload.len(),
            expected.payload.len(),
            "size mismatch at lsn={}",
            lsn
        );
        assert_eq!(entry, expected, "log entry mismatch at lsn={}", lsn);
    }
}
