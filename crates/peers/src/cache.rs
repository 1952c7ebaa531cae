use models::BlockRecord;
use std::collections::HashMap;
use std::sync::Mutex;

/// Bounded cache of downloaded blocks, keyed by block number.
/// When full, the entries with the oldest fetch time are evicted.
pub struct BlockCache {
    max: usize,
    inner: Mutex<HashMap<u64, BlockRecord>>,
}

impl BlockCache {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, block_num: u64) -> Option<BlockRecord> {
        self.inner.lock().unwrap().get(&block_num).cloned()
    }

    pub fn insert(&self, record: BlockRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(record.block_num, record);

        while inner.len() > self.max {
            let oldest = inner
                .values()
                .map(|r| (r.fetched_at, r.block_num))
                .min()
                .expect("cache is non-empty");
            inner.remove(&oldest.1);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, block_num: u64) -> bool {
        self.inner.lock().unwrap().contains_key(&block_num)
    }
}
