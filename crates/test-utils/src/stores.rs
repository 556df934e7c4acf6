//! Store wrappers for exercising storage failure paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use zarrs::storage::byte_range::ByteRange;
use zarrs::storage::{
    Bytes, ListableStorageTraits, MaybeBytes, ReadableStorageTraits,
    ReadableWritableListableStorage, StorageError, StoreKey, StoreKeyOffsetValue, StoreKeys,
    StoreKeysPrefixes, StorePrefix, WritableStorageTraits,
};

/// Serves reads and listings from an inner store and rejects every write
/// with [`StorageError::ReadOnly`].
pub struct ReadOnlyStore {
    inner: ReadableWritableListableStorage,
    rejected: AtomicUsize,
}

impl ReadOnlyStore {
    pub fn new(inner: ReadableWritableListableStorage) -> Self {
        Self {
            inner,
            rejected: AtomicUsize::new(0),
        }
    }

    /// Wrap `inner` as a shared store handle.
    pub fn shared(inner: ReadableWritableListableStorage) -> Arc<Self> {
        Arc::new(Self::new(inner))
    }

    /// Number of write or erase calls turned away so far.
    pub fn rejected_writes(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    fn reject(&self) -> Result<(), StorageError> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        Err(StorageError::ReadOnly)
    }
}

impl ReadableStorageTraits for ReadOnlyStore {
    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        self.inner.get(key)
    }

    fn get_partial_values_key(
        &self,
        key: &StoreKey,
        byte_ranges: &[ByteRange],
    ) -> Result<Option<Vec<Bytes>>, StorageError> {
        self.inner.get_partial_values_key(key, byte_ranges)
    }

    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        self.inner.size_key(key)
    }
}

impl ListableStorageTraits for ReadOnlyStore {
    fn list(&self) -> Result<StoreKeys, StorageError> {
        self.inner.list()
    }

    fn list_prefix(&self, prefix: &StorePrefix) -> Result<StoreKeys, StorageError> {
        self.inner.list_prefix(prefix)
    }

    fn list_dir(&self, prefix: &StorePrefix) -> Result<StoreKeysPrefixes, StorageError> {
        self.inner.list_dir(prefix)
    }

    fn size_prefix(&self, prefix: &StorePrefix) -> Result<u64, StorageError> {
        self.inner.size_prefix(prefix)
    }
}

impl WritableStorageTraits for ReadOnlyStore {
    fn set(&self, _key: &StoreKey, _value: Bytes) -> Result<(), StorageError> {
        self.reject()
    }

    fn set_partial_values(
        &self,
        _key_offset_values: &[StoreKeyOffsetValue],
    ) -> Result<(), StorageError> {
        self.reject()
    }

    fn erase(&self, _key: &StoreKey) -> Result<(), StorageError> {
        self.reject()
    }

    fn erase_prefix(&self, _prefix: &StorePrefix) -> Result<(), StorageError> {
        self.reject()
    }
}
