// 内存存储后端
//
// 测试与一次性批处理场景使用，不落盘

use crate::store::{PendingScope, StoreError, UploadRecord, UploadStore};
use parking_lot::Mutex;
use std::path::PathBuf;

/// 内存上传记录存储
///
/// 以插入顺序保存，入队时间相同（秒级）时插入顺序即调度顺序
#[derive(Default)]
pub struct MemoryUploadStore {
    records: Mutex<Vec<UploadRecord>>,
}

impl MemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches_scope(record: &UploadRecord, scope: &PendingScope) -> bool {
        record.user_id == scope.user_id
            && record.drive_id == scope.drive_id
            && record.owned_by_extension == scope.owned_by_extension
    }
}

impl UploadStore for MemoryUploadStore {
    fn insert(&self, record: UploadRecord) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        if records.iter().any(|r| r.id == record.id) {
            return Ok(false);
        }
        records.push(record);
        Ok(true)
    }

    fn get(&self, id: &str) -> Result<Option<UploadRecord>, StoreError> {
        Ok(self.records.lock().iter().find(|r| r.id == id).cloned())
    }

    fn with_record(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut UploadRecord),
    ) -> Result<UploadRecord, StoreError> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::RecordNotFound { id: id.to_string() })?;
        mutate(record);
        Ok(record.clone())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.lock().retain(|r| r.id != id);
        Ok(())
    }

    fn pending_records(&self, scope: &PendingScope) -> Result<Vec<UploadRecord>, StoreError> {
        let records = self.records.lock();
        let mut pending: Vec<UploadRecord> = records
            .iter()
            .filter(|r| r.is_pending() && Self::matches_scope(r, scope))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.task_creation_date);
        Ok(pending)
    }

    fn pending_in_parent(
        &self,
        scope: &PendingScope,
        parent_folder_id: u64,
    ) -> Result<Vec<UploadRecord>, StoreError> {
        let mut pending = self.pending_records(scope)?;
        pending.retain(|r| r.parent_folder_id == parent_folder_id);
        Ok(pending)
    }

    fn find_by_session_token(&self, token: &str) -> Result<Option<UploadRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .iter()
            .find(|r| {
                r.session
                    .as_ref()
                    .map(|s| s.token.0 == token)
                    .unwrap_or(false)
            })
            .cloned())
    }

    fn uploading_source_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.is_pending())
            .map(|r| r.source_path.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user: u64, drive: u64, parent: u64, name: &str) -> UploadRecord {
        UploadRecord::new(
            user,
            drive,
            parent,
            PathBuf::from(format!("/tmp/{}", name)),
            name.to_string(),
            128,
            100,
        )
    }

    #[test]
    fn test_insert_is_idempotent_by_id() {
        let store = MemoryUploadStore::new();
        let r = record(1, 2, 3, "a.bin");
        let id = r.id.clone();

        assert!(store.insert(r.clone()).unwrap());
        assert!(!store.insert(r).unwrap());
        assert!(store.get(&id).unwrap().is_some());
    }

    #[test]
    fn test_pending_scoped_and_ordered() {
        let store = MemoryUploadStore::new();
        let mut first = record(1, 2, 3, "a.bin");
        first.task_creation_date = 10;
        let mut second = record(1, 2, 3, "b.bin");
        second.task_creation_date = 20;
        let other_drive = record(1, 9, 3, "c.bin");
        let mut done = record(1, 2, 3, "d.bin");
        done.upload_date = Some(1000);

        store.insert(second.clone()).unwrap();
        store.insert(first.clone()).unwrap();
        store.insert(other_drive).unwrap();
        store.insert(done).unwrap();

        let scope = PendingScope {
            user_id: 1,
            drive_id: 2,
            owned_by_extension: false,
        };
        let pending = store.pending_records(&scope).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[1].id, second.id);
    }

    #[test]
    fn test_with_record_commits_mutation() {
        let store = MemoryUploadStore::new();
        let r = record(1, 2, 3, "a.bin");
        let id = r.id.clone();
        store.insert(r).unwrap();

        let updated = store
            .with_record(&id, &mut |r| r.progress = Some(0.5))
            .unwrap();
        assert_eq!(updated.progress, Some(0.5));
        assert_eq!(store.get(&id).unwrap().unwrap().progress, Some(0.5));
    }

    #[test]
    fn test_with_record_missing_id() {
        let store = MemoryUploadStore::new();
        let err = store.with_record("nope", &mut |_| {}).unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound { .. }));
    }
}
