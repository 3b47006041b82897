// SQLite 存储后端
//
// 记录主体按列存储，会话状态作为 JSON 列兜底，
// 会话令牌单独冗余一列供后台传输归队查询

use crate::store::{PendingScope, StoreError, UploadRecord, UploadStore};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

fn backend<E: std::fmt::Display>(error: E) -> StoreError {
    StoreError::Backend(error.to_string())
}

/// SQLite 上传记录存储
pub struct SqliteUploadStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteUploadStore {
    /// 打开（必要时创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(backend)?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder().max_size(4).build(manager).map_err(backend)?;

        let store = Self { pool };
        store.init_tables()?;
        Ok(store)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        // 连接池中每个内存连接各自独立，限制为单连接
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).map_err(backend)?;

        let store = Self { pool };
        store.init_tables()?;
        Ok(store)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StoreError> {
        self.pool.get().map_err(backend)
    }

    fn init_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS upload_records (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                drive_id INTEGER NOT NULL,
                parent_folder_id INTEGER NOT NULL,
                source_path TEXT NOT NULL,
                file_name TEXT NOT NULL,
                declared_size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                conflict TEXT,
                progress REAL,
                error_kind TEXT,
                error_cause TEXT,
                max_retry_count INTEGER NOT NULL,
                owned_by_extension INTEGER NOT NULL DEFAULT 0,
                initiated_from_file_manager INTEGER NOT NULL DEFAULT 0,
                session_json TEXT,
                session_token TEXT,
                upload_date INTEGER,
                task_creation_date INTEGER NOT NULL
            )
            "#,
            [],
        )
        .map_err(backend)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_upload_records_pending \
             ON upload_records(user_id, drive_id, owned_by_extension, upload_date, task_creation_date)",
            [],
        )
        .map_err(backend)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_upload_records_session_token \
             ON upload_records(session_token)",
            [],
        )
        .map_err(backend)?;

        info!("上传记录数据库表初始化完成");
        Ok(())
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
        Ok(RecordRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            drive_id: row.get(2)?,
            parent_folder_id: row.get(3)?,
            source_path: row.get(4)?,
            file_name: row.get(5)?,
            declared_size: row.get(6)?,
            created_at: row.get(7)?,
            modified_at: row.get(8)?,
            conflict: row.get(9)?,
            progress: row.get(10)?,
            error_kind: row.get(11)?,
            error_cause: row.get(12)?,
            max_retry_count: row.get(13)?,
            owned_by_extension: row.get(14)?,
            initiated_from_file_manager: row.get(15)?,
            session_json: row.get(16)?,
            upload_date: row.get(17)?,
            task_creation_date: row.get(18)?,
        })
    }

    fn write_record(conn: &Connection, record: &UploadRecord) -> Result<(), StoreError> {
        let conflict = record
            .conflict
            .map(|c| serde_json::to_string(&c))
            .transpose()
            .map_err(backend)?;
        let session_json = record
            .session
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(backend)?;
        let session_token = record.session.as_ref().map(|s| s.token.0.clone());

        conn.execute(
            r#"
            INSERT OR REPLACE INTO upload_records (
                id, user_id, drive_id, parent_folder_id,
                source_path, file_name, declared_size,
                created_at, modified_at,
                conflict, progress, error_kind, error_cause,
                max_retry_count, owned_by_extension, initiated_from_file_manager,
                session_json, session_token,
                upload_date, task_creation_date
            ) VALUES (
                ?1, ?2, ?3, ?4,
                ?5, ?6, ?7,
                ?8, ?9,
                ?10, ?11, ?12, ?13,
                ?14, ?15, ?16,
                ?17, ?18,
                ?19, ?20
            )
            "#,
            params![
                record.id,
                record.user_id as i64,
                record.drive_id as i64,
                record.parent_folder_id as i64,
                record.source_path.to_string_lossy().to_string(),
                record.file_name,
                record.declared_size as i64,
                record.created_at,
                record.modified_at,
                conflict,
                record.progress,
                record.error.as_ref().map(|e| e.kind.clone()),
                record.error.as_ref().map(|e| e.cause.clone()),
                record.max_retry_count as i64,
                if record.owned_by_extension { 1 } else { 0 },
                if record.initiated_from_file_manager { 1 } else { 0 },
                session_json,
                session_token,
                record.upload_date,
                record.task_creation_date,
            ],
        )
        .map_err(backend)?;
        Ok(())
    }
}

const SELECT_COLUMNS: &str = r#"
    id, user_id, drive_id, parent_folder_id,
    source_path, file_name, declared_size,
    created_at, modified_at,
    conflict, progress, error_kind, error_cause,
    max_retry_count, owned_by_extension, initiated_from_file_manager,
    session_json,
    upload_date, task_creation_date
"#;

impl UploadStore for SqliteUploadStore {
    fn insert(&self, record: UploadRecord) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM upload_records WHERE id = ?1",
                params![record.id],
                |_| Ok(true),
            )
            .optional()
            .map_err(backend)?
            .unwrap_or(false);
        if exists {
            debug!("记录已存在，跳过插入: {}", record.id);
            return Ok(false);
        }

        Self::write_record(&tx, &record)?;
        tx.commit().map_err(backend)?;
        Ok(true)
    }

    fn get(&self, id: &str) -> Result<Option<UploadRecord>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM upload_records WHERE id = ?1",
            SELECT_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![id], Self::row_to_record)
            .optional()
            .map_err(backend)?;
        row.map(RecordRow::into_record).transpose()
    }

    fn with_record(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut UploadRecord),
    ) -> Result<UploadRecord, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;

        let sql = format!(
            "SELECT {} FROM upload_records WHERE id = ?1",
            SELECT_COLUMNS
        );
        let row = tx
            .query_row(&sql, params![id], Self::row_to_record)
            .optional()
            .map_err(backend)?
            .ok_or_else(|| StoreError::RecordNotFound { id: id.to_string() })?;

        let mut record = row.into_record()?;
        mutate(&mut record);
        Self::write_record(&tx, &record)?;
        tx.commit().map_err(backend)?;
        Ok(record)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let deleted = conn
            .execute("DELETE FROM upload_records WHERE id = ?1", params![id])
            .map_err(backend)?;
        if deleted > 0 {
            debug!("已删除上传记录: {}", id);
        }
        Ok(())
    }

    fn pending_records(&self, scope: &PendingScope) -> Result<Vec<UploadRecord>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM upload_records \
             WHERE user_id = ?1 AND drive_id = ?2 AND owned_by_extension = ?3 \
               AND upload_date IS NULL \
             ORDER BY task_creation_date, rowid",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(
                params![
                    scope.user_id as i64,
                    scope.drive_id as i64,
                    if scope.owned_by_extension { 1 } else { 0 },
                ],
                Self::row_to_record,
            )
            .map_err(backend)?;

        collect_rows(rows)
    }

    fn pending_in_parent(
        &self,
        scope: &PendingScope,
        parent_folder_id: u64,
    ) -> Result<Vec<UploadRecord>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM upload_records \
             WHERE user_id = ?1 AND drive_id = ?2 AND owned_by_extension = ?3 \
               AND parent_folder_id = ?4 AND upload_date IS NULL \
             ORDER BY task_creation_date, rowid",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(
                params![
                    scope.user_id as i64,
                    scope.drive_id as i64,
                    if scope.owned_by_extension { 1 } else { 0 },
                    parent_folder_id as i64,
                ],
                Self::row_to_record,
            )
            .map_err(backend)?;

        collect_rows(rows)
    }

    fn find_by_session_token(&self, token: &str) -> Result<Option<UploadRecord>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM upload_records WHERE session_token = ?1",
            SELECT_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![token], Self::row_to_record)
            .optional()
            .map_err(backend)?;
        row.map(RecordRow::into_record).transpose()
    }

    fn uploading_source_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT source_path FROM upload_records WHERE upload_date IS NULL")
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(backend)?;

        let mut paths = Vec::new();
        for row in rows {
            match row {
                Ok(path) => paths.push(PathBuf::from(path)),
                Err(e) => warn!("读取源文件路径失败: {}", e),
            }
        }
        Ok(paths)
    }
}

fn collect_rows(
    rows: impl Iterator<Item = rusqlite::Result<RecordRow>>,
) -> Result<Vec<UploadRecord>, StoreError> {
    let mut records = Vec::new();
    for row in rows {
        match row {
            Ok(r) => match r.into_record() {
                Ok(record) => records.push(record),
                Err(e) => warn!("转换上传记录失败: {}", e),
            },
            Err(e) => warn!("读取上传记录行失败: {}", e),
        }
    }
    Ok(records)
}

/// 上传记录行
struct RecordRow {
    id: String,
    user_id: i64,
    drive_id: i64,
    parent_folder_id: i64,
    source_path: String,
    file_name: String,
    declared_size: i64,
    created_at: i64,
    modified_at: i64,
    conflict: Option<String>,
    progress: Option<f64>,
    error_kind: Option<String>,
    error_cause: Option<String>,
    max_retry_count: i64,
    owned_by_extension: i64,
    initiated_from_file_manager: i64,
    session_json: Option<String>,
    upload_date: Option<i64>,
    task_creation_date: i64,
}

impl RecordRow {
    fn into_record(self) -> Result<UploadRecord, StoreError> {
        let conflict = self
            .conflict
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(backend)?;
        let session = self
            .session_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(backend)?;
        let error = match (self.error_kind, self.error_cause) {
            (Some(kind), Some(cause)) => Some(crate::store::RecordedError { kind, cause }),
            _ => None,
        };

        Ok(UploadRecord {
            id: self.id,
            user_id: self.user_id as u64,
            drive_id: self.drive_id as u64,
            parent_folder_id: self.parent_folder_id as u64,
            source_path: PathBuf::from(self.source_path),
            file_name: self.file_name,
            declared_size: self.declared_size as u64,
            created_at: self.created_at,
            modified_at: self.modified_at,
            conflict,
            progress: self.progress,
            error,
            max_retry_count: self.max_retry_count as u32,
            owned_by_extension: self.owned_by_extension != 0,
            initiated_from_file_manager: self.initiated_from_file_manager != 0,
            session,
            upload_date: self.upload_date,
            task_creation_date: self.task_creation_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::SessionToken;
    use crate::chunk::FileIdentity;
    use crate::store::record::{ChunkTask, UploadSessionState};

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

    fn session(token: &str) -> UploadSessionState {
        UploadSessionState {
            token: SessionToken(token.to_string()),
            expires_at: chrono::Utc::now().timestamp() + 3600,
            total_chunks: 1,
            chunk_size: 128,
            file_identity: FileIdentity {
                size: 128,
                modified_at: 100,
            },
            chunk_tasks: vec![ChunkTask {
                chunk_number: 1,
                range_start: 0,
                range_end: 127,
                ack: None,
                error: None,
            }],
        }
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteUploadStore::open(&dir.path().join("uploads.db")).unwrap();

        let mut r = record(1, 2, 3, "a.bin");
        r.session = Some(session("session-rt"));
        r.set_error(&crate::error::UploadError::Local(
            crate::error::LocalError::NotEnoughSpace,
        ));
        let id = r.id.clone();

        assert!(store.insert(r.clone()).unwrap());
        let loaded = store.get(&id).unwrap().unwrap();
        assert_eq!(loaded, r);
    }

    #[test]
    fn test_insert_does_not_overwrite() {
        let store = SqliteUploadStore::open_in_memory().unwrap();
        let mut r = record(1, 2, 3, "a.bin");
        let id = r.id.clone();
        assert!(store.insert(r.clone()).unwrap());

        r.file_name = "changed.bin".to_string();
        assert!(!store.insert(r).unwrap());
        assert_eq!(store.get(&id).unwrap().unwrap().file_name, "a.bin");
    }

    #[test]
    fn test_with_record_transactional_update() {
        let store = SqliteUploadStore::open_in_memory().unwrap();
        let r = record(1, 2, 3, "a.bin");
        let id = r.id.clone();
        store.insert(r).unwrap();

        store
            .with_record(&id, &mut |r| {
                r.progress = Some(0.25);
                r.session = Some(session("session-tx"));
            })
            .unwrap();

        let loaded = store.get(&id).unwrap().unwrap();
        assert_eq!(loaded.progress, Some(0.25));
        assert_eq!(loaded.session.unwrap().token.0, "session-tx");
    }

    #[test]
    fn test_pending_query_scope_and_order() {
        let store = SqliteUploadStore::open_in_memory().unwrap();
        let mut first = record(1, 2, 3, "a.bin");
        first.task_creation_date = 10;
        let mut second = record(1, 2, 3, "b.bin");
        second.task_creation_date = 20;
        let mut extension_owned = record(1, 2, 3, "ext.bin");
        extension_owned.owned_by_extension = true;
        let mut done = record(1, 2, 3, "done.bin");
        done.upload_date = Some(999);

        store.insert(second.clone()).unwrap();
        store.insert(first.clone()).unwrap();
        store.insert(extension_owned).unwrap();
        store.insert(done).unwrap();

        let scope = PendingScope {
            user_id: 1,
            drive_id: 2,
            owned_by_extension: false,
        };
        let pending = store.pending_records(&scope).unwrap();
        assert_eq!(
            pending.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec![first.id.as_str(), second.id.as_str()]
        );

        let in_parent = store.pending_in_parent(&scope, 3).unwrap();
        assert_eq!(in_parent.len(), 2);
        let in_other = store.pending_in_parent(&scope, 99).unwrap();
        assert!(in_other.is_empty());
    }

    #[test]
    fn test_find_by_session_token() {
        let store = SqliteUploadStore::open_in_memory().unwrap();
        let mut r = record(1, 2, 3, "a.bin");
        r.session = Some(session("session-find"));
        let id = r.id.clone();
        store.insert(r).unwrap();

        let found = store.find_by_session_token("session-find").unwrap();
        assert_eq!(found.unwrap().id, id);
        assert!(store.find_by_session_token("missing").unwrap().is_none());
    }

    #[test]
    fn test_uploading_source_paths_skips_completed() {
        let store = SqliteUploadStore::open_in_memory().unwrap();
        let pending = record(1, 2, 3, "pending.bin");
        let mut done = record(1, 2, 3, "done.bin");
        done.upload_date = Some(1);
        store.insert(pending.clone()).unwrap();
        store.insert(done).unwrap();

        let paths = store.uploading_source_paths().unwrap();
        assert_eq!(paths, vec![pending.source_path]);
    }
}
