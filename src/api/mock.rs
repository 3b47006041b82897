// 会话协议客户端测试替身
//
// 可编程失败序列 + 调用记录，供操作/队列测试使用

use crate::api::types::{
    ChunkAck, RemoteFile, SessionToken, StartSessionRequest, UploadSessionData,
};
use crate::api::SessionClient;
use crate::error::UploadError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Default)]
struct MockState {
    start_calls: Vec<StartSessionRequest>,
    appended: Vec<(SessionToken, u64)>,
    close_calls: usize,
    cancel_calls: Vec<SessionToken>,
    next_session: u64,
    session_ttl_secs: i64,
    start_failures: VecDeque<UploadError>,
    chunk_failures: HashMap<u64, VecDeque<UploadError>>,
    close_failures: VecDeque<UploadError>,
}

/// 可编程会话客户端
pub struct MockSessionClient {
    state: Mutex<MockState>,
}

impl Default for MockSessionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSessionClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                session_ttl_secs: 12 * 3600,
                ..MockState::default()
            }),
        }
    }

    /// 让随后开启的会话立即过期
    pub fn issue_expired_sessions(&self) {
        self.state.lock().session_ttl_secs = -3600;
    }

    /// 下一次 start_session 失败
    pub fn fail_next_start(&self, error: UploadError) {
        self.state.lock().start_failures.push_back(error);
    }

    /// 指定分片序号失败一次
    pub fn fail_chunk_once(&self, chunk_number: u64, error: UploadError) {
        self.state
            .lock()
            .chunk_failures
            .entry(chunk_number)
            .or_default()
            .push_back(error);
    }

    /// 下一次 close_session 失败
    pub fn fail_next_close(&self, error: UploadError) {
        self.state.lock().close_failures.push_back(error);
    }

    pub fn start_call_count(&self) -> usize {
        self.state.lock().start_calls.len()
    }

    pub fn appended_chunks(&self) -> Vec<u64> {
        self.state
            .lock()
            .appended
            .iter()
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn close_call_count(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn cancel_call_count(&self) -> usize {
        self.state.lock().cancel_calls.len()
    }

    /// 全部调用计数（开会话 + 分片 + 关会话 + 取消）
    pub fn total_call_count(&self) -> usize {
        let state = self.state.lock();
        state.start_calls.len() + state.appended.len() + state.close_calls
            + state.cancel_calls.len()
    }
}

#[async_trait]
impl SessionClient for MockSessionClient {
    async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<UploadSessionData, UploadError> {
        let mut state = self.state.lock();
        state.start_calls.push(request);

        if let Some(error) = state.start_failures.pop_front() {
            return Err(error);
        }

        state.next_session += 1;
        Ok(UploadSessionData {
            token: SessionToken(format!("session-{}", state.next_session)),
            expires_at: chrono::Utc::now().timestamp() + state.session_ttl_secs,
        })
    }

    async fn append_chunk(
        &self,
        token: &SessionToken,
        chunk_number: u64,
        chunk_hash: &str,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, UploadError> {
        let mut state = self.state.lock();
        state.appended.push((token.clone(), chunk_number));

        if let Some(queue) = state.chunk_failures.get_mut(&chunk_number) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }

        Ok(ChunkAck {
            chunk_number,
            checksum: chunk_hash.to_string(),
            size: bytes.len() as u64,
        })
    }

    async fn close_session(&self, _token: &SessionToken) -> Result<RemoteFile, UploadError> {
        let mut state = self.state.lock();
        state.close_calls += 1;

        if let Some(error) = state.close_failures.pop_front() {
            return Err(error);
        }

        Ok(RemoteFile {
            id: 4242,
            name: "uploaded".to_string(),
            size: 0,
            parent_id: 1,
        })
    }

    async fn cancel_session(&self, token: &SessionToken) -> Result<(), UploadError> {
        self.state.lock().cancel_calls.push(token.clone());
        Ok(())
    }
}
