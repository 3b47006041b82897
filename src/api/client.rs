// 会话协议 HTTP 客户端
//
// 四个操作中除 start_session 外均可安全重试；
// start_session 的会话复用/失效由操作层负责，客户端不做重试

use crate::api::types::{
    ApiEnvelope, ChunkAck, RemoteFile, SessionToken, StartSessionRequest, UploadSessionData,
};
use crate::chunk::API_MAX_TOTAL_CHUNKS;
use crate::error::{SessionError, TransportError, UploadError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 访问令牌提供者
///
/// 令牌刷新由外部协作者负责，这里只取当前有效令牌
pub trait AccessTokenProvider: Send + Sync {
    fn access_token(&self) -> String;
}

/// 开启会话前的参数校验
///
/// 必须在任何网络调用之前执行
pub fn validate_start_session(request: &StartSessionRequest) -> Result<(), UploadError> {
    if request.directory_id.is_none() && request.directory_path.is_none() {
        return Err(UploadError::Session(
            SessionError::InvalidDirectoryParameters,
        ));
    }

    if request.file_name.is_empty() {
        return Err(UploadError::Session(SessionError::FileNameIsEmpty));
    }

    if request.total_chunks < 1 || request.total_chunks >= API_MAX_TOTAL_CHUNKS {
        return Err(UploadError::Session(SessionError::ChunksNumberOutOfBounds {
            total_chunks: request.total_chunks,
        }));
    }

    Ok(())
}

/// 上传会话协议客户端
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// 开启分片上传会话
    async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<UploadSessionData, UploadError>;

    /// 追加一个分片（分片序号从 1 开始）
    async fn append_chunk(
        &self,
        token: &SessionToken,
        chunk_number: u64,
        chunk_hash: &str,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, UploadError>;

    /// 关闭会话并合并所有分片，返回远端文件句柄
    async fn close_session(&self, token: &SessionToken) -> Result<RemoteFile, UploadError>;

    /// 取消会话，释放服务端已接收的分片
    async fn cancel_session(&self, token: &SessionToken) -> Result<(), UploadError>;
}

/// 基于 reqwest 的会话协议客户端
pub struct HttpSessionClient {
    http: reqwest::Client,
    base_url: String,
    token_provider: Arc<dyn AccessTokenProvider>,
}

impl HttpSessionClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `base_url` - API 根地址（不含尾部斜杠）
    /// * `token_provider` - 访问令牌提供者
    /// * `request_timeout` - 请求级超时（分片传输约 2 分钟）
    pub fn new(
        base_url: String,
        token_provider: Arc<dyn AccessTokenProvider>,
        request_timeout: Duration,
    ) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| {
                UploadError::Transport(TransportError::Network {
                    message: format!("构建 HTTP 客户端失败: {}", e),
                })
            })?;

        Ok(Self {
            http,
            base_url,
            token_provider,
        })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token_provider.access_token())
    }

    /// 解析响应信封，区分传输层错误与远端服务错误
    async fn parse_envelope<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, UploadError> {
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| map_transport_error(&e))?;

        if envelope.result == "success" {
            envelope.data.ok_or_else(|| {
                UploadError::Transport(TransportError::Network {
                    message: "响应缺少 data 字段".to_string(),
                })
            })
        } else {
            let error = envelope.error.ok_or_else(|| {
                UploadError::Transport(TransportError::Network {
                    message: "响应缺少 error 字段".to_string(),
                })
            })?;
            Err(UploadError::Remote(error.to_remote_error()))
        }
    }
}

/// 将 reqwest 错误映射到传输层分类
pub(crate) fn map_transport_error(error: &reqwest::Error) -> UploadError {
    if error.is_timeout() {
        UploadError::Transport(TransportError::Timeout)
    } else {
        UploadError::Transport(TransportError::Network {
            message: error.to_string(),
        })
    }
}

#[async_trait]
impl SessionClient for HttpSessionClient {
    async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<UploadSessionData, UploadError> {
        // 参数校验先于任何网络调用
        validate_start_session(&request)?;

        let url = format!(
            "{}/drive/{}/upload/session/start",
            self.base_url, request.drive_id
        );
        debug!(
            "开启上传会话: file_name={}, total_chunks={}, total_size={}",
            request.file_name, request.total_chunks, request.total_size
        );

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .json(&request)
            .send()
            .await
            .map_err(|e| map_transport_error(&e))?;

        Self::parse_envelope(response).await
    }

    async fn append_chunk(
        &self,
        token: &SessionToken,
        chunk_number: u64,
        chunk_hash: &str,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, UploadError> {
        let url = format!(
            "{}/upload/session/{}/chunk?chunk_number={}&chunk_hash={}",
            self.base_url, token.0, chunk_number, chunk_hash
        );

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| map_transport_error(&e))?;

        Self::parse_envelope(response).await
    }

    async fn close_session(&self, token: &SessionToken) -> Result<RemoteFile, UploadError> {
        let url = format!("{}/upload/session/{}/finish", self.base_url, token.0);

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(|e| map_transport_error(&e))?;

        Self::parse_envelope(response).await
    }

    async fn cancel_session(&self, token: &SessionToken) -> Result<(), UploadError> {
        let url = format!("{}/upload/session/{}", self.base_url, token.0);

        let response = self
            .http
            .delete(&url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(|e| map_transport_error(&e))?;

        // 取消接口的 data 为空对象
        let _: serde_json::Value = Self::parse_envelope(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::ConflictResolution;

    fn request() -> StartSessionRequest {
        StartSessionRequest {
            drive_id: 100,
            total_size: 1024,
            file_name: "photo.jpg".to_string(),
            total_chunks: 4,
            conflict: Some(ConflictResolution::Rename),
            created_at: None,
            last_modified_at: None,
            directory_id: Some(1),
            directory_path: None,
            file_id: None,
        }
    }

    #[test]
    fn test_validate_accepts_valid_request() {
        assert!(validate_start_session(&request()).is_ok());
    }

    #[test]
    fn test_validate_requires_directory() {
        let mut r = request();
        r.directory_id = None;
        r.directory_path = None;
        assert!(matches!(
            validate_start_session(&r),
            Err(UploadError::Session(
                SessionError::InvalidDirectoryParameters
            ))
        ));
    }

    #[test]
    fn test_validate_requires_file_name() {
        let mut r = request();
        r.file_name = String::new();
        assert!(matches!(
            validate_start_session(&r),
            Err(UploadError::Session(SessionError::FileNameIsEmpty))
        ));
    }

    #[test]
    fn test_validate_chunk_count_bounds() {
        let mut r = request();
        r.total_chunks = 0;
        assert!(validate_start_session(&r).is_err());

        r.total_chunks = API_MAX_TOTAL_CHUNKS;
        assert!(validate_start_session(&r).is_err());

        r.total_chunks = API_MAX_TOTAL_CHUNKS - 1;
        assert!(validate_start_session(&r).is_ok());
    }
}
