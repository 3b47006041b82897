// 上传会话协议客户端模块
//
// 对分片上传会话的线上协议做抽象：
// 开启会话 / 追加分片 / 关闭会话 / 取消会话

pub mod client;
pub mod types;

#[cfg(test)]
pub mod mock;

pub use client::{validate_start_session, AccessTokenProvider, HttpSessionClient, SessionClient};
pub use types::{
    ChunkAck, ConflictResolution, RemoteFile, SessionToken, StartSessionRequest, UploadSessionData,
};
