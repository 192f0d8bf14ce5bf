//! 远端网关：聊天历史与消息的 HTTP API 客户端
//!
//! 无状态请求函数，每个操作一个方法，凭证由调用方（队列分发器）逐次传入。
//! 网关以 trait 形式暴露，方便上层在测试中替换为脚本化实现。

use crate::chat::history::models::LocalChatHistory;
use crate::chat::message::models::LocalMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info};
use uuid::Uuid;

/// 网关请求错误分类
///
/// 队列按 `is_retryable` 决定重试还是立即丢弃；
/// 校验类失败（4xx / 业务错误码 / 解码失败）重试也不会成功。
#[derive(Debug, Clone)]
pub enum RequestError {
    /// 未提供凭证
    MissingCredential,
    /// 401：凭证过期或无效，刷新凭证后可重试
    Unauthorized(String),
    /// 其他 4xx 或业务错误码：不可恢复
    Validation { status: u16, message: String },
    /// 5xx：服务端错误，可重试
    Server { status: u16, message: String },
    /// 网络层失败（连接、超时等），可重试
    Network(String),
    /// 响应解码失败：不可恢复
    Decode(String),
}

impl RequestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RequestError::MissingCredential
            | RequestError::Unauthorized(_)
            | RequestError::Server { .. }
            | RequestError::Network(_) => true,
            RequestError::Validation { .. } | RequestError::Decode(_) => false,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::MissingCredential => write!(f, "缺少凭证"),
            RequestError::Unauthorized(msg) => write!(f, "凭证无效: {}", msg),
            RequestError::Validation { status, message } => {
                write!(f, "请求校验失败 {}: {}", status, message)
            }
            RequestError::Server { status, message } => {
                write!(f, "服务端错误 {}: {}", status, message)
            }
            RequestError::Network(msg) => write!(f, "网络错误: {}", msg),
            RequestError::Decode(msg) => write!(f, "解码响应失败: {}", msg),
        }
    }
}

impl std::error::Error for RequestError {}

/// 统一的 API 响应包装结构体（包含 errCode、errMsg、data）
/// data 字段可能为 null 或缺失，因此使用 Option<T>
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg")]
    pub err_msg: String,
    pub data: Option<T>,
}

/// 通用 HTTP 响应处理：按状态码分类错误并反序列化统一响应结构
pub(crate) async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<T, RequestError> {
    let status = response.status();
    let body_bytes = response
        .bytes()
        .await
        .map_err(|e| RequestError::Network(e.to_string()))?;
    let body_str = String::from_utf8_lossy(&body_bytes);

    if !status.is_success() {
        error!(
            "[ChatAPI] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(match status.as_u16() {
            401 => RequestError::Unauthorized(body_str.to_string()),
            code @ 400..=499 => RequestError::Validation {
                status: code,
                message: body_str.to_string(),
            },
            code => RequestError::Server {
                status: code,
                message: body_str.to_string(),
            },
        });
    }
    debug!(
        "[ChatAPI] {}请求成功，HTTP状态: {}",
        operation_name, status
    );

    let api_resp: ApiResponse<T> = serde_json::from_slice(&body_bytes).map_err(|e| {
        error!(
            "[ChatAPI] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        RequestError::Decode(e.to_string())
    })?;

    // 业务错误码：服务端明确拒绝，重试无意义
    if api_resp.err_code != 0 {
        error!(
            "[ChatAPI] {}服务器错误，错误码: {}, 错误信息: {}",
            operation_name, api_resp.err_code, api_resp.err_msg
        );
        return Err(RequestError::Validation {
            status: 200,
            message: format!("{}: {}", api_resp.err_code, api_resp.err_msg),
        });
    }

    api_resp
        .data
        .ok_or_else(|| RequestError::Decode("响应中缺少 data 字段".to_string()))
}

/// 远端网关接口
///
/// 每个调用需要一份新鲜凭证；空凭证立即以 `MissingCredential` 失败。
/// `since_timestamp` 过滤只是服务端优化，调用方必须把响应当作
/// "该时刻及之后的变更，可能夹带无关记录"处理。
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn fetch_chat_histories(
        &self,
        token: &str,
        username: &str,
        since_timestamp: Option<i64>,
    ) -> Result<Vec<LocalChatHistory>, RequestError>;

    /// 创建或更新聊天历史，返回带服务端确认时间戳的记录
    async fn upsert_chat_history(
        &self,
        token: &str,
        history: &LocalChatHistory,
    ) -> Result<LocalChatHistory, RequestError>;

    async fn delete_chat_history(&self, token: &str, id: &str) -> Result<(), RequestError>;

    async fn fetch_messages(
        &self,
        token: &str,
        chat_id: &str,
        since_timestamp: Option<i64>,
    ) -> Result<Vec<LocalMessage>, RequestError>;

    async fn create_message(
        &self,
        token: &str,
        chat_id: &str,
        message: &LocalMessage,
    ) -> Result<LocalMessage, RequestError>;

    async fn update_message(
        &self,
        token: &str,
        chat_id: &str,
        message: &LocalMessage,
    ) -> Result<LocalMessage, RequestError>;

    async fn delete_message(
        &self,
        token: &str,
        chat_id: &str,
        message_id: &str,
    ) -> Result<(), RequestError>;
}

/// 聊天服务 HTTP API 客户端
pub struct ChatApi {
    client: reqwest::Client,
    api_base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchHistoriesReq<'a> {
    username: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    since_timestamp: Option<i64>,
}

#[derive(Serialize)]
struct FetchMessagesReq<'a> {
    #[serde(rename = "chatID")]
    chat_id: &'a str,
    #[serde(rename = "sinceTimestamp", skip_serializing_if = "Option::is_none")]
    since_timestamp: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatHistoriesData {
    chat_histories: Vec<LocalChatHistory>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatHistoryData {
    chat_history: LocalChatHistory,
}

#[derive(Deserialize)]
struct MessagesData {
    messages: Vec<LocalMessage>,
}

#[derive(Deserialize)]
struct MessageData {
    message: LocalMessage,
}

impl ChatApi {
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url,
        }
    }

    /// 构造 POST 请求（统一附带 operationID 和 token 头）
    fn post(
        &self,
        token: &str,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, RequestError> {
        if token.is_empty() {
            return Err(RequestError::MissingCredential);
        }
        let operation_id = Uuid::new_v4().to_string();
        let url = format!("{}{}", self.api_base_url, path);
        debug!("[ChatAPI] 📡 请求 {}, 操作ID: {}", url, operation_id);
        Ok(self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("operationID", operation_id)
            .header("token", token))
    }

    async fn send<T: serde::de::DeserializeOwned>(
        req: reqwest::RequestBuilder,
        operation_name: &str,
    ) -> Result<T, RequestError> {
        let response = req
            .send()
            .await
            .map_err(|e| RequestError::Network(e.to_string()))?;
        handle_response(response, operation_name).await
    }
}

#[async_trait]
impl RemoteGateway for ChatApi {
    async fn fetch_chat_histories(
        &self,
        token: &str,
        username: &str,
        since_timestamp: Option<i64>,
    ) -> Result<Vec<LocalChatHistory>, RequestError> {
        let req = self
            .post(token, "/chat/get_chat_histories")?
            .json(&FetchHistoriesReq {
                username,
                since_timestamp,
            });
        let data: ChatHistoriesData = Self::send(req, "聊天历史列表").await?;
        info!(
            "[ChatAPI] ✅ 聊天历史列表响应，记录数: {}",
            data.chat_histories.len()
        );
        Ok(data.chat_histories)
    }

    async fn upsert_chat_history(
        &self,
        token: &str,
        history: &LocalChatHistory,
    ) -> Result<LocalChatHistory, RequestError> {
        let req = self
            .post(token, "/chat/upsert_chat_history")?
            .json(&serde_json::json!({ "chatHistory": history }));
        let data: ChatHistoryData = Self::send(req, "聊天历史写入").await?;
        Ok(data.chat_history)
    }

    async fn delete_chat_history(&self, token: &str, id: &str) -> Result<(), RequestError> {
        let req = self
            .post(token, "/chat/delete_chat_history")?
            .json(&serde_json::json!({ "id": id }));
        // 删除接口 data 为空对象或 null，内容不重要
        let _: serde_json::Value = match Self::send(req, "聊天历史删除").await {
            Ok(v) => v,
            Err(RequestError::Decode(_)) => serde_json::Value::Null,
            Err(e) => return Err(e),
        };
        Ok(())
    }

    async fn fetch_messages(
        &self,
        token: &str,
        chat_id: &str,
        since_timestamp: Option<i64>,
    ) -> Result<Vec<LocalMessage>, RequestError> {
        let req = self
            .post(token, "/msg/get_messages")?
            .json(&FetchMessagesReq {
                chat_id,
                since_timestamp,
            });
        let data: MessagesData = Self::send(req, "消息列表").await?;
        info!(
            "[ChatAPI] ✅ 消息列表响应，chatId: {}, 记录数: {}",
            chat_id,
            data.messages.len()
        );
        Ok(data.messages)
    }

    async fn create_message(
        &self,
        token: &str,
        chat_id: &str,
        message: &LocalMessage,
    ) -> Result<LocalMessage, RequestError> {
        let req = self
            .post(token, "/msg/create_message")?
            .json(&serde_json::json!({ "chatID": chat_id, "message": message }));
        let data: MessageData = Self::send(req, "消息创建").await?;
        Ok(data.message)
    }

    async fn update_message(
        &self,
        token: &str,
        chat_id: &str,
        message: &LocalMessage,
    ) -> Result<LocalMessage, RequestError> {
        let req = self
            .post(token, "/msg/update_message")?
            .json(&serde_json::json!({ "chatID": chat_id, "message": message }));
        let data: MessageData = Self::send(req, "消息更新").await?;
        Ok(data.message)
    }

    async fn delete_message(
        &self,
        token: &str,
        chat_id: &str,
        message_id: &str,
    ) -> Result<(), RequestError> {
        let req = self
            .post(token, "/msg/delete_message")?
            .json(&serde_json::json!({ "chatID": chat_id, "messageID": message_id }));
        let _: serde_json::Value = match Self::send(req, "消息删除").await {
            Ok(v) => v,
            Err(RequestError::Decode(_)) => serde_json::Value::Null,
            Err(e) => return Err(e),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RequestError::MissingCredential.is_retryable());
        assert!(RequestError::Unauthorized("过期".into()).is_retryable());
        assert!(RequestError::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(RequestError::Network("连接被拒绝".into()).is_retryable());
        assert!(!RequestError::Validation {
            status: 422,
            message: "标题超长".into()
        }
        .is_retryable());
        assert!(!RequestError::Decode("json".into()).is_retryable());
    }

    #[test]
    fn test_empty_token_fails_fast() {
        let api = ChatApi::new(reqwest::Client::new(), "http://localhost:1".to_string());
        let err = api.post("", "/chat/get_chat_histories").unwrap_err();
        assert!(matches!(err, RequestError::MissingCredential));
    }
}
