//! Concrete HTTP fallback gateway. Request and response shapes mirror
//! the channel event payloads, so reducers downstream are
//! transport-agnostic. The caller identity travels as a query
//! parameter on every request.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{ConversationId, FileMeta, MessageId, MessageKind, UserId},
    protocol::{ConversationSummary, MessagePage, MessagePayload},
};

use crate::{
    error::EngineError,
    transport::{NewMessageRequest, RestGateway},
};

#[derive(Serialize)]
struct ListMessagesQuery<'a> {
    user_id: &'a str,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before_message_id: Option<&'a str>,
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    user_id: &'a str,
    conversation_id: &'a str,
    kind: MessageKind,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_meta: Option<&'a FileMeta>,
}

pub struct HttpRestGateway {
    http: Client,
    server_url: String,
    user_id: UserId,
    typing_fallback: bool,
}

impl HttpRestGateway {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            user_id,
            typing_fallback: true,
        }
    }

    /// Disables the typing-status endpoint for servers where typing is
    /// channel-only.
    pub fn without_typing_fallback(mut self) -> Self {
        self.typing_fallback = false;
        self
    }
}

#[async_trait]
impl RestGateway for HttpRestGateway {
    async fn list_conversations(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>, EngineError> {
        let server_url = &self.server_url;
        let conversations = self
            .http
            .get(format!("{server_url}/conversations"))
            .query(&[
                ("user_id", self.user_id.as_str()),
                ("limit", &limit.to_string()),
                ("offset", &offset.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversations)
    }

    async fn conversation_detail(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary, EngineError> {
        let server_url = &self.server_url;
        let conversation = self
            .http
            .get(format!("{server_url}/conversations/{conversation_id}"))
            .query(&[("user_id", self.user_id.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversation)
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before_message_id: Option<&MessageId>,
    ) -> Result<MessagePage, EngineError> {
        let server_url = &self.server_url;
        let limit = limit.clamp(1, 100);
        let page = self
            .http
            .get(format!(
                "{server_url}/conversations/{conversation_id}/messages"
            ))
            .query(&ListMessagesQuery {
                user_id: self.user_id.as_str(),
                limit,
                before_message_id: before_message_id.map(|id| id.as_str()),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page)
    }

    async fn post_message(
        &self,
        request: &NewMessageRequest,
    ) -> Result<MessagePayload, EngineError> {
        let server_url = &self.server_url;
        let message = self
            .http
            .post(format!("{server_url}/messages"))
            .json(&SendMessageBody {
                user_id: self.user_id.as_str(),
                conversation_id: request.conversation_id.as_str(),
                kind: request.kind,
                content: &request.content,
                file_meta: request.file_meta.as_ref(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(message)
    }

    async fn post_recall(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), EngineError> {
        let server_url = &self.server_url;
        self.http
            .post(format!("{server_url}/messages/{message_id}/recall"))
            .query(&[
                ("user_id", self.user_id.as_str()),
                ("conversation_id", conversation_id.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn post_mark_read(&self, conversation_id: &ConversationId) -> Result<(), EngineError> {
        let server_url = &self.server_url;
        self.http
            .post(format!("{server_url}/conversations/{conversation_id}/read"))
            .query(&[("user_id", self.user_id.as_str())])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn supports_typing(&self) -> bool {
        self.typing_fallback
    }

    async fn post_typing(
        &self,
        conversation_id: &ConversationId,
        is_typing: bool,
    ) -> Result<(), EngineError> {
        let server_url = &self.server_url;
        self.http
            .post(format!(
                "{server_url}/conversations/{conversation_id}/typing"
            ))
            .query(&[
                ("user_id", self.user_id.as_str()),
                ("is_typing", if is_typing { "true" } else { "false" }),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
