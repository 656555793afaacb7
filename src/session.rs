//! Composition root: one per signed-in recruiter.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::api::ChatApi;
use crate::api::client::ApiClient;
use crate::api::models::Conversation;
use crate::app::AppConfig;
use crate::conversations::ConversationService;
use crate::error::ChatResult;
use crate::realtime::{ConnectionManager, ReconnectPolicy, Transport, WsTransport};
use crate::send::SendPipeline;
use crate::storage::{ConversationCache, default_db_path};
use crate::utils::websocket_url;
use crate::view::{ConversationView, ViewContext};

pub struct ChatSession {
    ctx: ViewContext,
}

impl ChatSession {
    pub fn init(config: &AppConfig) -> ChatResult<Self> {
        config.validate()?;
        let api: Arc<dyn ChatApi> = Arc::new(ApiClient::new(
            &config.base_url,
            config.token.clone(),
            config.page_size,
        ));
        let ws_url = match &config.ws_url {
            Some(url) => Url::parse(url)?,
            None => websocket_url(&config.base_url)?,
        };
        let cache = if config.cache_enabled {
            open_cache()
        } else {
            None
        };
        Ok(Self::with_parts(
            api,
            Arc::new(WsTransport::new(ws_url)),
            cache,
            config.token.clone().unwrap_or_default(),
            config.recruiter_id.clone(),
            config.reconnect.clone(),
            config.handshake_timeout(),
        ))
    }

    pub fn with_parts(
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn Transport>,
        cache: Option<ConversationCache>,
        token: String,
        recruiter_id: Option<String>,
        policy: ReconnectPolicy,
        handshake_timeout: Duration,
    ) -> Self {
        let connection = ConnectionManager::new(transport, token, policy, handshake_timeout);
        let conversations = ConversationService::new(api.clone(), cache).for_recruiter(recruiter_id);
        let sender = Arc::new(SendPipeline::new(api.clone()));
        Self {
            ctx: ViewContext {
                connection,
                api,
                conversations,
                sender,
            },
        }
    }

    /// Bring the session up. The list loads over REST without waiting for
    /// the realtime handshake.
    pub async fn start(&self) -> ChatResult<Vec<Conversation>> {
        let cached = self.ctx.conversations.load_cached();
        if cached > 0 {
            log::info!("Showing {cached} cached conversations");
        }
        // Subscribe before the fetch so nothing pushed in between is lost.
        self.ctx
            .conversations
            .start_feed(self.ctx.connection.events());
        self.ctx.connection.connect_in_background();
        self.ctx.conversations.list().await
    }

    pub async fn open(&self, conversation_id: &str) -> ChatResult<ConversationView> {
        ConversationView::mount(self.ctx.clone(), conversation_id).await
    }

    pub async fn resolve(&self, candidate_id: &str) -> ChatResult<String> {
        self.ctx.conversations.resolve(candidate_id).await
    }

    pub fn conversations(&self) -> &ConversationService {
        &self.ctx.conversations
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.ctx.connection
    }

    pub fn dispose(self) {
        self.ctx.conversations.stop_feed();
        self.ctx.connection.dispose();
    }
}

fn open_cache() -> Option<ConversationCache> {
    let path = default_db_path()?;
    match ConversationCache::open(&path) {
        Ok(cache) => Some(cache),
        Err(e) => {
            log::warn!("Conversation cache at {} unavailable: {e}", path.display());
            None
        }
    }
}
