//! The client: one REST engine, one gateway session, the caches and the bus.

use std::sync::Arc;

use tracing::info;

use crate::cache::Caches;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::gateway::{GatewayEngine, GatewayHandle};
use crate::rest::RestEngine;

/// A Discord bot client.
///
/// Owns exactly one [`RestEngine`], at most one gateway session, and the
/// caches the gateway task writes into. Listeners register on
/// [`Client::events`] before [`Client::connect`].
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    rest: Arc<RestEngine>,
    events: Arc<EventBus>,
    caches: Arc<Caches>,
    gateway: Option<GatewayHandle>,
}

impl Client {
    /// Build a client. No network traffic happens here.
    ///
    /// # Errors
    ///
    /// `Error::Validation` for an empty token or malformed API URL.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.token.trim().is_empty() {
            return Err(Error::Validation("bot token must not be empty".into()));
        }
        let rest = Arc::new(RestEngine::new(&config)?);
        Ok(Self {
            config,
            rest,
            events: Arc::new(EventBus::new()),
            caches: Arc::new(Caches::new()),
            gateway: None,
        })
    }

    #[must_use]
    pub fn rest(&self) -> &Arc<RestEngine> {
        &self.rest
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    #[must_use]
    pub fn caches(&self) -> &Arc<Caches> {
        &self.caches
    }

    /// The running gateway session, if [`Client::connect`] has been called.
    #[must_use]
    pub fn gateway(&self) -> Option<&GatewayHandle> {
        self.gateway.as_ref()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.gateway.as_ref().is_some_and(GatewayHandle::is_ready)
    }

    /// Resolve the gateway URL (configured, or from `GET /gateway/bot`) and
    /// start the session task.
    ///
    /// # Errors
    ///
    /// `Error::Validation` when already connected; any REST error from the
    /// gateway URL lookup.
    pub async fn connect(&mut self) -> Result<()> {
        if self.gateway.is_some() {
            return Err(Error::Validation("gateway already connected".into()));
        }

        let url = match &self.config.gateway_url {
            Some(url) => url.clone(),
            None => self.rest.get_gateway_bot().await?.url,
        };
        info!(%url, "starting gateway session");

        let engine = GatewayEngine::new(
            self.config.clone(),
            Arc::clone(&self.events),
            Arc::clone(&self.caches),
        );
        self.gateway = Some(engine.spawn(url));
        Ok(())
    }

    /// Close the gateway session, if one is running, and wait for the task
    /// to finish.
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.gateway.take() {
            handle.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_token() {
        let err = Client::new(ClientConfig::new("")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn builds_with_defaults() {
        let client = Client::new(ClientConfig::new("token")).unwrap();
        assert!(client.gateway().is_none());
        assert!(!client.is_ready());
        assert!(client.caches().guilds.is_empty());
    }
}
