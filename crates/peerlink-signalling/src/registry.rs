//! Session registry — which negotiation session owns which session id.
//!
//! Owned exclusively by the [`SignallingChannel`](crate::SignallingChannel). Sessions only
//! touch it through `register_session` / `unregister_session`.

use std::collections::HashMap;
use std::sync::Arc;

use peerlink_common::protocol::{IceNegotiation, MediaNegotiation};
use peerlink_common::{IceCandidateInit, Negotiation, SessionBind, SessionDescription};
use tokio::sync::RwLock;

/// Receives remote ICE candidates for one session.
pub type IceHandler = Arc<dyn Fn(IceCandidateInit) + Send + Sync + 'static>;

/// Receives remote session descriptions for one session.
pub type MediaHandler = Arc<dyn Fn(SessionDescription) + Send + Sync + 'static>;

#[derive(Clone)]
pub struct SessionRoute {
    pub consumer_id: String,
    pub producer_id: String,
    pub on_ice: Option<IceHandler>,
    pub on_media: Option<MediaHandler>,
}

/// What happened to an inbound negotiation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Dispatched,
    /// No session registered under that id.
    UnknownSession,
    /// The session exists but the consumer/producer ids differ.
    Mismatch,
    /// The session has no handler for this kind of negotiation.
    NoHandler,
}

#[derive(Default)]
pub struct SessionRegistry {
    /// Map of session_id → route
    routes: RwLock<HashMap<String, SessionRoute>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route. The last registration for an id wins.
    pub async fn register(&self, session_id: String, route: SessionRoute) -> bool {
        self.routes.write().await.insert(session_id, route).is_some()
    }

    /// Remove a route. Removing an unknown id is a no-op.
    pub async fn remove(&self, session_id: &str) -> bool {
        self.routes.write().await.remove(session_id).is_some()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.routes.read().await.contains_key(session_id)
    }

    /// Deliver a negotiation message to its session, if the routing triple matches exactly.
    ///
    /// Handlers are invoked after the registry lock is released.
    pub async fn route(&self, negotiation: Negotiation) -> RouteOutcome {
        let bind = match &negotiation {
            Negotiation::IceNegotiation(n) => &n.bind,
            Negotiation::MediaNegotiation(n) => &n.bind,
        };

        let route = match self.lookup(bind).await {
            Ok(route) => route,
            Err(outcome) => return outcome,
        };

        match negotiation {
            Negotiation::IceNegotiation(IceNegotiation { ice, .. }) => match route.on_ice {
                Some(handler) => handler(ice),
                None => return RouteOutcome::NoHandler,
            },
            Negotiation::MediaNegotiation(MediaNegotiation { sdp, .. }) => match route.on_media {
                Some(handler) => handler(sdp),
                None => return RouteOutcome::NoHandler,
            },
        }
        RouteOutcome::Dispatched
    }

    async fn lookup(&self, bind: &SessionBind) -> Result<SessionRoute, RouteOutcome> {
        let routes = self.routes.read().await;
        let route = routes
            .get(&bind.session_id)
            .ok_or(RouteOutcome::UnknownSession)?;
        if route.consumer_id != bind.consumer_id || route.producer_id != bind.producer_id {
            return Err(RouteOutcome::Mismatch);
        }
        Ok(route.clone())
    }
}
