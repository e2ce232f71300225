use crate::session::Session;
use async_trait::async_trait;
use flowcore::{ActionToken, LinkToken};

/// Moves dispatch tokens to the worker that owns them.
#[async_trait]
pub trait FlowRouter: Send + Sync {
    /// Returns false when the token could not be handed over.
    async fn route_action(&self, session: &Session, token: ActionToken) -> bool;

    async fn route_link(&self, session: &Session, token: LinkToken) -> bool;
}

/// Delivers straight into the session's own worker inboxes
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRouter;

#[async_trait]
impl FlowRouter for LocalRouter {
    async fn route_action(&self, session: &Session, token: ActionToken) -> bool {
        session.push_action(token).await
    }

    async fn route_link(&self, session: &Session, token: LinkToken) -> bool {
        session.push_link(token).await
    }
}
