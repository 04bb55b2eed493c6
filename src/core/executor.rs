//! Request handler abstraction run by every worker slot.

use async_trait::async_trait;
use tracing::{debug, error};

use crate::core::allocation::AllocationEngine;
use crate::core::message::{AllocationRequest, Envelope, ErrorReply, FailureKind};
use crate::core::AllocationError;

/// Turns a request envelope into a reply payload.
///
/// Handlers never fail: every problem becomes an encoded [`ErrorReply`] so
/// the client always receives a terminal answer.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use classroom_broker::core::{Envelope, RequestHandler};
///
/// #[derive(Clone)]
/// struct Echo;
///
/// #[async_trait]
/// impl RequestHandler for Echo {
///     async fn handle(&self, envelope: &Envelope) -> Vec<u8> {
///         envelope.payload.clone()
///     }
/// }
/// ```
#[async_trait]
pub trait RequestHandler: Send + Sync + Clone + 'static {
    /// Produce the reply payload for `envelope`.
    async fn handle(&self, envelope: &Envelope) -> Vec<u8>;
}

/// Decodes allocation requests and runs them through an engine.
#[derive(Debug, Clone)]
pub struct AllocationHandler {
    engine: AllocationEngine,
}

impl AllocationHandler {
    /// Handler over `engine`.
    #[must_use]
    pub const fn new(engine: AllocationEngine) -> Self {
        Self { engine }
    }

    /// The wrapped engine.
    #[must_use]
    pub const fn engine(&self) -> &AllocationEngine {
        &self.engine
    }
}

#[async_trait]
impl RequestHandler for AllocationHandler {
    async fn handle(&self, envelope: &Envelope) -> Vec<u8> {
        let request = match AllocationRequest::from_payload(&envelope.payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(correlation_id = %envelope.correlation_id, error = %e, "malformed request");
                return ErrorReply::new(FailureKind::Validation, format!("malformed request: {e}"))
                    .to_payload();
            }
        };

        match self
            .engine
            .allocate(&request, Some(&envelope.correlation_id))
            .await
        {
            Ok(response) => serde_json::to_vec(&response).unwrap_or_else(|e| {
                error!(error = %e, "failed to encode allocation response");
                ErrorReply::new(FailureKind::Internal, "response encoding failed").to_payload()
            }),
            Err(AllocationError::Validation(reason)) => {
                ErrorReply::new(FailureKind::Validation, reason).to_payload()
            }
            Err(e) => {
                error!(correlation_id = %envelope.correlation_id, error = %e, "allocation failed");
                ErrorReply::new(FailureKind::Internal, e.to_string()).to_payload()
            }
        }
    }
}
