//! Faculty-side client of the broker.
//!
//! A gateway validates requests locally, submits them under a fresh
//! correlation id and retries the same id with backoff when a reply is
//! missing or unreadable. Reusing the id lets the worker's reply ledger
//! answer a retried request without reserving twice.

use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::core::{
    check_request, AllocationError, AllocationRequest, AllocationResponse, ClientAddress,
    FacultyCatalog, FailureKind, GatewayError, Reply, TransportError,
};
use crate::runtime::broker::{BrokerHandle, ClientLink};
use crate::util::{now_ms, RetryPolicy};

/// One faculty's connection to the broker.
#[derive(Debug)]
pub struct GatewayClient {
    faculty: String,
    link: ClientLink,
    reply_timeout: Duration,
    policy: RetryPolicy,
    catalog: FacultyCatalog,
}

impl GatewayClient {
    /// Connect `faculty` to the broker.
    ///
    /// # Errors
    ///
    /// Returns `Transport(Disconnected)` if the broker has stopped.
    pub fn connect(
        faculty: impl Into<String>,
        broker: &BrokerHandle,
        config: &GatewayConfig,
    ) -> Result<Self, GatewayError> {
        let faculty = faculty.into();
        let link = broker
            .connect_client()
            .map_err(|_| TransportError::Disconnected)?;
        info!(faculty = %faculty, client = %link.address(), "gateway connected");
        Ok(Self {
            faculty,
            link,
            reply_timeout: config.reply_timeout(),
            policy: config.retry_policy(),
            catalog: FacultyCatalog::default(),
        })
    }

    /// Validate program names against `catalog` before sending.
    #[must_use]
    pub fn with_catalog(mut self, catalog: FacultyCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Faculty this gateway speaks for.
    #[must_use]
    pub fn faculty(&self) -> &str {
        &self.faculty
    }

    /// Routing address of this gateway.
    #[must_use]
    pub const fn address(&self) -> &ClientAddress {
        self.link.address()
    }

    /// Send a request and return the allocation outcome.
    ///
    /// A shortfall is `Ok` with `unavailable` set.
    ///
    /// # Errors
    ///
    /// `Rejected` for invalid requests, `Failed` for terminal failure
    /// replies, `Transport` when no reply could be obtained.
    pub async fn request(
        &mut self,
        request: &AllocationRequest,
    ) -> Result<AllocationResponse, GatewayError> {
        match self.request_raw(request).await? {
            Reply::Allocation(response) => Ok(response),
            Reply::Error(reply) if reply.kind == FailureKind::Validation => {
                Err(GatewayError::Rejected(reply.error))
            }
            Reply::Error(reply) => Err(GatewayError::Failed {
                kind: reply.kind,
                reason: reply.error,
            }),
        }
    }

    /// Send a request and return whichever reply arrives.
    ///
    /// # Errors
    ///
    /// `Rejected` if local validation fails; `Transport` when the broker is
    /// gone or every attempt timed out or came back unreadable.
    pub async fn request_raw(&mut self, request: &AllocationRequest) -> Result<Reply, GatewayError> {
        if request.faculty != self.faculty {
            return Err(GatewayError::Rejected(format!(
                "gateway for `{}` cannot send for faculty `{}`",
                self.faculty, request.faculty
            )));
        }
        check_request(&self.catalog, request).map_err(|e| match e {
            AllocationError::Validation(reason) => GatewayError::Rejected(reason),
            other => GatewayError::Rejected(other.to_string()),
        })?;

        let mut request = request.clone();
        request.requested_at.get_or_insert_with(now_ms);
        let payload = request
            .to_payload()
            .map_err(|e| GatewayError::Rejected(format!("unencodable request: {e}")))?;
        let correlation_id = Uuid::new_v4().to_string();

        let attempts = self.policy.attempts();
        for attempt in 0..attempts {
            let delay = self.policy.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.link
                .submit(&correlation_id, payload.clone())
                .map_err(|_| TransportError::Disconnected)?;

            match self.await_reply(&correlation_id).await {
                Ok(Reply::Error(reply)) if reply.kind == FailureKind::Transport => {
                    warn!(
                        correlation_id = %correlation_id,
                        attempt,
                        reason = %reply.error,
                        "transport failure reported, retrying"
                    );
                }
                Ok(reply) => return Ok(reply),
                Err(TransportError::Disconnected) => {
                    return Err(TransportError::Disconnected.into());
                }
                Err(e) => {
                    warn!(correlation_id = %correlation_id, attempt, error = %e, "attempt failed");
                }
            }
        }

        warn!(
            correlation_id = %correlation_id,
            faculty = %self.faculty,
            program = %request.program,
            attempts,
            "no reply after retries"
        );
        Err(TransportError::RetriesExhausted { attempts }.into())
    }

    async fn await_reply(&mut self, correlation_id: &str) -> Result<Reply, TransportError> {
        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        loop {
            let envelope = match tokio::time::timeout_at(deadline, self.link.recv()).await {
                Err(_) => return Err(TransportError::Timeout(self.reply_timeout)),
                Ok(None) => return Err(TransportError::Disconnected),
                Ok(Some(envelope)) => envelope,
            };
            if envelope.correlation_id != correlation_id {
                debug!(
                    expected = correlation_id,
                    received = %envelope.correlation_id,
                    "stale reply discarded"
                );
                continue;
            }
            return Reply::from_payload(&envelope.payload)
                .map_err(|e| TransportError::MalformedReply(e.to_string()));
        }
    }
}
