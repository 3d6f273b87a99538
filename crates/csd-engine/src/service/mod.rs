//! Command service table and the helpers services use to answer commands

mod chunk;

use std::sync::Arc;

use csd_proto::{Response, ServiceKey};
use dashmap::DashMap;
use tracing::{debug, warn};

pub use chunk::{FillService, ReadService, WriteService, register_chunk_services};

use crate::messenger::EngineContext;
use crate::request::{Flow, RequestStatus, WorkRequest};
use crate::transport::{ConnectionSession, PostResult};

/// Handler for one (class, sequence) pair.
///
/// A service is invoked once per state the request reaches, so it inspects
/// [`WorkRequest::status`] to know which phase it is in. It either posts the
/// request to the transport and returns [`Flow::Pending`], or changes the
/// status and returns [`Flow::Continue`] to be called again.
pub trait CommandService: Send + Sync {
    /// Advance `req` by one step
    fn handle(
        &self,
        ctx: &EngineContext,
        conn: &Arc<dyn ConnectionSession>,
        req: Box<WorkRequest>,
    ) -> Flow;
}

/// Services keyed by `(class << 8) | sequence`
#[derive(Default)]
pub struct CommandServiceTable {
    services: DashMap<ServiceKey, Arc<dyn CommandService>>,
}

impl CommandServiceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` for `(class, sequence)`, returning the service it
    /// replaced
    pub fn register_service(
        &self,
        class: u8,
        sequence: u8,
        service: Arc<dyn CommandService>,
    ) -> Option<Arc<dyn CommandService>> {
        let key = ServiceKey::new(class, sequence);
        debug!("Registered command service {}", key);
        self.services.insert(key, service)
    }

    /// Remove the service for `(class, sequence)`
    pub fn unregister_service(&self, class: u8, sequence: u8) -> Option<Arc<dyn CommandService>> {
        self.services
            .remove(&ServiceKey::new(class, sequence))
            .map(|(_, service)| service)
    }

    /// Service for `(class, sequence)`, if registered
    pub fn get_service(&self, class: u8, sequence: u8) -> Option<Arc<dyn CommandService>> {
        self.services
            .get(&ServiceKey::new(class, sequence))
            .map(|entry| entry.value().clone())
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service is registered
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl std::fmt::Debug for CommandServiceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.services.iter().map(|entry| *entry.key()).collect();
        keys.sort();
        f.debug_struct("CommandServiceTable")
            .field("services", &keys)
            .finish()
    }
}

/// Encode `response` into the request's header buffer and post it
pub fn reply(
    ctx: &EngineContext,
    conn: &Arc<dyn ConnectionSession>,
    mut req: Box<WorkRequest>,
    response: Response,
) -> Flow {
    req.write_response(&response);
    ctx.stats().response_sent(response.return_code.is_success());
    posted(ctx, conn.send(req))
}

/// Translate a post result into the next step. A refused post fails the
/// request.
pub fn posted(ctx: &EngineContext, result: PostResult) -> Flow {
    match result {
        Ok(()) => Flow::Pending,
        Err(refused) => {
            let mut req = refused.request;
            warn!("Request {} post failed: {}", req.id(), refused.error);
            ctx.stats().transport_error();
            req.set_status(RequestStatus::Error);
            Flow::Continue(req)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl CommandService for Nop {
        fn handle(
            &self,
            _ctx: &EngineContext,
            _conn: &Arc<dyn ConnectionSession>,
            _req: Box<WorkRequest>,
        ) -> Flow {
            Flow::Pending
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let table = CommandServiceTable::new();
        assert!(table.get_service(0xF0, 0).is_none());

        assert!(table.register_service(0xF0, 0, Arc::new(Nop)).is_none());
        assert!(table.register_service(0xF0, 0, Arc::new(Nop)).is_some());
        assert!(table.get_service(0xF0, 0).is_some());
        assert!(table.get_service(0xF0, 1).is_none());
        assert!(table.get_service(0x00, 0xF0).is_none());
        assert_eq!(table.len(), 1);

        assert!(table.unregister_service(0xF0, 0).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_chunk_services_cover_every_op() {
        let table = CommandServiceTable::new();
        register_chunk_services(&table);
        for op in csd_proto::ChunkOp::ALL {
            assert!(table.get_service(csd_proto::CLASS_CHUNK, op as u8).is_some());
        }
        assert_eq!(table.len(), 4);
    }
}
