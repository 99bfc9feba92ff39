//! Multi-hop routing between networking nodes
//!
//! Request-direction envelopes (CALL, RESPONSEERROR) collect hops at the
//! front of their network path: the originator and every forwarder prepend
//! their own identity. Replies carry the exact reverse of the request path
//! and are consumed from the back; each hop checks that the path terminates
//! at itself, pops itself and hands the envelope to the new last hop.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::envelope::Routing;
use crate::error::ErrorCode;
use crate::identity::{Identity, NetworkPath};
use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no route to {0}")]
    UnknownDestination(Identity),

    #[error("routing loop: {0} is already on path {1}")]
    Loop(Identity, NetworkPath),

    #[error("reply path {path} does not terminate at {local}")]
    MisroutedReply { local: Identity, path: NetworkPath },

    #[error("reply for {destination} ran out of hops at {local}")]
    PathExhausted { local: Identity, destination: Identity },
}

impl RoutingError {
    /// Error code of the REQUESTERROR sent back for this fault
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::ProtocolError
    }
}

/// What to do with a request-direction envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStep {
    /// This node is the destination
    Deliver,
    /// Hand to the next hop after `stamp`ing the path
    Forward(Identity),
}

/// What to do with a reply-direction envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStep {
    /// Reply reached its originator
    Deliver,
    /// Hand to the next hop (this node already popped from the path)
    Forward(Identity),
}

/// Next-hop table of one node
#[derive(Clone)]
pub struct Router {
    local: Identity,
    routes: HashMap<Identity, Identity>,
    default_uplink: Option<Identity>,
    registry: ConnectionRegistry,
}

impl Router {
    pub fn new(local: Identity, registry: ConnectionRegistry) -> Self {
        Self {
            local,
            routes: HashMap::new(),
            default_uplink: None,
            registry,
        }
    }

    /// Reach `destination` through the neighbour `via`
    pub fn with_route(mut self, destination: Identity, via: Identity) -> Self {
        self.routes.insert(destination, via);
        self
    }

    pub fn with_routes(mut self, routes: impl IntoIterator<Item = (Identity, Identity)>) -> Self {
        self.routes.extend(routes);
        self
    }

    /// Neighbour used for every destination without a better route
    pub fn with_default_uplink(mut self, uplink: Option<Identity>) -> Self {
        self.default_uplink = uplink;
        self
    }

    pub fn local(&self) -> &Identity {
        &self.local
    }

    /// Bound neighbour to hand an envelope for `destination` to
    pub fn next_hop(&self, destination: &Identity) -> Option<Identity> {
        if self.registry.is_bound(destination) {
            return Some(destination.clone());
        }

        if let Some(via) = self.routes.get(destination) {
            if self.registry.is_bound(via) {
                return Some(via.clone());
            }
            debug!("Route {} via {} is down", destination, via);
        }

        self.default_uplink
            .as_ref()
            .filter(|uplink| self.registry.is_bound(uplink))
            .cloned()
    }

    /// Routing for a request this node originates, and the neighbour to send it to
    pub fn originate(&self, destination: &Identity) -> Result<(Routing, Identity), RoutingError> {
        let next = self
            .next_hop(destination)
            .ok_or_else(|| RoutingError::UnknownDestination(destination.clone()))?;
        let path = NetworkPath::from_hops([self.local.clone()]);
        Ok((Routing::new(destination.clone(), path), next))
    }

    /// Handle a request-direction envelope received from `peer`.
    ///
    /// The peer is recorded on the path if it did not add itself. Error
    /// replies built from `routing` afterwards travel back to the peer.
    pub fn accept_request(&self, peer: &Identity, routing: &mut Routing) -> Result<RequestStep, RoutingError> {
        if routing.network_path.first() != Some(peer) {
            routing.network_path.prepend(peer.clone());
        }

        if routing.destination == self.local {
            return Ok(RequestStep::Deliver);
        }

        if routing.network_path.contains(&self.local) {
            return Err(RoutingError::Loop(self.local.clone(), routing.network_path.clone()));
        }

        let next = self
            .next_hop(&routing.destination)
            .ok_or_else(|| RoutingError::UnknownDestination(routing.destination.clone()))?;

        debug!(
            "Forwarding to {} via {} on path {}",
            routing.destination, next, routing.network_path
        );
        Ok(RequestStep::Forward(next))
    }

    /// Record this node on the path of an envelope it forwards
    pub fn stamp(&self, routing: &mut Routing) {
        routing.network_path.prepend(self.local.clone());
    }

    /// Handle a reply-direction envelope received by this node
    pub fn accept_reply(&self, routing: &mut Routing) -> Result<ReplyStep, RoutingError> {
        if routing.network_path.last() != Some(&self.local) {
            return Err(RoutingError::MisroutedReply {
                local: self.local.clone(),
                path: routing.network_path.clone(),
            });
        }
        routing.network_path.pop_last();

        match routing.network_path.last() {
            Some(next) => Ok(ReplyStep::Forward(next.clone())),
            None if routing.destination == self.local => Ok(ReplyStep::Deliver),
            None => Err(RoutingError::PathExhausted {
                local: self.local.clone(),
                destination: routing.destination.clone(),
            }),
        }
    }

    /// First hop of a reply this node originates
    pub fn reply_hop(routing: &Routing) -> Option<&Identity> {
        routing.network_path.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;

    fn bound(registry: &ConnectionRegistry, identity: &str) {
        // Writer side dropped: only the binding matters for next-hop lookup
        registry.bind(Connection::new(Identity::new(identity), None).0);
    }

    fn router(local: &str, neighbours: &[&str]) -> Router {
        let registry = ConnectionRegistry::new();
        for n in neighbours {
            bound(&registry, n);
        }
        Router::new(Identity::new(local), registry)
    }

    fn path(hops: &[&str]) -> NetworkPath {
        NetworkPath::from_hops(hops.iter().map(|h| Identity::new(*h)))
    }

    #[test]
    fn test_next_hop_preference() {
        let r = router("NN1", &["CS1", "NN2", "CSMS"])
            .with_route(Identity::new("CS9"), Identity::new("NN2"))
            .with_route(Identity::new("CS8"), Identity::new("NN3"))
            .with_default_uplink(Some(Identity::new("CSMS")));

        assert_eq!(r.next_hop(&Identity::new("CS1")), Some(Identity::new("CS1")));
        assert_eq!(r.next_hop(&Identity::new("CS9")), Some(Identity::new("NN2")));
        // NN3 is not connected: fall back to the uplink
        assert_eq!(r.next_hop(&Identity::new("CS8")), Some(Identity::new("CSMS")));
        assert_eq!(r.next_hop(&Identity::new("anything")), Some(Identity::new("CSMS")));
    }

    #[test]
    fn test_no_route_is_unknown_destination() {
        let r = router("NN1", &[]);
        assert_eq!(
            r.originate(&Identity::new("CS1")).unwrap_err(),
            RoutingError::UnknownDestination(Identity::new("CS1"))
        );
    }

    #[test]
    fn test_forwarding_prepends_self() {
        let r = router("B", &["C"]).with_route(Identity::new("D"), Identity::new("C"));
        let mut routing = Routing::new(Identity::new("D"), path(&["A"]));

        let step = r.accept_request(&Identity::new("A"), &mut routing).unwrap();
        assert_eq!(step, RequestStep::Forward(Identity::new("C")));
        assert_eq!(routing.network_path, path(&["A"]));

        r.stamp(&mut routing);
        assert_eq!(routing.network_path, path(&["B", "A"]));
    }

    #[test]
    fn test_peer_recorded_when_missing() {
        let r = router("D", &[]);
        let mut routing = Routing::new(Identity::new("D"), path(&[]));

        assert_eq!(r.accept_request(&Identity::new("C"), &mut routing).unwrap(), RequestStep::Deliver);
        assert_eq!(routing.network_path, path(&["C"]));
    }

    #[test]
    fn test_loop_is_rejected() {
        let r = router("B", &["C"]).with_default_uplink(Some(Identity::new("C")));
        let mut routing = Routing::new(Identity::new("D"), path(&["C", "B", "A"]));

        assert!(matches!(
            r.accept_request(&Identity::new("C"), &mut routing),
            Err(RoutingError::Loop(..))
        ));
    }

    #[test]
    fn test_path_symmetry_through_three_hops() {
        // A -> B -> C -> D
        let a = router("A", &["B"]).with_default_uplink(Some(Identity::new("B")));
        let b = router("B", &["A", "C"]).with_default_uplink(Some(Identity::new("C")));
        let c = router("C", &["B", "D"]);
        let d = router("D", &["C"]);

        let (mut routing, next) = a.originate(&Identity::new("D")).unwrap();
        assert_eq!(next, Identity::new("B"));
        assert_eq!(b.accept_request(&Identity::new("A"), &mut routing).unwrap(), RequestStep::Forward("C".into()));
        b.stamp(&mut routing);
        assert_eq!(c.accept_request(&Identity::new("B"), &mut routing).unwrap(), RequestStep::Forward("D".into()));
        c.stamp(&mut routing);
        assert_eq!(d.accept_request(&Identity::new("C"), &mut routing).unwrap(), RequestStep::Deliver);
        assert_eq!(routing.network_path, path(&["C", "B", "A"]));

        let mut reply = routing.reply();
        assert_eq!(reply.destination, Identity::new("A"));
        assert_eq!(reply.network_path.reversed(), path(&["C", "B", "A"]));
        assert_eq!(Router::reply_hop(&reply), Some(&Identity::new("C")));

        assert_eq!(c.accept_reply(&mut reply).unwrap(), ReplyStep::Forward("B".into()));
        assert_eq!(b.accept_reply(&mut reply).unwrap(), ReplyStep::Forward("A".into()));
        assert_eq!(a.accept_reply(&mut reply).unwrap(), ReplyStep::Deliver);
    }

    #[test]
    fn test_misrouted_reply_is_a_fault() {
        let b = router("B", &[]);
        let mut reply = Routing::new(Identity::new("A"), path(&["A", "X"]));
        assert!(matches!(
            b.accept_reply(&mut reply),
            Err(RoutingError::MisroutedReply { .. })
        ));
        // Nothing consumed
        assert_eq!(reply.network_path, path(&["A", "X"]));
    }

    #[test]
    fn test_reply_for_someone_else_with_empty_path() {
        let b = router("B", &[]);
        let mut reply = Routing::new(Identity::new("A"), path(&["B"]));
        assert!(matches!(
            b.accept_reply(&mut reply),
            Err(RoutingError::PathExhausted { .. })
        ));
    }
}
