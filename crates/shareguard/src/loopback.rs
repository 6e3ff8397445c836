//! in-process transport to [`HelperResponder`]s
//!
//! every envelope is encoded and decoded on its way through, so the wire
//! contract is exercised exactly as over a network. per-address [`Behavior`]
//! injects the partial failures the coordination core has to tolerate.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::helper::HelperResponder;
use crate::message::{Bodies, HelperBody, Message};
use crate::transport::Transport;
use crate::{Error, Result};

/// how a loopback helper reacts to requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// answer normally
    Respond,
    /// answer with a failure status
    Reject,
    /// never answer
    Silent,
    /// refuse the connection
    Unreachable,
    /// answer normally after a pause
    Delay(Duration),
    /// answer after a pause, with a failure status
    DelayReject(Duration),
    /// answer normally but echo a different verification nonce
    WrongNonce,
    /// answer normally but confirm a different version than challenged
    WrongVersion,
}

struct Route {
    responder: Arc<HelperResponder>,
    behavior: Behavior,
    requests: usize,
}

/// routes envelopes to responders by address
#[derive(Default)]
pub struct LoopbackTransport {
    routes: RwLock<HashMap<String, Route>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// serve `responder` at its identity's address
    pub fn register(&self, responder: HelperResponder) -> Arc<HelperResponder> {
        let responder = Arc::new(responder);
        let address = responder.identity().address.clone();
        self.routes.write().unwrap_or_else(|e| e.into_inner()).insert(
            address,
            Route {
                responder: responder.clone(),
                behavior: Behavior::Respond,
                requests: 0,
            },
        );
        responder
    }

    pub fn set_behavior(&self, address: &str, behavior: Behavior) {
        if let Some(route) = self
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(address)
        {
            route.behavior = behavior;
        }
    }

    pub fn responder(&self, address: &str) -> Option<Arc<HelperResponder>> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.get(address).map(|r| r.responder.clone())
    }

    /// requests delivered to `address` so far
    pub fn request_count(&self, address: &str) -> usize {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.get(address).map(|r| r.requests).unwrap_or(0)
    }

    fn route(&self, address: &str) -> Option<(Arc<HelperResponder>, Behavior)> {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.get_mut(address).map(|r| {
            r.requests += 1;
            (r.responder.clone(), r.behavior)
        })
    }
}

fn wrong_nonce(mut reply: Message) -> Message {
    if let Bodies::Helper(bodies) = &mut reply.bodies {
        for body in bodies.iter_mut() {
            if let HelperBody::VerifyShareResponse { nonce, .. } = body {
                *nonce = nonce.wrapping_add(1);
            }
        }
    }
    reply
}

fn wrong_version(mut reply: Message) -> Message {
    if let Bodies::Helper(bodies) = &mut reply.bodies {
        for body in bodies.iter_mut() {
            if let HelperBody::VerifyShareResponse { version_number, .. } = body {
                *version_number = version_number.wrapping_add(1);
            }
        }
    }
    reply
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_request(&self, address: &str, message: Message, timeout: Duration) -> Result<Message> {
        let (responder, behavior) = self
            .route(address)
            .ok_or_else(|| Error::Transport(format!("no helper at {}", address)))?;

        let request = Message::decode(&message.encode()?)?;
        trace!(address, ?behavior, "loopback request");

        let reply = match behavior {
            Behavior::Respond => responder.respond(&request),
            Behavior::Reject => responder.reject(&request, "rejected"),
            Behavior::Silent => {
                tokio::time::sleep(timeout).await;
                return Err(Error::Timeout(timeout));
            }
            Behavior::Unreachable => {
                return Err(Error::Transport(format!("connection refused by {}", address)));
            }
            Behavior::Delay(pause) => {
                tokio::time::sleep(pause).await;
                responder.respond(&request)
            }
            Behavior::DelayReject(pause) => {
                tokio::time::sleep(pause).await;
                responder.reject(&request, "rejected")
            }
            Behavior::WrongNonce => wrong_nonce(responder.respond(&request)),
            Behavior::WrongVersion => wrong_version(responder.respond(&request)),
        };

        Message::decode(&reply.encode()?)
    }
}
