//! http-01 proof placement via an embedded well-known responder.
//!
//! Binds a plain-HTTP listener and answers
//! `GET /.well-known/acme-challenge/<token>` with the key authorization for
//! as long as the token is provisioned. Everything else is 404.

use std::{
    collections::HashMap,
    convert::Infallible,
    future::ready,
    net::{SocketAddr, TcpListener},
    sync::Arc,
};

use actix_http::{body::MessageBody, HttpService, Method, Request, Response, StatusCode};
use actix_server::{Server, ServerHandle};
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{domain_in_scope, ChallengeKind, ChallengeProvider, ProofMaterial};
use crate::error::Result;

const WELL_KNOWN_PREFIX: &str = "/.well-known/acme-challenge/";

/// Configuration for an [`Http01Provider`]. Immutable once bound.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Http01Config {
    /// Address to listen on. Validation traffic arrives on port 80, so
    /// production setups either bind `0.0.0.0:80` or sit behind a forwarder.
    pub bind_addr: SocketAddr,

    /// Domains this provider may answer for. An entry covers itself and all
    /// subdomains; `*` covers everything.
    pub domains: Vec<String>,
}

type TokenMap = Arc<RwLock<HashMap<String, String>>>;

pub struct Http01Provider {
    domains: Vec<String>,
    tokens: TokenMap,
    local_addr: SocketAddr,
    handle: ServerHandle,
}

fn route_request(req: Request, tokens: &TokenMap) -> Response<impl MessageBody> {
    if req.method() != Method::GET {
        return Response::build(StatusCode::NOT_FOUND)
            .finish()
            .map_into_boxed_body();
    }

    let Some(token) = req.path().strip_prefix(WELL_KNOWN_PREFIX) else {
        return Response::build(StatusCode::NOT_FOUND)
            .finish()
            .map_into_boxed_body();
    };

    match tokens.read().get(token).cloned() {
        Some(key_authorization) => Response::build(StatusCode::OK)
            .insert_header(("Content-Type", "text/plain"))
            .body(key_authorization)
            .map_into_boxed_body(),

        None => Response::build(StatusCode::NOT_FOUND)
            .finish()
            .map_into_boxed_body(),
    }
}

impl Http01Provider {
    /// Binds the listener and starts serving. Must be called within a Tokio
    /// runtime.
    pub fn bind(config: Http01Config) -> Result<Http01Provider> {
        let lst = TcpListener::bind(config.bind_addr)?;
        let local_addr = lst.local_addr()?;

        let tokens: TokenMap = Arc::new(RwLock::new(HashMap::new()));
        let served = Arc::clone(&tokens);

        let server = Server::build()
            .listen("acme-http-01", lst, move || {
                let tokens = Arc::clone(&served);

                HttpService::build()
                    .finish(move |req| ready(Ok::<_, Infallible>(route_request(req, &tokens))))
                    .tcp()
            })?
            .workers(1)
            .run();

        let handle = server.handle();
        tokio::spawn(server);

        log::info!("http-01 responder listening on {local_addr}");

        Ok(Http01Provider {
            domains: config.domains,
            tokens,
            local_addr,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(&self) {
        self.handle.stop(false).await;
    }
}

impl Drop for Http01Provider {
    fn drop(&mut self) {
        drop(self.handle.stop(false));
    }
}

#[async_trait]
impl ChallengeProvider for Http01Provider {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    fn covers(&self, domain: &str) -> bool {
        domain_in_scope(&self.domains, domain)
    }

    async fn provision(&self, domain: &str, material: &ProofMaterial) -> Result<()> {
        log::debug!("serving key authorization for {domain} (token {})", material.token);
        self.tokens
            .write()
            .insert(material.token.clone(), material.key_authorization.clone());
        Ok(())
    }

    async fn cleanup(&self, domain: &str, material: &ProofMaterial) -> Result<()> {
        log::debug!("dropping key authorization for {domain} (token {})", material.token);
        self.tokens.write().remove(&material.token);
        Ok(())
    }
}
