//! Process wiring: builds the chain store, the block factory and the raft
//! server, then serves the gRPC and metrics endpoints.

use crate::block_factory::BlockFactory;
use crate::chain::ChainStore;
use crate::chain_service::ChainServiceSVC;
use crate::config;
use crate::metrics;
use crate::pb::chain_service_server::ChainServiceServer;
use crate::pb::raft_service_server::RaftServiceServer;
use crate::raft::cluster::Cluster;
use crate::raft::server::RaftServer;
use crate::raft::{fatal, spawn_guarded, RaftEvent};
use crate::raft_service::RaftServiceSVC;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tokio::sync::{watch, Mutex};

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();

pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::builder()))
}

pub struct Server {
    cluster: Arc<Cluster>,
    raft_server: Arc<RaftServer>,
    chain: Arc<ChainStore>,
    event_tx: Sender<RaftEvent>,
    quit_tx: watch::Sender<bool>,
    factory: Option<BlockFactory>,
}

impl Server {
    fn builder() -> Self {
        let chain_id = config::instance().lock().unwrap().chain_id.clone();
        let chain = Arc::new(ChainStore::new(chain_id.as_bytes()));

        let (quit_tx, quit_rx) = watch::channel(false);
        let (factory, raft_server, event_tx) = BlockFactory::new(chain.clone(), quit_rx);

        Server {
            cluster: raft_server.cluster(),
            raft_server,
            chain,
            event_tx,
            quit_tx,
            factory: Some(factory),
        }
    }

    pub fn cluster(&self) -> Arc<Cluster> {
        self.cluster.clone()
    }

    pub fn raft_server(&self) -> Arc<RaftServer> {
        self.raft_server.clone()
    }

    pub fn chain(&self) -> Arc<ChainStore> {
        self.chain.clone()
    }

    /// Inbound raft traffic is funneled into this channel.
    pub fn raft_events(&self) -> Sender<RaftEvent> {
        self.event_tx.clone()
    }

    pub async fn start(&mut self) {
        let factory = self
            .factory
            .take()
            .expect("server started twice");
        spawn_guarded("block-factory", factory.run());

        self.start_grpc_server().await;
        self.start_metrics_server().await;
    }

    pub fn stop(&mut self) {
        log::info!("server stop");
        let _ = self.quit_tx.send(true);
        self.raft_server.stop();
    }

    async fn start_grpc_server(&mut self) {
        let cfg = config::instance().lock().unwrap().clone();
        let addr = match cfg.listen_url.parse() {
            Ok(addr) => addr,
            Err(e) => fatal!("invalid listen url {}: {}", cfg.listen_url, e),
        };

        let mut builder = tonic::transport::Server::builder();
        if cfg.tls_enabled() {
            let cert = match std::fs::read(&cfg.cert_file) {
                Ok(cert) => cert,
                Err(e) => fatal!("failed to read cert file {}: {}", cfg.cert_file, e),
            };
            let key = match std::fs::read(&cfg.key_file) {
                Ok(key) => key,
                Err(e) => fatal!("failed to read key file {}: {}", cfg.key_file, e),
            };
            let identity = tonic::transport::Identity::from_pem(cert, key);
            builder = match builder
                .tls_config(tonic::transport::ServerTlsConfig::new().identity(identity))
            {
                Ok(builder) => builder,
                Err(e) => fatal!("failed to configure tls: {}", e),
            };
            log::info!("grpc server tls enabled");
        }

        let grpc_server = builder
            .add_service(RaftServiceServer::new(RaftServiceSVC::default()))
            .add_service(ChainServiceServer::new(ChainServiceSVC::default()))
            .serve(addr);
        spawn_guarded("raft-grpc", async move {
            if let Err(e) = grpc_server.await {
                fatal!("grpc server failed: {}", e);
            }
        });
        log::info!("grpc server started on {}", addr);
    }

    async fn start_metrics_server(&mut self) {
        let addr = match config::instance().lock().unwrap().metrics_addr.parse() {
            Ok(addr) => addr,
            Err(e) => fatal!("invalid metrics address: {}", e),
        };

        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        encoder.encode(&metric_families, &mut buffer).unwrap();
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
    }
}
