//! `DiskArbitration` service implementation (spec.md §6).
//!
//! Every method here does exactly one thing: build a `DaemonCommand`, send
//! it down the channel `main.rs` wired to `daemon::run`, and await the
//! `oneshot` reply. None of these methods ever touches a registry or the
//! dispatcher directly — tonic requires `Send` futures, and the daemon
//! state behind them is `Rc<RefCell<_>>` (not `Send`), so this module is
//! the one place that boundary is crossed.

use crate::daemon::DaemonCommand;
use shared::descriptor::{fields_from_wire, Descriptor, DescriptorKey};
use shared::errors::ArbitrationError;
use shared::proto::callback::CallbackKind;
use shared::proto::request::{ArbitrationStatus, RequestKind};
use shared::proto::rpc::disk_arbitration_server::DiskArbitration;
use shared::proto::rpc::*;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tonic::{Request, Response, Status};

#[derive(Clone)]
pub struct RpcServer {
    commands: mpsc::UnboundedSender<DaemonCommand>,
}

impl RpcServer {
    pub fn new(commands: mpsc::UnboundedSender<DaemonCommand>) -> Self {
        Self { commands }
    }

    /// Sends a command built from a fresh `oneshot` pair and awaits the
    /// reply. `build` closes over every field but the reply sender, so
    /// each call site reads as the one line naming its `DaemonCommand`
    /// variant.
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> DaemonCommand) -> Result<T, Status> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| Status::unavailable("daemon event loop is not running"))?;
        rx.await.map_err(|_| Status::internal("daemon dropped the reply channel"))
    }
}

fn status_response(result: Result<(), ArbitrationError>) -> StatusResponse {
    match result {
        Ok(()) => StatusResponse {
            status: ArbitrationStatus::Success as i32,
            detail: String::new(),
        },
        Err(e) => StatusResponse {
            status: e.status() as i32,
            detail: e.detail(),
        },
    }
}

fn callback_from_wire(req: SessionRegisterCallbackRequest) -> crate::registry::Callback {
    crate::registry::Callback {
        kind: CallbackKind::try_from(req.kind).unwrap_or(CallbackKind::CallbackKindUnspecified),
        order: req.order,
        address: req.address,
        context: req.context,
        match_dict: req.r#match.map(|m| fields_from_wire(&m.fields)),
        watch_set: req
            .watch
            .map(|w| w.keys.iter().filter_map(|k| DescriptorKey::from_name(k)).collect()),
        sequence: 0,
    }
}

impl DiskArbitration for RpcServer {
    async fn session_create(&self, request: Request<SessionCreateRequest>) -> Result<Response<SessionCreateResponse>, Status> {
        let req = request.into_inner();
        let session_id = self
            .call(|reply| DaemonCommand::SessionCreate {
                client_name: req.client_name,
                pid: req.caller_pid,
                reply,
            })
            .await?;
        Ok(Response::new(SessionCreateResponse {
            status: ArbitrationStatus::Success as i32,
            session_id,
        }))
    }

    async fn session_release(&self, request: Request<SessionReleaseRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let existed = self
            .call(|reply| DaemonCommand::SessionRelease { session_id: req.session_id, reply })
            .await?;
        let status = if existed {
            ArbitrationStatus::Success
        } else {
            ArbitrationStatus::BadArgument
        };
        Ok(Response::new(StatusResponse { status: status as i32, detail: String::new() }))
    }

    async fn session_set_client_port(
        &self,
        request: Request<SessionSetClientPortRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::SessionSetClientPort {
                session_id: req.session_id,
                endpoint: req.client_endpoint,
                reply,
            })
            .await?;
        Ok(Response::new(status_response(result)))
    }

    async fn session_set_authorization(
        &self,
        request: Request<SessionSetAuthorizationRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::SessionSetAuthorization {
                session_id: req.session_id,
                capability: req.capability,
                reply,
            })
            .await?;
        Ok(Response::new(status_response(result)))
    }

    async fn session_register_callback(
        &self,
        request: Request<SessionRegisterCallbackRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let session_id = req.session_id;
        let callback = callback_from_wire(req);
        let result = self
            .call(|reply| DaemonCommand::SessionRegisterCallback { session_id, callback, reply })
            .await?;
        Ok(Response::new(status_response(result)))
    }

    async fn session_unregister_callback(
        &self,
        request: Request<SessionUnregisterCallbackRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::SessionUnregisterCallback {
                session_id: req.session_id,
                address: req.address,
                context: req.context,
                reply,
            })
            .await?;
        Ok(Response::new(status_response(result)))
    }

    async fn session_copy_callback_queue(
        &self,
        request: Request<SessionCopyCallbackQueueRequest>,
    ) -> Result<Response<SessionCopyCallbackQueueResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::SessionCopyCallbackQueue { session_id: req.session_id, reply })
            .await?;
        let response = match result {
            Ok(invocations) => SessionCopyCallbackQueueResponse {
                status: ArbitrationStatus::Success as i32,
                invocations,
            },
            Err(e) => SessionCopyCallbackQueueResponse {
                status: e.status() as i32,
                invocations: Vec::new(),
            },
        };
        Ok(Response::new(response))
    }

    async fn session_queue_request(
        &self,
        request: Request<SessionQueueRequestRequest>,
    ) -> Result<Response<SessionQueueRequestResponse>, Status> {
        let peer = crate::rpc::peer_credentials(&request);
        let req = request.into_inner();
        let kind = RequestKind::try_from(req.kind).unwrap_or(RequestKind::RequestKindUnspecified);
        let (caller_euid, caller_egid) = peer.map(|p| (p.uid, p.gid)).unwrap_or((u32::MAX, u32::MAX));
        let (request_id, result) = self
            .call(|reply| DaemonCommand::SessionQueueRequest {
                session_id: req.session_id,
                kind,
                disk_id: req.disk_id,
                options: req.options,
                argument1: req.argument1,
                argument2: req.argument2,
                address: req.address,
                context: req.context,
                caller_euid,
                caller_egid,
                reply,
            })
            .await?;
        let status = match result {
            Ok(()) => ArbitrationStatus::Success,
            Err(e) => e.status(),
        };
        Ok(Response::new(SessionQueueRequestResponse { status: status as i32, request_id }))
    }

    async fn session_queue_response(
        &self,
        request: Request<SessionQueueResponseRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let status = ArbitrationStatus::try_from(req.response).unwrap_or(ArbitrationStatus::StatusUnspecified);
        let dissent = ArbitrationError::from_status(status, req.dissent_detail);
        let result = self
            .call(|reply| DaemonCommand::SessionQueueResponse {
                session_id: req.session_id,
                response_id: req.response_id,
                dissent,
                reply,
            })
            .await?;
        Ok(Response::new(status_response(result)))
    }

    async fn disk_copy_description(
        &self,
        request: Request<DiskCopyDescriptionRequest>,
    ) -> Result<Response<DiskCopyDescriptionResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::DiskCopyDescription { disk_id: req.disk_id, reply })
            .await?;
        let response = match result {
            Ok(descriptor) => DiskCopyDescriptionResponse {
                status: ArbitrationStatus::Success as i32,
                descriptor: Some(descriptor.to_wire()),
            },
            Err(e) => DiskCopyDescriptionResponse {
                status: e.status() as i32,
                descriptor: Some(Descriptor::new().to_wire()),
            },
        };
        Ok(Response::new(response))
    }

    async fn disk_get_options(&self, request: Request<DiskIdRequest>) -> Result<Response<DiskGetOptionsResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::DiskGetOptions { disk_id: req.disk_id, reply })
            .await?;
        let response = match result {
            Ok(options) => DiskGetOptionsResponse { status: ArbitrationStatus::Success as i32, options },
            Err(e) => DiskGetOptionsResponse { status: e.status() as i32, options: 0 },
        };
        Ok(Response::new(response))
    }

    async fn disk_set_options(&self, request: Request<DiskSetOptionsRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::DiskSetOptions {
                disk_id: req.disk_id,
                options: req.options,
                set: req.set,
                reply,
            })
            .await?;
        Ok(Response::new(status_response(result)))
    }

    async fn disk_get_user_uid(&self, request: Request<DiskIdRequest>) -> Result<Response<DiskGetUserUidResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::DiskGetUserUid { disk_id: req.disk_id, reply })
            .await?;
        let response = match result {
            Ok(uid) => DiskGetUserUidResponse { status: ArbitrationStatus::Success as i32, uid },
            Err(e) => DiskGetUserUidResponse { status: e.status() as i32, uid: 0 },
        };
        Ok(Response::new(response))
    }

    async fn disk_is_claimed(&self, request: Request<DiskIdRequest>) -> Result<Response<DiskIsClaimedResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::DiskIsClaimed { disk_id: req.disk_id, reply })
            .await?;
        let response = match result {
            Ok(claimed) => DiskIsClaimedResponse { status: ArbitrationStatus::Success as i32, claimed },
            Err(e) => DiskIsClaimedResponse { status: e.status() as i32, claimed: false },
        };
        Ok(Response::new(response))
    }

    async fn disk_unclaim(&self, request: Request<DiskIdRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::DiskUnclaim {
                session_id: req.session_id,
                disk_id: req.disk_id,
                reply,
            })
            .await?;
        Ok(Response::new(status_response(result)))
    }

    async fn disk_set_adoption(&self, request: Request<DiskSetAdoptionRequest>) -> Result<Response<StatusResponse>, Status> {
        let caller_euid = crate::rpc::peer_credentials(&request).map(|p| p.uid).unwrap_or(u32::MAX);
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::DiskSetAdoption {
                disk_id: req.disk_id,
                adopting: req.adopting,
                caller_euid,
                reply,
            })
            .await?;
        Ok(Response::new(status_response(result)))
    }

    async fn disk_set_encoding(&self, request: Request<DiskSetEncodingRequest>) -> Result<Response<StatusResponse>, Status> {
        let caller_euid = crate::rpc::peer_credentials(&request).map(|p| p.uid).unwrap_or(u32::MAX);
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::DiskSetEncoding {
                disk_id: req.disk_id,
                encoding: req.encoding,
                caller_euid,
                reply,
            })
            .await?;
        Ok(Response::new(status_response(result)))
    }

    async fn mkdir(&self, request: Request<PathRequest>) -> Result<Response<StatusResponse>, Status> {
        let peer = crate::rpc::peer_credentials(&request);
        let req = request.into_inner();
        let (caller_euid, caller_egid) = peer.map(|p| (p.uid, p.gid)).unwrap_or((u32::MAX, u32::MAX));
        let result = self
            .call(|reply| DaemonCommand::Mkdir {
                path: PathBuf::from(req.path),
                caller_euid,
                caller_egid,
                reply,
            })
            .await?;
        Ok(Response::new(status_response(result)))
    }

    async fn rmdir(&self, request: Request<PathRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .call(|reply| DaemonCommand::Rmdir { path: PathBuf::from(req.path), reply })
            .await?;
        Ok(Response::new(status_response(result)))
    }
}
