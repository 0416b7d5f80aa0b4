//! The inbound callback server: one per process, started lazily the
//! first time a real (non-`None`) watch or provide callback is
//! registered, bound at `<socket>.<pid>` per §6's endpoint convention.

use std::time::Duration;

use apteryx_wire::{CallbackReply, CallbackRequest};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{ClientError, Shared};

pub(crate) enum InboundState {
    Stopped,
    Running {
        shutdown_tx: oneshot::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
    },
}

pub(crate) async fn ensure_running(shared: &std::sync::Arc<Shared>) -> Result<(), ClientError> {
    let mut inbound = shared.inbound.lock().unwrap();
    if matches!(*inbound, InboundState::Running { .. }) {
        return Ok(());
    }

    let endpoint = shared.inbound_endpoint();
    let listener = apteryx_transport::bind(std::path::Path::new(&endpoint))?;
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let shared_for_task = shared.clone();

    let handle = tokio::spawn(async move {
        let serve_fut = apteryx_transport::serve(listener, move |stream| {
            let shared = shared_for_task.clone();
            async move { handle_conn(stream, shared).await }
        });
        tokio::select! {
            _ = serve_fut => {}
            _ = &mut shutdown_rx => {}
        }
    });

    debug!(endpoint, "inbound callback server listening");
    *inbound = InboundState::Running { shutdown_tx, handle };
    Ok(())
}

pub(crate) async fn stop(shared: &std::sync::Arc<Shared>, grace: Duration) {
    let state = std::mem::replace(&mut *shared.inbound.lock().unwrap(), InboundState::Stopped);
    if let InboundState::Running { shutdown_tx, handle } = state {
        let _ = shutdown_tx.send(());
        if tokio::time::timeout(grace, handle).await.is_err() {
            warn!("inbound callback server did not shut down within the grace period");
        }
    }
}

async fn handle_conn(stream: tokio::net::UnixStream, shared: std::sync::Arc<Shared>) {
    let (mut reader, outbound) = apteryx_transport::split(stream);
    loop {
        let payload = match apteryx_transport::read_frame_default(&mut reader).await {
            Ok(payload) => payload,
            Err(apteryx_transport::TransportError::Closed) => return,
            Err(err) => {
                warn!(%err, "inbound callback connection read failed");
                return;
            }
        };
        let request = match apteryx_wire::decode_callback_request_default(&payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "failed to decode inbound callback request");
                return;
            }
        };
        let reply = dispatch(&shared, request);
        let frame = match apteryx_wire::encode_callback_reply_default(&reply) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "failed to encode callback reply");
                return;
            }
        };
        if outbound.send(frame).is_err() {
            return;
        }
    }
}

fn dispatch(shared: &Shared, request: CallbackRequest) -> CallbackReply {
    match request {
        CallbackRequest::WatchNotify {
            path,
            value,
            owner: _,
            cb,
            priv_,
        } => {
            let callback = shared.watch_callbacks.lock().unwrap().get(&cb).cloned();
            if let Some(callback) = callback {
                callback(&path, priv_, &value);
            }
            CallbackReply::Ok
        }
        CallbackRequest::ProvideRequest {
            path,
            owner: _,
            cb,
            priv_,
        } => {
            let callback = shared.provide_callbacks.lock().unwrap().get(&cb).cloned();
            let value = callback.map(|callback| callback(&path, priv_)).unwrap_or_default();
            CallbackReply::Value { value }
        }
    }
}
