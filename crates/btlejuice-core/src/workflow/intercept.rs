//! Interception workflow
//!
//! Ties the pieces of the interception side together:
//! 1. ask the proxy to target a device
//! 2. clone the received profile onto the emulated peripheral
//! 3. relay every request of the intercepted central through the pipeline to the proxy,
//!    and every response or notification back
//! 4. on remote disconnect, tear down and optionally target the device again

use crate::client::ProxyClient;
use crate::emulator::{FakeDevice, FakeRequest};
use crate::ble::RequestError;
use crate::error::{ProxyError, Result};
use crate::gatt::{DeviceProfile, normalize};
use crate::intercept::{
    Hook, InterceptionPipeline, Mode, Operation, PendingEdit, Resolution, Verdict,
};
use crate::logging::TransactionLog;
use crate::proxy::{ClientRequest, ConnectionState, ProxyEvent};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct InterceptOptions {
    pub address: String,
    pub keep_handles: bool,
    pub reconnect: bool,
}

/// What the operator gets to see.
#[derive(Debug, Clone)]
pub enum InterceptEvent {
    Profile(DeviceProfile),
    Ready(bool),
    Status(ConnectionState),
    CentralConnected(String),
    CentralDisconnected(String),
    /// Operation waiting for a [`OperatorCommand::Resolve`].
    Edit(PendingEdit),
    /// The emulated device could not be brought up; carries the reason.
    CloneFailed(String),
    TargetLost(String),
    Stopped,
}

#[derive(Debug, Clone)]
pub enum OperatorCommand {
    Resolve(Resolution),
    SetMode(Mode),
    SetHook {
        service: String,
        characteristic: String,
        hook: Hook,
    },
    RemoveHook {
        service: String,
        characteristic: String,
    },
    Status,
    Stop,
}

pub struct InterceptSession {
    client: ProxyClient,
    fake: FakeDevice,
    pipeline: InterceptionPipeline,
    log: TransactionLog,
    options: InterceptOptions,
    events: mpsc::Sender<InterceptEvent>,
    /// Offsets of reads relayed to the proxy, until their response comes back.
    read_offsets: HashMap<(String, String), u16>,
}

impl InterceptSession {
    pub fn new(
        client: ProxyClient,
        fake: FakeDevice,
        pipeline: InterceptionPipeline,
        log: TransactionLog,
        options: InterceptOptions,
        events: mpsc::Sender<InterceptEvent>,
    ) -> Self {
        Self {
            client,
            fake,
            pipeline,
            log,
            options,
            events,
            read_offsets: HashMap::new(),
        }
    }

    /// Runs until the operator stops the session or the proxy goes away.
    ///
    /// Only a lost proxy connection ends the session with an error. Failures of the
    /// emulated device are logged and reported to the operator.
    pub async fn run(mut self, mut operator: mpsc::Receiver<OperatorCommand>) -> Result<()> {
        self.target().await?;

        loop {
            tokio::select! {
                event = self.client.next_event() => {
                    let Some(event) = event else {
                        error!("Lost connection to the proxy");
                        self.stop_clone().await;
                        return Err(ProxyError::ChannelUnavailable);
                    };
                    self.on_proxy_event(event).await?;
                }
                Some(request) = self.fake.next_request() => {
                    self.on_central_request(request).await?;
                }
                command = operator.recv() => {
                    match command {
                        Some(OperatorCommand::Stop) | None => {
                            self.shutdown().await?;
                            return Ok(());
                        }
                        Some(command) => self.on_operator(command).await?,
                    }
                }
            }
        }
    }

    async fn target(&mut self) -> Result<()> {
        info!("Targeting {}", self.options.address);
        self.log.info(format!("target {}", self.options.address));
        self.client
            .send(ClientRequest::Target {
                address: self.options.address.clone(),
                keep_handles: self.options.keep_handles,
            })
            .await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.fail_suspended();
        self.stop_clone().await;
        self.client.send(ClientRequest::Stop).await
    }

    async fn stop_clone(&mut self) {
        self.read_offsets.clear();
        if let Err(e) = self.fake.stop().await {
            error!("Failed to stop the emulated device: {}", e);
            self.log.error(format!("emulated device stop failed: {e}"));
        }
    }

    async fn emit(&mut self, event: InterceptEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Operator channel closed");
        }
    }

    async fn on_proxy_event(&mut self, event: ProxyEvent) -> Result<()> {
        match event {
            ProxyEvent::Hello => debug!("Proxy says hello"),
            ProxyEvent::Discover { address, .. } => debug!("Ignoring scan hit {}", address),
            ProxyEvent::Profile { profile } => {
                if let Err(e) = self.fake.setup(&profile).await {
                    error!("Cannot emulate {}: {}", profile.address, e);
                    self.log.error(format!("cannot emulate {}: {e}", profile.address));
                    self.emit(InterceptEvent::CloneFailed(e.to_string())).await;
                    return Ok(());
                }
                self.log.info(format!(
                    "profile {} ({} services)",
                    profile.address,
                    profile.attribute_tree.services().len()
                ));
                self.emit(InterceptEvent::Profile(profile)).await;
            }
            ProxyEvent::Ready { ok } => {
                if ok {
                    info!("Proxy is forwarding to {}", self.options.address);
                } else {
                    warn!("Proxy failed to reach {}", self.options.address);
                    self.log.error(format!("cannot reach {}", self.options.address));
                }
                self.emit(InterceptEvent::Ready(ok)).await;
            }
            ProxyEvent::BleReadResp {
                service,
                characteristic,
                data,
                error,
            } => {
                let offset = self
                    .read_offsets
                    .remove(&(normalize(&service), normalize(&characteristic)))
                    .unwrap_or(0);
                if let Some(error) = error {
                    warn!("Read of {} {} failed: {}", service, characteristic, error);
                    self.log.error(format!("{service}:{characteristic} read failed: {error}"));
                    self.fake
                        .complete_read(&service, &characteristic, Err(RequestError::Unlikely));
                } else {
                    let edit = PendingEdit::read(&service, &characteristic, data, offset);
                    self.submit(edit).await?;
                }
            }
            ProxyEvent::BleWriteResp {
                service,
                characteristic,
                error,
            } => {
                let result = match error {
                    Some(error) => {
                        warn!("Write to {} {} failed: {}", service, characteristic, error);
                        self.log.error(format!("{service}:{characteristic} write failed: {error}"));
                        Err(RequestError::Unlikely)
                    }
                    None => Ok(()),
                };
                self.fake.complete_write(&service, &characteristic, result);
            }
            ProxyEvent::BleNotifyResp {
                service,
                characteristic,
                error,
            } => {
                if let Some(error) = error {
                    warn!("Subscription on {} {} failed: {}", service, characteristic, error);
                }
            }
            ProxyEvent::BleData {
                service,
                characteristic,
                data,
            } => {
                let edit = PendingEdit::notify(&service, &characteristic, data);
                self.submit(edit).await?;
            }
            ProxyEvent::Status { state } => self.emit(InterceptEvent::Status(state)).await,
            ProxyEvent::Stopped => {
                self.fail_suspended();
                self.stop_clone().await;
                self.emit(InterceptEvent::Stopped).await;
            }
            ProxyEvent::DeviceDisconnect { address } => self.on_remote_disconnect(address).await?,
        }
        Ok(())
    }

    async fn on_remote_disconnect(&mut self, address: String) -> Result<()> {
        warn!("Remote device {} disconnected", address);
        self.log.warn(format!("device {address} disconnected"));

        self.fail_suspended();
        self.stop_clone().await;
        self.client.send(ClientRequest::Stop).await?;
        self.emit(InterceptEvent::TargetLost(address)).await;

        if self.options.reconnect {
            info!("Reconnecting to {}", self.options.address);
            self.target().await?;
        }
        Ok(())
    }

    async fn on_central_request(&mut self, request: FakeRequest) -> Result<()> {
        match request {
            FakeRequest::CentralConnected { address } => {
                self.log.info(format!("central {address} connected"));
                self.emit(InterceptEvent::CentralConnected(address)).await;
            }
            FakeRequest::CentralDisconnected { address } => {
                self.log.info(format!("central {address} disconnected"));
                self.fail_suspended();
                self.emit(InterceptEvent::CentralDisconnected(address)).await;
            }
            FakeRequest::Read {
                service,
                characteristic,
                offset,
            } => {
                self.read_offsets
                    .insert((normalize(&service), normalize(&characteristic)), offset);
                self.client
                    .send(ClientRequest::BleRead {
                        service,
                        characteristic,
                        offset,
                    })
                    .await?;
            }
            FakeRequest::Write {
                service,
                characteristic,
                data,
                offset,
                without_response,
            } => {
                let edit =
                    PendingEdit::write(&service, &characteristic, data, offset, without_response);
                self.submit(edit).await?;
            }
            FakeRequest::Subscribe {
                service,
                characteristic,
            } => {
                self.log.info(format!("{service}:{characteristic} subscribe"));
                self.client
                    .send(ClientRequest::BleNotify {
                        service,
                        characteristic,
                        enable: true,
                    })
                    .await?;
            }
            FakeRequest::Unsubscribe {
                service,
                characteristic,
            } => {
                self.log.info(format!("{service}:{characteristic} unsubscribe"));
                self.client
                    .send(ClientRequest::BleNotify {
                        service,
                        characteristic,
                        enable: false,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_operator(&mut self, command: OperatorCommand) -> Result<()> {
        match command {
            OperatorCommand::Resolve(resolution) => {
                let Some(resolved) = self.pipeline.resolve(resolution) else {
                    warn!("Nothing to resolve");
                    return Ok(());
                };
                if let Some(edit) = resolved.forward {
                    self.deliver(edit).await?;
                }
                if let Some(edit) = resolved.discarded {
                    self.log.warn(format!(
                        "{}:{} {} discarded",
                        edit.service, edit.characteristic, edit.operation
                    ));
                    self.reject(&edit);
                }
                if let Some(next) = resolved.next {
                    self.emit(InterceptEvent::Edit(next)).await;
                }
            }
            OperatorCommand::SetMode(mode) => self.pipeline.set_mode(mode),
            OperatorCommand::SetHook {
                service,
                characteristic,
                hook,
            } => self.pipeline.set_hook(&service, &characteristic, hook),
            OperatorCommand::RemoveHook {
                service,
                characteristic,
            } => {
                self.pipeline.remove_hook(&service, &characteristic);
            }
            OperatorCommand::Status => self.client.send(ClientRequest::Status).await?,
            OperatorCommand::Stop => self.shutdown().await?,
        }
        Ok(())
    }

    async fn submit(&mut self, edit: PendingEdit) -> Result<()> {
        match self.pipeline.submit(edit) {
            Verdict::Forward(edit) => self.deliver(edit).await,
            Verdict::Surface(edit) => {
                self.emit(InterceptEvent::Edit(edit)).await;
                Ok(())
            }
            Verdict::Queued => Ok(()),
        }
    }

    /// Sends an operation on to the side opposite to where it came from.
    async fn deliver(&mut self, edit: PendingEdit) -> Result<()> {
        self.log.info(format!(
            "{}:{} {} {}",
            edit.service,
            edit.characteristic,
            edit.operation,
            hex::encode(&edit.data)
        ));

        match edit.operation {
            Operation::Read => {
                self.fake
                    .complete_read(&edit.service, &edit.characteristic, Ok(edit.data));
            }
            Operation::Write => {
                self.client
                    .send(ClientRequest::BleWrite {
                        service: edit.service,
                        characteristic: edit.characteristic,
                        data: edit.data,
                        without_response: edit.without_response.unwrap_or(false),
                    })
                    .await?;
            }
            Operation::Notify => {
                if let Err(e) = self
                    .fake
                    .notify(&edit.service, &edit.characteristic, edit.data)
                    .await
                {
                    warn!(
                        "Notification on {} {} not delivered: {}",
                        edit.service, edit.characteristic, e
                    );
                    self.log.error(format!(
                        "{}:{} notification failed: {e}",
                        edit.service, edit.characteristic
                    ));
                }
            }
        }
        Ok(())
    }

    fn reject(&mut self, edit: &PendingEdit) {
        match edit.operation {
            Operation::Read => {
                self.fake.complete_read(
                    &edit.service,
                    &edit.characteristic,
                    Err(RequestError::Unlikely),
                );
            }
            Operation::Write => {
                self.fake.complete_write(
                    &edit.service,
                    &edit.characteristic,
                    Err(RequestError::Unlikely),
                );
            }
            Operation::Notify => {}
        }
    }

    fn fail_suspended(&mut self) {
        for edit in self.pipeline.clear() {
            self.reject(&edit);
        }
    }
}
