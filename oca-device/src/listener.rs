//! TCP endpoint accepting controller connections

use crate::controller::StreamController;
use crate::device::Device;
use anyhow::{Context, Result};
use oca_transport::{StreamAccessor, TcpTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};

/// Accepts controllers on a TCP port and serves each on its own task
pub struct DeviceListener {
    device: Device,
    listener: TcpListener,
    lightweight_socket: Option<Arc<UdpSocket>>,
}

impl DeviceListener {
    pub async fn bind(device: Device, address: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind {}", address))?;
        log::info!("listening for controllers on {}", listener.local_addr()?);
        Ok(Self {
            device,
            listener,
            lightweight_socket: None,
        })
    }

    /// Also offer lightweight notification delivery from a UDP socket bound
    /// to the listening address
    pub async fn with_lightweight_notifications(mut self) -> Result<Self> {
        let address = self.local_addr()?;
        let socket = UdpSocket::bind(address)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", address))?;
        self.lightweight_socket = Some(Arc::new(socket));
        Ok(self)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    /// Accept connections until accepting fails
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .context("failed to accept controller connection")?;
            if let Err(e) = stream.set_nodelay(true) {
                log::warn!("failed to set TCP_NODELAY for {}: {}", peer, e);
            }
            let transport: Arc<dyn StreamAccessor> = Arc::new(TcpTransport::from_tcp(stream));
            let controller = StreamController::new(
                self.device.next_controller_id(),
                transport,
                self.device.config(),
            );
            let controller = match &self.lightweight_socket {
                Some(socket) => controller.with_lightweight_socket(socket.clone()),
                None => controller,
            };
            tokio::spawn(Arc::new(controller).run(self.device.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use oca_core::OcaStatus;
    use oca_core::well_known::{SUBSCRIPTION_MANAGER_ONO, root};
    use oca_ocp1::{CodecOptions, Command, Message, Parameters, receive_pdu, send_messages};
    use oca_transport::{TcpConnector, TcpSettings, TransportLayer};

    #[tokio::test]
    async fn test_accepts_controllers() {
        let device = Device::new(DeviceConfig::default());
        let listener = DeviceListener::bind(device.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
            .with_lightweight_notifications()
            .await
            .unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(listener.run());

        let stream = TcpConnector::new(TcpSettings::new(address)).open().await.unwrap();
        let command = Command::new(5, SUBSCRIPTION_MANAGER_ONO, root::GET_LOCKABLE, Parameters::default());
        send_messages(&*stream, &[Message::CommandRrq(command)], CodecOptions::LEGACY)
            .await
            .unwrap();
        let pdu = receive_pdu(&*stream, CodecOptions::LEGACY).await.unwrap();
        match &pdu.messages[0] {
            Message::Response(response) => {
                assert_eq!(response.handle, 5);
                assert_eq!(response.status_code, OcaStatus::Ok);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(device.controller_count().await, 1);
        server.abort();
    }
}
