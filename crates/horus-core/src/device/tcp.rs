//! ZKTeco TCP transport: one connected session with a device.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use super::protocol::{self, cmd, request};
use super::{DeviceLog, DeviceUser};
use crate::error::DeviceError;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(2_000);
const MAX_CONNECT_TIMEOUT_MS: u64 = 5_000;
const READ_BUF_LEN: usize = 65_536;

pub(crate) struct ZkTcp {
    addr: String,
    timeout: Duration,
    stream: Option<TcpStream>,
    session_id: u16,
    reply_id: u16,
}

fn io_error(context: &str, e: std::io::Error) -> DeviceError {
    match e.kind() {
        std::io::ErrorKind::TimedOut => DeviceError::Timeout(format!("{context}: {e}")),
        _ => DeviceError::Connect(format!("{context}: {e}")),
    }
}

impl ZkTcp {
    /// Open the socket and perform the `CONNECT` handshake.
    pub(crate) async fn connect(addr: String, timeout_ms: u64) -> Result<Self, DeviceError> {
        let connect_timeout = Duration::from_millis(timeout_ms.min(MAX_CONNECT_TIMEOUT_MS));
        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DeviceError::Timeout(format!("TCP connect timeout to {addr}")))?
            .map_err(|e| io_error(&format!("TCP connect to {addr}"), e))?;

        let mut session = Self {
            addr,
            timeout: Duration::from_millis(timeout_ms),
            stream: Some(stream),
            session_id: 0,
            reply_id: 0,
        };
        let reply = session.execute(cmd::CONNECT, &[]).await?;
        if let Ok(header) = protocol::decode_tcp_header(&reply) {
            session.session_id = header.session_id;
        }
        tracing::debug!(addr = %session.addr, session_id = session.session_id, "device session opened");
        Ok(session)
    }

    /// `AUTH` with the numeric comm key.
    pub(crate) async fn auth(&mut self, comm_key: u32) -> Result<(), DeviceError> {
        let reply = self.execute(cmd::AUTH, &comm_key.to_le_bytes()).await?;
        let header = protocol::decode_tcp_header(&reply)
            .map_err(|_| DeviceError::Auth("empty response".into()))?;
        if header.command == cmd::ACK_OK {
            Ok(())
        } else {
            Err(DeviceError::Auth(format!(
                "device replied {}",
                protocol::command_name(header.command)
            )))
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, DeviceError> {
        self.stream.as_mut().ok_or(DeviceError::NotConnected)
    }

    async fn read_some(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize, DeviceError> {
        let stream = self.stream()?;
        let n = timeout(wait, stream.read(buf))
            .await
            .map_err(|_| DeviceError::Timeout("waiting for device reply".into()))?
            .map_err(|e| io_error("TCP read", e))?;
        if n == 0 {
            return Err(DeviceError::Connect("connection closed by device".into()));
        }
        Ok(n)
    }

    /// Send one command and return the first reply frame.
    async fn execute(&mut self, command: u16, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        if command == cmd::CONNECT {
            self.session_id = 0;
            self.reply_id = 0;
        } else {
            self.reply_id = self.reply_id.wrapping_add(1);
        }
        let frame = protocol::encode_tcp_packet(command, self.session_id, self.reply_id, data);
        self.stream()?
            .write_all(&frame)
            .await
            .map_err(|e| io_error("TCP write", e))?;

        let wait = if command == cmd::CONNECT || command == cmd::EXIT {
            CONTROL_TIMEOUT
        } else {
            self.timeout
        };
        let mut buf = vec![0u8; READ_BUF_LEN];
        let n = self.read_some(&mut buf, wait).await?;
        buf.truncate(n);
        Ok(buf)
    }

    fn next_frame(&mut self, command: u16, data: &[u8]) -> Vec<u8> {
        self.reply_id = self.reply_id.wrapping_add(1);
        protocol::encode_tcp_packet(command, self.session_id, self.reply_id, data)
    }

    /// Buffered read of a large table (users or attendance).
    async fn read_with_buffer(&mut self, body: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let frame = self.next_frame(cmd::DATA_WRRQ, body);
        self.stream()?
            .write_all(&frame)
            .await
            .map_err(|e| io_error("TCP write", e))?;

        let mut tmp = vec![0u8; READ_BUF_LEN];
        let mut reply = Vec::new();
        while reply.len() < protocol::TCP_HEADER_LEN {
            let n = self.read_some(&mut tmp, self.timeout).await?;
            reply.extend_from_slice(&tmp[..n]);
        }
        let header = protocol::decode_tcp_header(&reply)?;

        match header.command {
            cmd::DATA => Ok(reply[protocol::TCP_HEADER_LEN..].to_vec()),
            cmd::ACK_OK | cmd::PREPARE_DATA => {
                let size = protocol::prepare_data_size(&reply[protocol::TCP_HEADER_LEN..])
                    .ok_or_else(|| DeviceError::Protocol("prepare-data reply too short".into()))?;
                self.read_chunks(size, &mut tmp).await
            }
            other => Err(DeviceError::Protocol(format!(
                "unexpected reply to data request: {other} ({})",
                protocol::command_name(other)
            ))),
        }
    }

    async fn read_chunks(&mut self, size: usize, tmp: &mut [u8]) -> Result<Vec<u8>, DeviceError> {
        let total_chunks = size.div_ceil(protocol::MAX_CHUNK);
        let remain = size % protocol::MAX_CHUNK;

        let requests: Vec<Vec<u8>> = (0..total_chunks)
            .map(|i| {
                let start = i * protocol::MAX_CHUNK;
                let len = if i + 1 == total_chunks && remain > 0 {
                    remain
                } else {
                    protocol::MAX_CHUNK
                };
                let mut body = Vec::with_capacity(8);
                body.extend_from_slice(&(start as u32).to_le_bytes());
                body.extend_from_slice(&(len as u32).to_le_bytes());
                self.next_frame(cmd::DATA_RDY, &body)
            })
            .collect();
        let stream = self.stream()?;
        for frame in &requests {
            stream
                .write_all(frame)
                .await
                .map_err(|e| io_error("TCP write chunk request", e))?;
        }

        // Large tables take a while on slow devices.
        let budget = Duration::from_secs(60 + total_chunks as u64 * 30);
        let deadline = Instant::now() + budget;
        tracing::info!(bytes = size, chunks = total_chunks, timeout_secs = budget.as_secs(), "receiving device table");

        let mut data = Vec::with_capacity(size);
        let mut pending = Vec::new();
        let mut chunk = Vec::new();
        let mut chunks_left = total_chunks;

        while chunks_left > 0 {
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                return Err(DeviceError::Timeout(format!(
                    "{chunks_left} chunks outstanding, got {}/{size} bytes",
                    data.len()
                )));
            }
            let n = self.read_some(tmp, wait).await?;
            if protocol::is_realtime_event(&tmp[..n]) {
                continue;
            }
            pending.extend_from_slice(&tmp[..n]);

            while pending.len() >= 8 {
                let packet_len = usize::from(u16::from_le_bytes([pending[4], pending[5]]));
                if pending.len() < 8 + packet_len {
                    break;
                }
                if packet_len >= 8 {
                    chunk.extend_from_slice(&pending[protocol::TCP_HEADER_LEN..8 + packet_len]);
                }
                pending.drain(..8 + packet_len);

                let expected = if chunks_left > 1 {
                    protocol::MAX_CHUNK + 8
                } else {
                    remain + 8
                };
                if chunk.len() >= expected {
                    if chunk.len() > 8 {
                        data.extend_from_slice(&chunk[8..]);
                    }
                    chunk.clear();
                    chunks_left -= 1;
                    if chunks_left == 0 {
                        break;
                    }
                }
            }
        }
        Ok(data)
    }

    pub(crate) async fn free_data(&mut self) -> Result<(), DeviceError> {
        self.execute(cmd::FREE_DATA, &[]).await.map(|_| ())
    }

    pub(crate) async fn users(&mut self) -> Result<Vec<DeviceUser>, DeviceError> {
        let _ = self.free_data().await;
        let data = self.read_with_buffer(request::USERS).await?;
        let _ = self.free_data().await;
        Ok(protocol::records(&data, protocol::USER_RECORD_LEN)
            .filter_map(protocol::decode_user)
            .collect())
    }

    pub(crate) async fn attendance(&mut self) -> Result<Vec<DeviceLog>, DeviceError> {
        let _ = self.free_data().await;
        let data = self.read_with_buffer(request::ATTENDANCE_LOGS).await?;
        let _ = self.free_data().await;
        Ok(protocol::records(&data, protocol::ATTENDANCE_RECORD_LEN)
            .filter_map(protocol::decode_attendance)
            .collect())
    }

    /// `(user_count, log_count)` from `GET_FREE_SIZES`; zeros when the
    /// reply is too short to carry them.
    pub(crate) async fn free_sizes(&mut self) -> Result<(u32, u32), DeviceError> {
        let reply = self.execute(cmd::GET_FREE_SIZES, &[]).await?;
        let inner = protocol::strip_tcp_prefix(&reply);
        let payload = inner.get(8..).unwrap_or(inner);
        let read = |at: usize| {
            payload
                .get(at..at + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };
        match (payload.len() >= 76, read(24), read(40)) {
            (true, Some(users), Some(logs)) => Ok((users, logs)),
            _ => Ok((0, 0)),
        }
    }

    /// Send `EXIT` and close the socket. Errors are ignored.
    pub(crate) async fn disconnect(&mut self) {
        if self.stream.is_some() {
            let _ = self.execute(cmd::EXIT, &[]).await;
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        tracing::debug!(addr = %self.addr, "device session closed");
    }
}
