//! Modbus RTU master adapter
//!
//! Frames on the line are delimited by silence: once no byte has arrived for
//! the inter-frame time the collected bytes form one frame. The adapter keeps
//! the master's half-duplex discipline itself. After a request it refuses
//! further sends until a reply arrives or the turnaround timeout passes.

use std::time::Duration;

use errors::{BridgeError, BridgeResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SerialConfig;
use crate::frame::{encode_rtu_frame, RtuFrame, MAX_PDU_SIZE, MAX_RTU_FRAME_LEN};
use crate::transport::{Direction, SerialFrame, SerialFrameMeta, SerialTransport};

/// Outgoing ADUs waiting for the line
const REQUEST_CHANNEL_CAPACITY: usize = 4;

/// Received frames waiting for the engine
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Timing and echo behaviour of one RTU line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOptions {
    /// Bus silence that terminates a frame
    pub inter_frame_time: Duration,
    /// How long a request blocks further sends when no reply arrives
    pub turnaround_timeout: Duration,
    /// Bound on writing one ADU to the port
    pub write_timeout: Duration,
    /// The transceiver reads back what it sends
    pub local_echo: bool,
}

impl Default for LineOptions {
    fn default() -> Self {
        Self {
            inter_frame_time: Duration::from_millis(8),
            turnaround_timeout: Duration::from_millis(450),
            write_timeout: Duration::from_millis(1000),
            local_echo: false,
        }
    }
}

impl From<&SerialConfig> for LineOptions {
    fn from(config: &SerialConfig) -> Self {
        Self {
            inter_frame_time: config.inter_frame_time(),
            turnaround_timeout: config.turnaround_timeout(),
            write_timeout: config.write_timeout(),
            local_echo: config.local_echo,
        }
    }
}

/// RTU master feeding the bridge engine
pub struct RtuMasterAdapter {
    requests: mpsc::Sender<Vec<u8>>,
    frames: mpsc::Receiver<Vec<u8>>,
    options: LineOptions,
    /// Set while sends are blocked by the turnaround
    awaiting_since: Option<Instant>,
    /// A request went out and nothing has answered it yet
    reply_pending: bool,
    /// ADU expected back from the transceiver when `local_echo` is set
    pending_echo: Option<Vec<u8>>,
    io_task: JoinHandle<()>,
}

impl RtuMasterAdapter {
    /// Open the configured serial port
    pub fn open(config: &SerialConfig, shutdown: CancellationToken) -> BridgeResult<Self> {
        let port = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits(config.data_bits))
            .stop_bits(stop_bits(config.stop_bits))
            .parity(parity(&config.parity))
            .open_native_async()
            .map_err(|e| BridgeError::SerialPort {
                port: config.port.clone(),
                reason: e.to_string(),
            })?;
        info!(
            "Serial port {} open: {} baud, {}{}{}{}",
            config.port,
            config.baud_rate,
            config.data_bits,
            config.parity.chars().next().unwrap_or('N'),
            config.stop_bits,
            if config.local_echo { ", local echo" } else { "" }
        );

        Ok(Self::from_stream(port, LineOptions::from(config), shutdown))
    }

    /// Run the master over any byte stream standing in for the serial line
    pub fn from_stream<T>(stream: T, options: LineOptions, shutdown: CancellationToken) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (requests, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (frames_tx, frames) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let io_task = tokio::spawn(run_line(stream, requests_rx, frames_tx, options, shutdown));

        Self {
            requests,
            frames,
            options,
            awaiting_since: None,
            reply_pending: false,
            pending_echo: None,
            io_task,
        }
    }

    /// A request is on the line and its turnaround has not run out
    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_since.is_some()
    }

    fn classify(&mut self, raw: &[u8]) -> Direction {
        // Only the first frame after a send can be the transceiver's read-back
        if let Some(echo) = self.pending_echo.take() {
            if echo == raw {
                return Direction::Request;
            }
        }
        // Late replies still count; the engine drops them if their head timed out
        if std::mem::take(&mut self.reply_pending) {
            self.awaiting_since = None;
            Direction::Response
        } else {
            Direction::Request
        }
    }
}

impl Drop for RtuMasterAdapter {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

impl SerialTransport for RtuMasterAdapter {
    fn poll_frames(&mut self, frames: &mut Vec<SerialFrame>) {
        while let Ok(raw) = self.frames.try_recv() {
            let direction = self.classify(&raw);
            let frame = RtuFrame::split(&raw);
            frames.push(SerialFrame {
                pdu: frame.pdu,
                meta: SerialFrameMeta {
                    unit_id: frame.unit_id,
                    direction,
                    valid: frame.crc_ok,
                },
            });
        }

        if let Some(since) = self.awaiting_since {
            if since.elapsed() > self.options.turnaround_timeout {
                debug!("RTU turnaround timeout, line free");
                self.awaiting_since = None;
            }
        }
    }

    fn send_raw_request(&mut self, unit_id: u8, pdu: &[u8]) -> bool {
        if self.awaiting_since.is_some() || pdu.is_empty() || pdu.len() > MAX_PDU_SIZE {
            return false;
        }
        let adu = encode_rtu_frame(unit_id, pdu);
        match self.requests.try_send(adu.clone()) {
            Ok(()) => {
                self.awaiting_since = Some(Instant::now());
                self.reply_pending = true;
                self.pending_echo = self.options.local_echo.then_some(adu);
                true
            },
            Err(_) => false,
        }
    }
}

async fn run_line<T>(
    stream: T,
    mut requests: mpsc::Receiver<Vec<u8>>,
    frames: mpsc::Sender<Vec<u8>>,
    options: LineOptions,
    shutdown: CancellationToken,
) where
    T: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut frame = Vec::with_capacity(MAX_RTU_FRAME_LEN);
    let mut chunk = [0u8; MAX_RTU_FRAME_LEN];

    loop {
        // Restarted on every iteration, so it measures silence since the last event
        let silence = tokio::time::sleep(options.inter_frame_time);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(adu) = requests.recv() => {
                let write = async {
                    writer.write_all(&adu).await?;
                    writer.flush().await
                };
                match tokio::time::timeout(options.write_timeout, write).await {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => {
                        error!("Serial write failed: {}", e);
                        break;
                    },
                    Err(_) => {
                        warn!(
                            "Serial write timed out after {:?}, request dropped",
                            options.write_timeout
                        );
                    },
                }
            }
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    warn!("Serial line closed");
                    break;
                },
                Ok(n) => {
                    frame.extend_from_slice(&chunk[..n]);
                    if frame.len() >= MAX_RTU_FRAME_LEN
                        && frames.send(std::mem::take(&mut frame)).await.is_err()
                    {
                        break;
                    }
                },
                Err(e) => {
                    error!("Serial read failed: {}", e);
                    break;
                },
            },
            _ = silence, if !frame.is_empty() => {
                if frames.send(std::mem::take(&mut frame)).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("RTU line task stopped");
}

fn data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn parity(parity: &str) -> tokio_serial::Parity {
    match parity {
        "Even" => tokio_serial::Parity::Even,
        "Odd" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    const GAP: Duration = Duration::from_millis(5);

    fn options(turnaround_ms: u64, local_echo: bool) -> LineOptions {
        LineOptions {
            inter_frame_time: GAP,
            turnaround_timeout: Duration::from_millis(turnaround_ms),
            write_timeout: Duration::from_millis(100),
            local_echo,
        }
    }

    fn adapter_with(options: LineOptions) -> (RtuMasterAdapter, DuplexStream) {
        let (line, device) = tokio::io::duplex(1024);
        let adapter = RtuMasterAdapter::from_stream(line, options, CancellationToken::new());
        (adapter, device)
    }

    fn adapter() -> (RtuMasterAdapter, DuplexStream) {
        adapter_with(options(200, false))
    }

    async fn wait_frames(adapter: &mut RtuMasterAdapter, count: usize) -> Vec<SerialFrame> {
        let mut frames = Vec::new();
        for _ in 0..200 {
            adapter.poll_frames(&mut frames);
            if frames.len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        frames
    }

    #[tokio::test]
    async fn test_request_written_with_crc() {
        let (mut adapter, mut device) = adapter();
        assert!(adapter.send_raw_request(0x01, &[0x03, 0x00, 0x00, 0x00, 0x0A]));

        let mut adu = [0u8; 8];
        device.read_exact(&mut adu).await.unwrap();
        assert_eq!(adu, [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
    }

    #[tokio::test]
    async fn test_second_send_refused_until_reply() {
        let (mut adapter, mut device) = adapter();
        assert!(adapter.send_raw_request(0x02, &[0x03, 0x00, 0x00, 0x00, 0x01]));
        assert!(!adapter.send_raw_request(0x02, &[0x03, 0x00, 0x01, 0x00, 0x01]));

        let mut adu = [0u8; 8];
        device.read_exact(&mut adu).await.unwrap();
        device
            .write_all(&encode_rtu_frame(0x02, &[0x03, 0x02, 0x12, 0x34]))
            .await
            .unwrap();

        let frames = wait_frames(&mut adapter, 1).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].meta.direction, Direction::Response);
        assert_eq!(frames[0].meta.unit_id, 0x02);
        assert!(frames[0].meta.valid);
        assert_eq!(&frames[0].pdu[..], &[0x03, 0x02, 0x12, 0x34]);
        assert!(!adapter.is_awaiting_reply());
        assert!(adapter.send_raw_request(0x02, &[0x03, 0x00, 0x01, 0x00, 0x01]));
    }

    #[tokio::test]
    async fn test_split_writes_joined_into_one_frame() {
        let (mut adapter, mut device) = adapter();
        assert!(adapter.send_raw_request(0x05, &[0x04, 0x00, 0x00, 0x00, 0x01]));
        let reply = encode_rtu_frame(0x05, &[0x04, 0x02, 0x00, 0x2A]);
        device.write_all(&reply[..3]).await.unwrap();
        device.write_all(&reply[3..]).await.unwrap();

        let frames = wait_frames(&mut adapter, 1).await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].meta.valid);
    }

    #[tokio::test]
    async fn test_unsolicited_and_corrupt_frames() {
        let (mut adapter, mut device) = adapter();
        device
            .write_all(&encode_rtu_frame(0x07, &[0x03, 0x00, 0x00, 0x00, 0x01]))
            .await
            .unwrap();
        let frames = wait_frames(&mut adapter, 1).await;
        assert_eq!(frames[0].meta.direction, Direction::Request);

        assert!(adapter.send_raw_request(0x07, &[0x03, 0x00, 0x00, 0x00, 0x01]));
        device.write_all(&[0x07, 0x00, 0x90, 0x02]).await.unwrap();
        let frames = wait_frames(&mut adapter, 1).await;
        assert_eq!(frames[0].meta.direction, Direction::Response);
        assert!(!frames[0].meta.valid);
    }

    #[tokio::test]
    async fn test_write_single_reply_identical_to_request() {
        let (mut adapter, mut device) = adapter();
        let pdu = [0x06, 0x00, 0x10, 0x00, 0x01];
        assert!(adapter.send_raw_request(0x01, &pdu));

        // FC06 replies echo the request byte for byte
        let mut adu = [0u8; 8];
        device.read_exact(&mut adu).await.unwrap();
        device.write_all(&adu).await.unwrap();

        let frames = wait_frames(&mut adapter, 1).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].meta.direction, Direction::Response);
        assert_eq!(&frames[0].pdu[..], &pdu);
        assert!(!adapter.is_awaiting_reply());
    }

    #[tokio::test]
    async fn test_local_echo_skips_first_copy_only() {
        let (mut adapter, mut device) = adapter_with(options(200, true));
        let pdu = [0x05, 0x00, 0x01, 0xFF, 0x00];
        assert!(adapter.send_raw_request(0x04, &pdu));

        let mut adu = [0u8; 8];
        device.read_exact(&mut adu).await.unwrap();
        device.write_all(&adu).await.unwrap();

        let frames = wait_frames(&mut adapter, 1).await;
        assert_eq!(frames[0].meta.direction, Direction::Request);
        assert!(adapter.is_awaiting_reply());

        tokio::time::sleep(GAP * 4).await;
        device.write_all(&adu).await.unwrap();
        let frames = wait_frames(&mut adapter, 1).await;
        assert_eq!(frames[0].meta.direction, Direction::Response);
        assert!(!adapter.is_awaiting_reply());
    }

    #[tokio::test]
    async fn test_turnaround_timeout_frees_line() {
        let (line, _device) = tokio::io::duplex(64);
        let mut adapter =
            RtuMasterAdapter::from_stream(line, options(20, false), CancellationToken::new());
        assert!(adapter.send_raw_request(0x01, &[0x03, 0x00]));
        tokio::time::sleep(Duration::from_millis(40)).await;

        let mut frames = Vec::new();
        adapter.poll_frames(&mut frames);
        assert!(!adapter.is_awaiting_reply());
        assert!(adapter.send_raw_request(0x01, &[0x03, 0x00]));
    }

    #[tokio::test]
    async fn test_reply_after_turnaround_still_a_response() {
        let (mut adapter, mut device) = adapter_with(options(20, false));
        assert!(adapter.send_raw_request(0x09, &[0x03, 0x00, 0x00, 0x00, 0x01]));
        tokio::time::sleep(Duration::from_millis(40)).await;
        let mut frames = Vec::new();
        adapter.poll_frames(&mut frames);
        assert!(!adapter.is_awaiting_reply());

        device
            .write_all(&encode_rtu_frame(0x09, &[0x03, 0x02, 0x00, 0x01]))
            .await
            .unwrap();
        let frames = wait_frames(&mut adapter, 1).await;
        assert_eq!(frames[0].meta.direction, Direction::Response);

        // Answered, so the next unsolicited frame is not taken as a reply
        device
            .write_all(&encode_rtu_frame(0x09, &[0x03, 0x02, 0x00, 0x02]))
            .await
            .unwrap();
        let frames = wait_frames(&mut adapter, 1).await;
        assert_eq!(frames[0].meta.direction, Direction::Request);
    }

    #[tokio::test]
    async fn test_stalled_write_does_not_block_reception() {
        // 4 byte pipe: the 8 byte ADU cannot be written while the device is not reading
        let (line, mut device) = tokio::io::duplex(4);
        let mut adapter =
            RtuMasterAdapter::from_stream(line, options(1000, false), CancellationToken::new());
        assert!(adapter.send_raw_request(0x01, &[0x03, 0x00, 0x00, 0x00, 0x01]));
        device.write_all(&[0x01, 0x83, 0x0B, 0x00]).await.unwrap();

        let frames = wait_frames(&mut adapter, 1).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].meta.unit_id, 0x01);
    }

    #[test]
    fn test_options_from_config() {
        let config = SerialConfig {
            local_echo: true,
            ..Default::default()
        };
        let options = LineOptions::from(&config);
        assert!(options.local_echo);
        assert_eq!(options.turnaround_timeout, config.turnaround_timeout());
        assert_eq!(options.write_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_line_settings_mapping() {
        assert_eq!(data_bits(7), tokio_serial::DataBits::Seven);
        assert_eq!(stop_bits(2), tokio_serial::StopBits::Two);
        assert_eq!(parity("Even"), tokio_serial::Parity::Even);
        assert_eq!(parity("None"), tokio_serial::Parity::None);
    }
}
