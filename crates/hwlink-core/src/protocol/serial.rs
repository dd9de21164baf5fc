//! Serial port handling
//!
//! Provides the serial [`Transport`] and USB device discovery.

use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serialport::{SerialPortInfo, SerialPortType};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::transport::{Transport, TransportEvent};
use super::ProtocolError;

/// Vendor id of current-generation devices
pub const VENDOR_ID_CURRENT: u16 = 0x0483;

/// Vendor id of first-generation devices
pub const VENDOR_ID_LEGACY: u16 = 0x3503;

const READ_BUFFER_SIZE: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn named(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Nodes the enumeration API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::named(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// A recognised device attached to a serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Port the device is attached to
    pub port: PortInfo,
    /// High byte of the USB product id
    pub hardware_version: u8,
    /// Normalised device state: 0 bootloader, 1 initial, 2 main firmware
    pub device_state: u8,
}

impl DeviceInfo {
    /// Whether the device runs its bootloader and speaks no packet protocol
    pub fn in_bootloader(&self) -> bool {
        self.device_state == 0
    }
}

/// Recognise a supported device from its USB ids
pub fn identify_device(port: &PortInfo) -> Option<DeviceInfo> {
    let (vid, pid) = (port.vid?, port.pid?);
    let hardware_version = (pid >> 8) as u8;
    let state = (pid & 0xFF) as u8;

    let device_state = match vid {
        VENDOR_ID_CURRENT if hardware_version == 0x02 && state <= 0x02 => state,
        VENDOR_ID_LEGACY if hardware_version == 0x01 && (0x01..=0x03).contains(&state) => state - 1,
        _ => return None,
    };

    Some(DeviceInfo {
        port: port.clone(),
        hardware_version,
        device_state,
    })
}

/// First supported device in [`list_ports`] order
pub fn find_device() -> Result<DeviceInfo, ProtocolError> {
    list_ports()
        .iter()
        .find_map(identify_device)
        .ok_or(ProtocolError::NotConnected)
}

struct Reader {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// [`Transport`] over a serial port
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    events: mpsc::Sender<TransportEvent>,
    writer: tokio::sync::Mutex<Option<WriteHalf<SerialStream>>>,
    reader: Mutex<Option<Reader>>,
    open: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Create a closed transport for `path` and the receiver of its events
    pub fn new(path: &str, baud_rate: u32) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(Self {
            path: path.to_string(),
            baud_rate,
            events,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
        });
        (transport, rx)
    }

    /// Path of the serial port
    pub fn path(&self) -> &str {
        &self.path
    }

    fn stop_reader(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.cancel.cancel();
            reader.task.abort();
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&self) -> io::Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let mut stream = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(io::Error::from)?;

        // Keep DTR asserted so opening the port does not reset the device
        if let Err(e) = stream.write_data_terminal_ready(true) {
            debug!("Failed to set DTR high: {} (continuing)", e);
        }

        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);

        self.open.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(read_loop(
            read_half,
            self.events.clone(),
            Arc::clone(&self.open),
            Arc::clone(&self.connected),
            cancel.clone(),
        ));
        *self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Reader { cancel, task });

        info!(path = %self.path, baud_rate = self.baud_rate, "Serial port opened");
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.stop_reader();
        self.open.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }

        info!(path = %self.path, "Serial port closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is not open"))?;
        writer.write_all(data).await?;
        writer.flush().await
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

async fn read_loop(
    mut reader: ReadHalf<SerialStream>,
    events: mpsc::Sender<TransportEvent>,
    open: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };

        let reason = match read {
            Ok(0) => None,
            Ok(n) => {
                if events.send(TransportEvent::Data(buf[..n].to_vec())).await.is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                error!("Serial read failed: {}", e);
                Some(e.to_string())
            }
        };

        open.store(false, Ordering::SeqCst);
        connected.store(false, Ordering::SeqCst);
        let _ = events.send(TransportEvent::Closed(reason)).await;
        break;
    }
}
