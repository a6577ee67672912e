//! Device discovery: checking that an address hosts an instrument and reading
//! its identity before a session is started.
//!
//! The probe is one-shot and stateless. It opens its own short-lived link,
//! sends an Identify command and waits for the DeviceInfo reply.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Serialize, Serializer};

use crate::codec::{Command, Decoded, FrameDecoder, InboundFrame};
use crate::errors::{DriverError, Result};
use crate::transport::{Connector, TcpConnector, Transport};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Firmware version reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = DriverError;

    /// Accepts `1.4`, `1.4.2` or `v1.4.2`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches(['v', 'V']);
        let mut parts = [0u8; 3];
        let mut count = 0;
        for (i, part) in trimmed.split('.').enumerate() {
            if i >= 3 {
                return Err(DriverError::Protocol(format!("invalid firmware version: {s}")));
            }
            parts[i] = part
                .parse()
                .map_err(|_| DriverError::Protocol(format!("invalid firmware version: {s}")))?;
            count += 1;
        }
        if count < 2 {
            return Err(DriverError::Protocol(format!("invalid firmware version: {s}")));
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

/// Hardware address of the device's network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Identity of an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub mac: MacAddress,
    pub firmware: FirmwareVersion,
}

/// One-shot identity lookup, run before connecting a session.
pub struct DeviceProbe {
    connector: Arc<dyn Connector>,
    timeout: Duration,
}

impl Default for DeviceProbe {
    fn default() -> Self {
        Self::new(Arc::new(TcpConnector::default()), DEFAULT_PROBE_TIMEOUT)
    }
}

impl DeviceProbe {
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    /// Whether `address` answers the identity probe.
    pub async fn identify(&self, address: &str) -> bool {
        match self.device_info(address).await {
            Ok(_) => true,
            Err(e) => {
                warn!("device identification failed: address={}, error={}", address, e);
                false
            }
        }
    }

    /// Read serial number, MAC address and firmware version.
    pub async fn device_info(&self, address: &str) -> Result<DeviceInfo> {
        let info = tokio::time::timeout(self.timeout, self.query(address))
            .await
            .map_err(|_| {
                DriverError::Timeout(format!("no identity reply from {address} within {:?}", self.timeout))
            })??;
        info!(
            "identified device: address={}, serial={}, mac={}, firmware={}",
            address, info.serial, info.mac, info.firmware
        );
        Ok(info)
    }

    async fn query(&self, address: &str) -> Result<DeviceInfo> {
        let link = self.connector.open(address).await?;
        let mut transport = Transport::new(link, self.timeout);
        transport.send(&Command::Identify.encode()).await?;

        let mut decoder = FrameDecoder::new();
        loop {
            loop {
                match decoder.next_inbound() {
                    Decoded::Frame(InboundFrame::DeviceInfo(info)) => {
                        let _ = transport.close().await;
                        return Ok(info);
                    }
                    Decoded::Frame(other) => {
                        debug!("ignoring frame kind={:#04X} during probe", other.kind());
                    }
                    Decoded::Malformed(e) => warn!("malformed frame during probe: {}", e),
                    Decoded::NeedMoreData => break,
                }
            }
            let chunk = transport.recv().await?;
            decoder.feed(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BoxedLink;
    use futures::future::BoxFuture;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Answers every Identify with a fixed DeviceInfo, or stays silent.
    struct FakeInstrument {
        info: Option<DeviceInfo>,
    }

    impl Connector for FakeInstrument {
        fn open<'a>(&'a self, _endpoint: &'a str) -> BoxFuture<'a, std::io::Result<BoxedLink>> {
            let info = self.info.clone();
            Box::pin(async move {
                let (host, mut device) = tokio::io::duplex(1024);
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let _ = device.read(&mut buf).await;
                    if let Some(info) = info {
                        let _ = device.write_all(&InboundFrame::DeviceInfo(info).encode()).await;
                    }
                    // Hold the link open until the host hangs up.
                    let _ = device.read(&mut buf).await;
                });
                Ok(Box::new(host) as BoxedLink)
            })
        }
    }

    fn sample_info() -> DeviceInfo {
        DeviceInfo {
            serial: "A1052-0042".into(),
            mac: MacAddress([0x00, 0x1B, 0x63, 0x84, 0x45, 0xE6]),
            firmware: FirmwareVersion::new(1, 4, 2),
        }
    }

    #[tokio::test]
    async fn probe_reads_device_identity() {
        let probe = DeviceProbe::new(
            Arc::new(FakeInstrument {
                info: Some(sample_info()),
            }),
            Duration::from_secs(1),
        );
        assert!(probe.identify("192.168.137.123").await);
        let info = probe.device_info("192.168.137.123").await.unwrap();
        assert_eq!(info, sample_info());
        assert_eq!(info.mac.to_string(), "00:1B:63:84:45:E6");
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let probe = DeviceProbe::new(
            Arc::new(FakeInstrument { info: None }),
            Duration::from_millis(100),
        );
        assert!(matches!(
            probe.device_info("10.0.0.9").await,
            Err(DriverError::Timeout(_))
        ));
        assert!(!probe.identify("10.0.0.9").await);
    }

    #[test]
    fn firmware_versions_parse_and_order() {
        let v: FirmwareVersion = "v1.4.2".parse().unwrap();
        assert_eq!(v, FirmwareVersion::new(1, 4, 2));
        assert_eq!("2.0".parse::<FirmwareVersion>().unwrap(), FirmwareVersion::new(2, 0, 0));
        assert!("1".parse::<FirmwareVersion>().is_err());
        assert!("1.2.3.4".parse::<FirmwareVersion>().is_err());
        assert!(FirmwareVersion::new(1, 10, 0) > FirmwareVersion::new(1, 9, 9));
    }
}
