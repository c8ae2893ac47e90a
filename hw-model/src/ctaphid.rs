// Licensed under the Apache-2.0 license

//! Just enough CTAPHID to ask a device for its serial number.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crate::{HwModelError, Result};

pub const PACKET_SIZE: usize = 64;
const INIT_DATA_SIZE: usize = PACKET_SIZE - 7;
const CONT_DATA_SIZE: usize = PACKET_SIZE - 5;

const CID_BROADCAST: u32 = 0xffff_ffff;
const TYPE_INIT: u8 = 0x80;

pub const CTAPHID_INIT: u8 = 0x06;
pub const CTAPHID_ERROR: u8 = 0x3f;
pub const CTAPHID_KEEPALIVE: u8 = 0x3b;
/// Vendor command returning the 16 byte device UUID.
pub const CTAPHID_VENDOR_UUID: u8 = 0x62;

/// A CTAPHID channel on top of a raw HID report stream.
pub struct CtapHidDevice<D> {
    dev: D,
    cid: u32,
}

impl<D: Read + Write> CtapHidDevice<D> {
    /// Allocates a channel using `nonce` for the INIT handshake.
    pub fn init(dev: D, nonce: [u8; 8]) -> Result<Self> {
        let mut result = Self {
            dev,
            cid: CID_BROADCAST,
        };
        let response = result.call(CTAPHID_INIT, &nonce)?;
        if response.len() < 17 || response[..8] != nonce {
            return Err(HwModelError::CtapHid(format!(
                "invalid INIT response {response:02x?}"
            )));
        }
        result.cid = u32::from_be_bytes([response[8], response[9], response[10], response[11]]);
        Ok(result)
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// Sends `cmd` with `data` and returns the response payload.
    pub fn call(&mut self, cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.send(cmd, data)?;
        self.recv(cmd)
    }

    fn send(&mut self, cmd: u8, data: &[u8]) -> Result<()> {
        let len = u16::try_from(data.len())
            .map_err(|_| HwModelError::CtapHid(format!("payload too long: {}", data.len())))?;
        let (first, mut rest) = data.split_at(data.len().min(INIT_DATA_SIZE));

        // hidraw writes are prefixed with the report number
        let mut report = [0u8; PACKET_SIZE + 1];
        report[1..5].copy_from_slice(&self.cid.to_be_bytes());
        report[5] = TYPE_INIT | cmd;
        report[6..8].copy_from_slice(&len.to_be_bytes());
        report[8..8 + first.len()].copy_from_slice(first);
        self.dev.write_all(&report)?;

        let mut seq = 0u8;
        while !rest.is_empty() {
            let (chunk, remainder) = rest.split_at(rest.len().min(CONT_DATA_SIZE));
            let mut report = [0u8; PACKET_SIZE + 1];
            report[1..5].copy_from_slice(&self.cid.to_be_bytes());
            report[5] = seq;
            report[6..6 + chunk.len()].copy_from_slice(chunk);
            self.dev.write_all(&report)?;
            seq += 1;
            rest = remainder;
        }
        Ok(())
    }

    fn read_packet(&mut self) -> Result<[u8; PACKET_SIZE]> {
        let mut packet = [0u8; PACKET_SIZE];
        self.dev.read_exact(&mut packet)?;
        Ok(packet)
    }

    fn recv(&mut self, cmd: u8) -> Result<Vec<u8>> {
        let packet = loop {
            let packet = self.read_packet()?;
            if u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) != self.cid {
                continue;
            }
            match packet[4] {
                c if c == TYPE_INIT | CTAPHID_KEEPALIVE => continue,
                c if c == TYPE_INIT | CTAPHID_ERROR => {
                    return Err(HwModelError::CtapHid(format!(
                        "device returned error {:#04x}",
                        packet[7]
                    )));
                }
                c if c == TYPE_INIT | cmd => break packet,
                c => {
                    return Err(HwModelError::CtapHid(format!(
                        "unexpected response command {c:#04x} to {:#04x}",
                        TYPE_INIT | cmd
                    )));
                }
            }
        };
        let len = usize::from(u16::from_be_bytes([packet[5], packet[6]]));
        let mut data = packet[7..7 + len.min(INIT_DATA_SIZE)].to_vec();
        let mut seq = 0u8;
        while data.len() < len {
            let packet = self.read_packet()?;
            if u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) != self.cid {
                continue;
            }
            if packet[4] != seq {
                return Err(HwModelError::CtapHid(format!(
                    "expected continuation packet {seq}, got {}",
                    packet[4]
                )));
            }
            let n = (len - data.len()).min(CONT_DATA_SIZE);
            data.extend_from_slice(&packet[5..5 + n]);
            seq += 1;
        }
        Ok(data)
    }
}

pub fn open_device(path: &Path) -> Result<CtapHidDevice<File>> {
    let dev = OpenOptions::new().read(true).write(true).open(path)?;
    CtapHidDevice::init(dev, rand::random())
}

/// Queries the device UUID of `/dev/<hidraw>` and renders it as upper hex.
pub fn get_serial(dev_dir: &Path, hidraw: &str) -> Result<String> {
    let mut dev = open_device(&dev_dir.join(hidraw))?;
    let serial = dev.call(CTAPHID_VENDOR_UUID, &[])?;
    Ok(hex::encode_upper(serial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    const CID: u32 = 0x0102_0304;

    #[derive(Default)]
    struct FakeHidraw {
        written: Vec<Vec<u8>>,
        responses: VecDeque<[u8; PACKET_SIZE]>,
    }
    impl FakeHidraw {
        fn respond_init(&mut self, cid: u32, cmd: u8, payload: &[u8]) {
            let mut packet = [0u8; PACKET_SIZE];
            packet[..4].copy_from_slice(&cid.to_be_bytes());
            packet[4] = TYPE_INIT | cmd;
            packet[5..7].copy_from_slice(&(payload.len() as u16).to_be_bytes());
            let n = payload.len().min(INIT_DATA_SIZE);
            packet[7..7 + n].copy_from_slice(&payload[..n]);
            self.responses.push_back(packet);
            for (seq, chunk) in payload[n..].chunks(CONT_DATA_SIZE).enumerate() {
                let mut packet = [0u8; PACKET_SIZE];
                packet[..4].copy_from_slice(&cid.to_be_bytes());
                packet[4] = seq as u8;
                packet[5..5 + chunk.len()].copy_from_slice(chunk);
                self.responses.push_back(packet);
            }
        }
    }
    impl Write for FakeHidraw {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.push(buf.to_vec());
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl Read for FakeHidraw {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let packet = self
                .responses
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            buf[..PACKET_SIZE].copy_from_slice(&packet);
            Ok(PACKET_SIZE)
        }
    }

    fn init_response(nonce: [u8; 8]) -> Vec<u8> {
        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&CID.to_be_bytes());
        payload.extend_from_slice(&[2, 1, 0, 0, 0x05]);
        payload
    }

    #[test]
    fn test_init_and_uuid() {
        let nonce = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut fake = FakeHidraw::default();
        fake.respond_init(CID_BROADCAST, CTAPHID_INIT, &init_response(nonce));
        fake.respond_init(CID, CTAPHID_KEEPALIVE, &[1]);
        fake.respond_init(CID, CTAPHID_VENDOR_UUID, &[0xab; 16]);

        let mut dev = CtapHidDevice::init(fake, nonce).unwrap();
        assert_eq!(dev.cid(), CID);
        let uuid = dev.call(CTAPHID_VENDOR_UUID, &[]).unwrap();
        assert_eq!(hex::encode_upper(uuid), "AB".repeat(16));

        let written = &dev.dev.written;
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].len(), PACKET_SIZE + 1);
        assert_eq!(written[0][..8], [0, 0xff, 0xff, 0xff, 0xff, 0x86, 0, 8]);
        assert_eq!(written[0][8..16], nonce);
        assert_eq!(written[1][..8], [0, 1, 2, 3, 4, 0xe2, 0, 0]);
    }

    #[test]
    fn test_init_nonce_mismatch() {
        let mut fake = FakeHidraw::default();
        fake.respond_init(CID_BROADCAST, CTAPHID_INIT, &init_response([9; 8]));
        assert!(matches!(
            CtapHidDevice::init(fake, [1; 8]),
            Err(HwModelError::CtapHid(_))
        ));
    }

    #[test]
    fn test_error_response() {
        let nonce = [7; 8];
        let mut fake = FakeHidraw::default();
        fake.respond_init(CID_BROADCAST, CTAPHID_INIT, &init_response(nonce));
        fake.respond_init(CID, CTAPHID_ERROR, &[0x01]);
        let mut dev = CtapHidDevice::init(fake, nonce).unwrap();
        assert_eq!(
            dev.call(CTAPHID_VENDOR_UUID, &[]).unwrap_err().to_string(),
            "CTAPHID: device returned error 0x01"
        );
    }

    #[test]
    fn test_fragmented_request_and_response() {
        let nonce = [3; 8];
        let payload: Vec<u8> = (0..100).collect();
        let mut fake = FakeHidraw::default();
        fake.respond_init(CID_BROADCAST, CTAPHID_INIT, &init_response(nonce));
        fake.respond_init(CID, 0x01, &payload);
        let mut dev = CtapHidDevice::init(fake, nonce).unwrap();
        assert_eq!(dev.call(0x01, &payload).unwrap(), payload);
        // INIT + one init packet and one continuation packet for the ping
        assert_eq!(dev.dev.written.len(), 3);
        assert_eq!(dev.dev.written[2][5], 0);
    }
}
