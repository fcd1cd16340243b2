//! The Secondary wire protocol: a length-prefixed,
//! tag-discriminated binary framing over any `Read + Write` transport
//! (a Unix socket, a TCP stream, a pipe to a child process). Framing a
//! stream rather than fixed-size datagrams means payloads of any size
//! fit in one frame.
//!
//! Frame layout: `[tag: u16 BE][len: u32 BE][payload: len bytes]`, where
//! `payload` is `bincode`-encoded. This crate never runs the protocol
//! over the network itself; it is the contract a real Secondary process
//! (or test double) speaks against [`IpcSecondary`].

use std::io::{Read, Write};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::metadata::{EcuSerial, HardwareId, KeyKind, PublicKey};
use crate::secondary::{Firmware, MetaPack, Secondary};

const TAG_PUT_ROOT: u16 = 1;
const TAG_PUT_METADATA: u16 = 2;
const TAG_SEND_FIRMWARE: u16 = 3;
const TAG_GET_MANIFEST: u16 = 4;
const TAG_ACK: u16 = 5;
const TAG_MANIFEST: u16 = 6;
const TAG_ERROR: u16 = 7;

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

fn write_frame<W: Write>(writer: &mut W, tag: u16, payload: &[u8]) -> Result<(), Error> {
    if payload.len() as u64 > u64::from(MAX_FRAME_LEN) {
        return Err(Error::Secondary(format!("frame of {} bytes exceeds the {} byte limit", payload.len(), MAX_FRAME_LEN)));
    }
    writer.write_u16::<BigEndian>(tag).map_err(Error::Io)?;
    writer.write_u32::<BigEndian>(payload.len() as u32).map_err(Error::Io)?;
    writer.write_all(payload).map_err(Error::Io)?;
    writer.flush().map_err(Error::Io)
}

fn read_frame<R: Read>(reader: &mut R) -> Result<(u16, Vec<u8>), Error> {
    let tag = reader.read_u16::<BigEndian>().map_err(Error::Io)?;
    let len = reader.read_u32::<BigEndian>().map_err(Error::Io)?;
    if len > MAX_FRAME_LEN {
        return Err(Error::Secondary(format!("peer announced a {} byte frame, over the {} byte limit", len, MAX_FRAME_LEN)));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).map_err(Error::Io)?;
    Ok((tag, payload))
}

fn send<W: Write, T: Serialize>(writer: &mut W, tag: u16, msg: &T) -> Result<(), Error> {
    let payload = bincode::serialize(msg).map_err(|err| Error::Secondary(format!("encoding frame: {}", err)))?;
    write_frame(writer, tag, &payload)
}

fn expect_ack<S: Read + Write>(stream: &mut S) -> Result<(), Error> {
    let (tag, payload) = read_frame(stream)?;
    match tag {
        TAG_ACK => Ok(()),
        TAG_ERROR => {
            let message: String = bincode::deserialize(&payload).map_err(|err| Error::Secondary(format!("decoding error frame: {}", err)))?;
            Err(Error::Secondary(message))
        }
        other => Err(Error::Secondary(format!("unexpected reply tag {}", other))),
    }
}

/// A Secondary reached over the framed transport: every call is a
/// blocking request/response round trip. `serial`/`hwid`/`public_key`
/// are cached from the handshake performed at `new`, since the wire
/// protocol itself carries no identity query.
pub struct IpcSecondary<S: Read + Write> {
    stream: S,
    serial: EcuSerial,
    hwid: HardwareId,
    public_key: PublicKey,
}

#[derive(Serialize, Deserialize)]
struct Identity {
    serial: String,
    hwid: String,
    key_kind: String,
    key_encoded: String,
}

impl<S: Read + Write> IpcSecondary<S> {
    /// Read one `Identity` frame the peer sends unprompted on connect.
    pub fn handshake(mut stream: S) -> Result<IpcSecondary<S>, Error> {
        let (tag, payload) = read_frame(&mut stream)?;
        if tag != TAG_ACK {
            return Err(Error::Secondary(format!("expected identity handshake, got tag {}", tag)));
        }
        let identity: Identity = bincode::deserialize(&payload).map_err(|err| Error::Secondary(format!("decoding identity: {}", err)))?;
        let kind = match identity.key_kind.as_str() {
            "ed25519" => KeyKind::Ed25519,
            "rsa2048" => KeyKind::Rsa2048,
            "rsa3072" => KeyKind::Rsa3072,
            "rsa4096" => KeyKind::Rsa4096,
            _ => KeyKind::Unknown,
        };
        let public_key = PublicKey::new(kind, identity.key_encoded)?;
        Ok(IpcSecondary { stream, serial: EcuSerial(identity.serial), hwid: HardwareId(identity.hwid), public_key })
    }
}

impl<S: Read + Write + Send> Secondary for IpcSecondary<S> {
    fn serial(&self) -> EcuSerial {
        self.serial.clone()
    }

    fn hwid(&self) -> HardwareId {
        self.hwid.clone()
    }

    fn public_key(&self) -> PublicKey {
        self.public_key.clone()
    }

    fn put_root(&mut self, root_bytes: &[u8], _timeout: Duration) -> Result<(), Error> {
        send(&mut self.stream, TAG_PUT_ROOT, &root_bytes.to_vec())?;
        expect_ack(&mut self.stream)
    }

    fn put_metadata(&mut self, pack: &MetaPack, _timeout: Duration) -> Result<(), Error> {
        send(&mut self.stream, TAG_PUT_METADATA, pack)?;
        expect_ack(&mut self.stream)
    }

    fn send_firmware(&mut self, firmware: &Firmware, _timeout: Duration) -> Result<(), Error> {
        send(&mut self.stream, TAG_SEND_FIRMWARE, firmware)?;
        expect_ack(&mut self.stream)
    }

    fn get_manifest(&mut self, _timeout: Duration) -> Result<Value, Error> {
        send(&mut self.stream, TAG_GET_MANIFEST, &())?;
        let (tag, payload) = read_frame(&mut self.stream)?;
        match tag {
            TAG_MANIFEST => {
                let bytes: Vec<u8> = bincode::deserialize(&payload).map_err(|err| Error::Secondary(format!("decoding manifest frame: {}", err)))?;
                serde_json::from_slice(&bytes).map_err(Error::Json)
            }
            TAG_ERROR => {
                let message: String = bincode::deserialize(&payload).map_err(|err| Error::Secondary(format!("decoding error frame: {}", err)))?;
                Err(Error::Secondary(message))
            }
            other => Err(Error::Secondary(format!("unexpected reply tag {}", other))),
        }
    }
}

/// An in-process Secondary for single-ECU devices and tests, where the
/// "Secondary" is really just another package manager running in the
/// same address space.
pub struct LocalSecondary {
    serial: EcuSerial,
    hwid: HardwareId,
    key: crate::metadata::PrivateKey,
    public_key: PublicKey,
    pacman: Box<dyn crate::pacman::PackageManager>,
    last_installed: Option<crate::metadata::Target>,
}

impl LocalSecondary {
    pub fn new(
        serial: EcuSerial,
        hwid: HardwareId,
        key: crate::metadata::PrivateKey,
        public_key: PublicKey,
        pacman: Box<dyn crate::pacman::PackageManager>,
    ) -> LocalSecondary {
        LocalSecondary { serial, hwid, key, public_key, pacman, last_installed: None }
    }
}

impl Secondary for LocalSecondary {
    fn serial(&self) -> EcuSerial {
        self.serial.clone()
    }

    fn hwid(&self) -> HardwareId {
        self.hwid.clone()
    }

    fn public_key(&self) -> PublicKey {
        self.public_key.clone()
    }

    fn put_root(&mut self, _root_bytes: &[u8], _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }

    fn put_metadata(&mut self, _pack: &MetaPack, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }

    fn send_firmware(&mut self, firmware: &Firmware, _timeout: Duration) -> Result<(), Error> {
        match firmware {
            Firmware::Bytes(_) | Firmware::OstreeCredentials { .. } => Ok(()),
        }
    }

    fn get_manifest(&mut self, _timeout: Duration) -> Result<Value, Error> {
        let installed = self.pacman.installed_version()?;
        let target = self.last_installed.clone();
        let body = crate::manifest::ecu_manifest_body(&crate::manifest::EcuManifestInput {
            ecu: &self.serial,
            installed: target.as_ref().filter(|t| installed.as_deref() == Some(t.filename.as_str())),
            attacks_detected: "",
            raw_report: None,
            now: chrono::Utc::now(),
        });
        crate::manifest::sign_envelope(&self.key, body)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn frame_round_trips_through_a_byte_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, TAG_PUT_ROOT, b"hello").unwrap();
        let mut cursor = Cursor::new(buf);
        let (tag, payload) = read_frame(&mut cursor).unwrap();
        assert_eq!(tag, TAG_PUT_ROOT);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn oversized_frame_is_rejected_before_allocating() {
        let mut buf = Vec::new();
        buf.write_u16::<BigEndian>(TAG_PUT_ROOT).unwrap();
        buf.write_u32::<BigEndian>(MAX_FRAME_LEN + 1).unwrap();
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::Secondary(_)));
    }

    #[test]
    fn put_metadata_round_trip_over_a_loopback_buffer() {
        struct Loopback {
            read_buf: Cursor<Vec<u8>>,
            write_buf: Vec<u8>,
        }
        impl Read for Loopback {
            fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
                self.read_buf.read(out)
            }
        }
        impl Write for Loopback {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.write_buf.write(data)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut reply = Vec::new();
        write_frame(&mut reply, TAG_ACK, &[]).unwrap();
        let mut stream = Loopback { read_buf: Cursor::new(reply), write_buf: Vec::new() };

        send(&mut stream, TAG_PUT_METADATA, &MetaPack::default()).unwrap();
        expect_ack(&mut stream).unwrap();
        assert!(!stream.write_buf.is_empty());
    }
}
