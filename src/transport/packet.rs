use std::fmt::{Debug, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tempfile::TempPath;

use crate::transport::error::ProtocolViolation;
use crate::util::safe_converter::SafeCast;

/// The fixed per-packet header. All numbers are in network byte order.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub sequence: u64,
    pub buffer_size: u32,
    pub file_count: u32,
}

impl PacketHeader {
    pub const MAGIC: u16 = 0x1717;
    pub const PROTOCOL_VERSION: u16 = 0x1;
    pub const SERIALIZED_LEN: usize = 20;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(Self::MAGIC);
        buf.put_u16(Self::PROTOCOL_VERSION);
        buf.put_u64(self.sequence);
        buf.put_u32(self.buffer_size);
        buf.put_u32(self.file_count);
    }

    /// NB: The caller must provide the full header - accumulating the 20 bytes
    ///  across partial reads is the framing layer's job
    pub fn deser(buf: &mut impl Buf) -> Result<PacketHeader, ProtocolViolation> {
        let magic = buf.get_u16();
        if magic != Self::MAGIC {
            return Err(ProtocolViolation::BadMagic(magic));
        }
        let version = buf.get_u16();
        if version != Self::PROTOCOL_VERSION {
            return Err(ProtocolViolation::UnsupportedVersion(version));
        }

        Ok(PacketHeader {
            sequence: buf.get_u64(),
            buffer_size: buf.get_u32(),
            file_count: buf.get_u32(),
        })
    }
}


/// A file carried inline in a packet. On the sending side this references a
///  file the application owns; on the receiving side it references a file the
///  framing layer materialized, and (unless configured otherwise) owns its
///  deletion: dropping the packet removes the file from disk.
pub struct PacketFile {
    path: PathBuf,
    len: u64,
    temp: Option<TempPath>,
}

impl PacketFile {
    pub fn from_path(path: impl Into<PathBuf>) -> anyhow::Result<PacketFile> {
        let path = path.into();
        let len = fs::metadata(&path)
            .with_context(|| format!("reading metadata of {:?}", path))?
            .len();
        Ok(PacketFile { path, len, temp: None })
    }

    pub(crate) fn received(temp: TempPath, len: u64) -> PacketFile {
        PacketFile {
            path: temp.to_path_buf(),
            len,
            temp: Some(temp),
        }
    }

    pub(crate) fn received_kept(path: PathBuf, len: u64) -> PacketFile {
        PacketFile { path, len, temp: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Detach the file from the packet's lifetime so it survives the drop.
    pub fn keep(mut self) -> anyhow::Result<PathBuf> {
        if let Some(temp) = self.temp.take() {
            temp.keep().context("persisting received file")?;
        }
        Ok(self.path)
    }
}

impl Debug for PacketFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketFile{{{:?}, {} bytes}}", self.path, self.len)
    }
}


/// One logical unit of exchange: an ordered sequence of byte buffers plus an
///  optional ordered sequence of files. `buffer_size` counts only buffer
///  bytes - files are out of band and carried by length.
pub struct Packet {
    buffers: Vec<Bytes>,
    files: Vec<PacketFile>,
}

impl Packet {
    pub fn new() -> Packet {
        Packet {
            buffers: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn from_buffer(buf: impl Into<Bytes>) -> Packet {
        let mut packet = Packet::new();
        packet.add_buffer(buf);
        packet
    }

    pub fn add_buffer(&mut self, buf: impl Into<Bytes>) {
        self.buffers.push(buf.into());
    }

    pub fn add_file(&mut self, path: impl Into<PathBuf>) -> anyhow::Result<()> {
        self.files.push(PacketFile::from_path(path)?);
        Ok(())
    }

    pub(crate) fn add_received_file(&mut self, file: PacketFile) {
        self.files.push(file);
    }

    pub fn buffers(&self) -> &[Bytes] {
        &self.buffers
    }

    pub(crate) fn take_buffers(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.buffers)
    }

    pub fn files(&self) -> &[PacketFile] {
        &self.files
    }

    pub(crate) fn take_files(&mut self) -> Vec<PacketFile> {
        std::mem::take(&mut self.files)
    }

    /// total buffer payload in bytes, as it will appear in the header's
    ///  `buffer_size` field (pending the u32 range check at framing time)
    pub fn buffer_size(&self) -> u64 {
        self.buffers.iter().map(|b| b.len().safe_cast()).sum()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(|b| b.is_empty()) && self.files.is_empty()
    }
}

impl Default for Packet {
    fn default() -> Self {
        Packet::new()
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Packet{{{} buffers / {} bytes, {} files}}",
            self.buffers.len(),
            self.buffer_size(),
            self.files.len()
        )
    }
}


#[cfg(test)]
mod test {
    use std::io::Write;

    use bytes::BytesMut;
    use rstest::rstest;

    use crate::transport::error::ProtocolViolation;

    use super::*;

    #[rstest]
    #[case::zero(0, 0, 0, b"\x17\x17\0\x01\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0")]
    #[case::seq(5, 0, 0, b"\x17\x17\0\x01\0\0\0\0\0\0\0\x05\0\0\0\0\0\0\0\0")]
    #[case::buffer(0, 20, 0, b"\x17\x17\0\x01\0\0\0\0\0\0\0\0\0\0\0\x14\0\0\0\0")]
    #[case::files(7, 0x1020304, 2, b"\x17\x17\0\x01\0\0\0\0\0\0\0\x07\x01\x02\x03\x04\0\0\0\x02")]
    fn test_header_ser(#[case] sequence: u64, #[case] buffer_size: u32, #[case] file_count: u32, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        PacketHeader { sequence, buffer_size, file_count }.ser(&mut buf);
        assert_eq!(&buf, expected);
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN);

        let deserialized = PacketHeader::deser(&mut buf).unwrap();
        assert_eq!(deserialized, PacketHeader { sequence, buffer_size, file_count });
    }

    #[rstest]
    #[case::bad_magic(b"\x18\x17\0\x01\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0", ProtocolViolation::BadMagic(0x1817))]
    #[case::swapped_magic(b"\x17\x18\0\x01\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0", ProtocolViolation::BadMagic(0x1718))]
    #[case::bad_version(b"\x17\x17\0\x02\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0", ProtocolViolation::UnsupportedVersion(2))]
    fn test_header_deser_rejects(#[case] mut raw: &[u8], #[case] expected: ProtocolViolation) {
        assert_eq!(PacketHeader::deser(&mut raw), Err(expected));
    }

    #[test]
    fn test_packet_accounting() {
        let mut packet = Packet::new();
        assert!(packet.is_empty());
        assert_eq!(packet.buffer_size(), 0);

        packet.add_buffer(&b"hello"[..]);
        packet.add_buffer(&b", world"[..]);
        assert_eq!(packet.buffer_size(), 12);
        assert_eq!(packet.file_count(), 0);
        assert!(!packet.is_empty());
    }

    #[test]
    fn test_packet_file_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let packet_file = PacketFile::from_path(file.path()).unwrap();
        assert_eq!(packet_file.len(), 10);
        assert_eq!(packet_file.path(), file.path());
    }

    #[test]
    fn test_received_file_deleted_on_drop() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (_, temp_path) = file.into_parts();
        let path = temp_path.to_path_buf();

        let packet_file = PacketFile::received(temp_path, 0);
        assert!(path.exists());
        drop(packet_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_received_file_survives_keep() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (_, temp_path) = file.into_parts();

        let packet_file = PacketFile::received(temp_path, 0);
        let path = packet_file.keep().unwrap();
        assert!(path.exists());
        std::fs::remove_file(path).unwrap();
    }
}
